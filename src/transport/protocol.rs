//! Live voice-agent protocol types
//!
//! JSON messages exchanged with a Gemini Live style agent over WebSocket.
//!
//! # Protocol Overview
//!
//! 1. Connect to `wss://.../BidiGenerateContent?key=API_KEY`
//! 2. Send `setup` (model, system instruction, voice, tool declarations)
//! 3. Receive `setupComplete`
//! 4. Stream microphone audio via `realtimeInput.mediaChunks`
//! 5. Receive `serverContent` (audio parts, `interrupted`, `turnComplete`)
//!    and `toolCall` requests, answer with `toolResponse`
//! 6. Send `realtimeInput.audioStreamEnd` and close

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{AgentConfig, AgentEvent};
use crate::audio::{AudioFrame, AudioSource, AGENT_SAMPLE_RATE};
use crate::tools::{ToolCallRequest, ToolDeclaration};

/// Default Gemini Live endpoint
pub const LIVE_API_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent";

/// MIME type prefix for raw PCM16 audio
const PCM_MIME_PREFIX: &str = "audio/pcm";

/// `audio/pcm;rate=<rate>`
pub fn pcm_mime(sample_rate: u32) -> String {
    format!("{};rate={}", PCM_MIME_PREFIX, sample_rate)
}

/// Sample rate declared in a PCM MIME type, if any.
pub fn parse_pcm_rate(mime: &str) -> Option<u32> {
    mime.split(';')
        .skip(1)
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse().ok())
}

// ============================================================================
// Client Messages (sent TO the agent)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    /// Base64 payload
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSet {
    pub function_declarations: Vec<ToolDeclaration>,
}

/// The `setup` payload
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupConfig {
    pub model: String,
    pub system_instruction: Content,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSet>,
}

impl SetupConfig {
    pub fn from_agent_config(config: &AgentConfig) -> Self {
        let tools = if config.tools.is_empty() {
            Vec::new()
        } else {
            vec![ToolSet {
                function_declarations: config.tools.clone(),
            }]
        };
        Self {
            model: config.model.clone(),
            system_instruction: Content {
                role: None,
                parts: vec![Part {
                    text: Some(config.system_instruction.clone()),
                    inline_data: None,
                }],
            },
            generation_config: GenerationConfig {
                response_modalities: vec![config.response_modality.as_str().to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice.clone(),
                        },
                    },
                },
            },
            tools,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub media_chunks: Vec<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_stream_end: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

/// Messages sent from client to agent
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(SetupConfig),
    RealtimeInput(RealtimeInput),
    ClientContent(ClientContent),
    ToolResponse(ToolResponse),
}

impl ClientMessage {
    pub fn setup(config: &AgentConfig) -> Self {
        Self::Setup(SetupConfig::from_agent_config(config))
    }

    /// One microphone frame as a base64 media chunk
    pub fn audio_chunk(frame: &AudioFrame) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: pcm_mime(frame.sample_rate()),
                data: STANDARD.encode(frame.to_pcm16_le()),
            }],
            audio_stream_end: None,
        })
    }

    pub fn audio_stream_end() -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: Vec::new(),
            audio_stream_end: Some(true),
        })
    }

    /// A complete user text turn
    pub fn user_text(text: &str) -> Self {
        Self::ClientContent(ClientContent {
            turns: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: Some(text.to_string()),
                    inline_data: None,
                }],
            }],
            turn_complete: true,
        })
    }

    pub fn tool_response(call_id: &str, name: &str, payload: Value) -> Self {
        Self::ToolResponse(ToolResponse {
            function_responses: vec![FunctionResponse {
                id: call_id.to_string(),
                name: name.to_string(),
                response: payload,
            }],
        })
    }
}

// ============================================================================
// Server Messages (received FROM the agent)
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, alias = "arguments")]
    pub args: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallPayload {
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolCallCancellation {
    #[serde(default)]
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorInfo {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: String,
}

/// Any message the agent may send.
///
/// The agent sends one top-level key per message. Every key is optional here
/// so unknown or future messages parse to an empty value instead of failing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub tool_call: Option<ToolCallPayload>,
    #[serde(default)]
    pub tool_call_cancellation: Option<ToolCallCancellation>,
    /// Singular tool-call shape
    #[serde(default)]
    pub function_call: Option<FunctionCall>,
    /// Legacy flat tool-call shape: `{name, arguments, call_id}`
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<Value>,
    #[serde(default, rename = "call_id", alias = "callId")]
    pub call_id: Option<String>,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    #[serde(default)]
    pub go_away: Option<Value>,
}

impl ServerMessage {
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Every tool call in this message, whatever shape it arrived in.
    pub fn tool_calls(&self) -> Vec<ToolCallRequest> {
        let mut calls: Vec<ToolCallRequest> = Vec::new();
        if let Some(payload) = &self.tool_call {
            calls.extend(payload.function_calls.iter().map(normalize_call));
        }
        if let Some(call) = &self.function_call {
            calls.push(normalize_call(call));
        }
        if let (Some(name), None, None) = (&self.name, &self.server_content, &self.tool_call) {
            calls.push(ToolCallRequest {
                call_id: self.call_id.clone().unwrap_or_default(),
                name: name.clone(),
                args: argument_map(self.arguments.as_ref().unwrap_or(&Value::Null)),
            });
        }
        calls
    }

    /// Translate into session events, in the order they appear on the wire.
    ///
    /// `offset` is the session-relative arrival time stamped on audio frames.
    pub fn into_events(self, offset: Duration) -> Vec<AgentEvent> {
        let mut events = Vec::new();

        if let Some(error) = &self.error {
            events.push(AgentEvent::Error(if error.message.is_empty() {
                format!("agent error {:?}", error.code)
            } else {
                error.message.clone()
            }));
        }

        if self.setup_complete.is_some() {
            events.push(AgentEvent::Ready);
        }

        let calls = self.tool_calls();
        if !calls.is_empty() {
            events.push(AgentEvent::ToolCall(calls));
        }

        if let Some(cancel) = self.tool_call_cancellation {
            if !cancel.ids.is_empty() {
                events.push(AgentEvent::ToolCallCancelled(cancel.ids));
            }
        }

        if let Some(content) = self.server_content {
            let mut frame_offset = offset;
            for part in content.model_turn.map(|t| t.parts).unwrap_or_default() {
                if let Some(text) = part.text {
                    events.push(AgentEvent::Text(text));
                }
                if let Some(blob) = part.inline_data {
                    if let Some(frame) = decode_audio(&blob, frame_offset) {
                        frame_offset += frame.duration();
                        events.push(AgentEvent::AudioData(frame));
                    }
                }
            }
            if content.interrupted {
                events.push(AgentEvent::Interrupted);
            }
            if content.turn_complete {
                events.push(AgentEvent::TurnComplete);
            }
        }

        if self.go_away.is_some() {
            log::warn!("Transport: agent announced it will disconnect soon (goAway)");
        }

        events
    }
}

fn normalize_call(call: &FunctionCall) -> ToolCallRequest {
    ToolCallRequest {
        call_id: call.id.clone().unwrap_or_default(),
        name: call.name.clone(),
        args: argument_map(&call.args),
    }
}

/// Arguments arrive as an object or, in the legacy shape, as a JSON string.
fn argument_map(args: &Value) -> Map<String, Value> {
    match args {
        Value::Object(map) => map.clone(),
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            _ => {
                log::warn!("Transport: tool arguments are not a JSON object: {}", raw);
                Map::new()
            }
        },
        _ => Map::new(),
    }
}

fn decode_audio(blob: &Blob, offset: Duration) -> Option<AudioFrame> {
    if !blob.mime_type.starts_with(PCM_MIME_PREFIX) {
        log::debug!("Transport: ignoring inline data of type {}", blob.mime_type);
        return None;
    }
    let rate = parse_pcm_rate(&blob.mime_type).unwrap_or(AGENT_SAMPLE_RATE);
    match STANDARD.decode(&blob.data) {
        Ok(bytes) => Some(AudioFrame::from_pcm16_le(
            &bytes,
            rate,
            AudioSource::Remote,
            offset,
        )),
        Err(e) => {
            log::warn!("Transport: failed to decode agent audio: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ResponseModality;
    use serde_json::json;

    fn agent_config() -> AgentConfig {
        AgentConfig {
            model: "models/gemini-2.0-flash-exp".to_string(),
            system_instruction: "You are a friendly health companion.".to_string(),
            voice: "Aoede".to_string(),
            response_modality: ResponseModality::Audio,
            tools: vec![ToolDeclaration::new("searchUserHistory", "History")
                .string_param("query", "q", true)],
        }
    }

    #[test]
    fn test_setup_serialization() {
        let value = serde_json::to_value(ClientMessage::setup(&agent_config())).unwrap();
        let setup = &value["setup"];
        assert_eq!(setup["model"], "models/gemini-2.0-flash-exp");
        assert_eq!(
            setup["systemInstruction"]["parts"][0]["text"],
            "You are a friendly health companion."
        );
        assert_eq!(setup["generationConfig"]["responseModalities"], json!(["AUDIO"]));
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Aoede"
        );
        assert_eq!(
            setup["tools"][0]["functionDeclarations"][0]["name"],
            "searchUserHistory"
        );
    }

    #[test]
    fn test_setup_without_tools_omits_key() {
        let mut config = agent_config();
        config.tools.clear();
        let value = serde_json::to_value(ClientMessage::setup(&config)).unwrap();
        assert!(value["setup"].get("tools").is_none());
    }

    #[test]
    fn test_audio_chunk_serialization() {
        let frame = AudioFrame::new(vec![0x1234, 0x5678], 16000, AudioSource::Local, Duration::ZERO);
        let value = serde_json::to_value(ClientMessage::audio_chunk(&frame)).unwrap();
        let chunk = &value["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");

        let decoded = STANDARD.decode(chunk["data"].as_str().unwrap()).unwrap();
        assert_eq!(decoded, vec![0x34, 0x12, 0x78, 0x56]);
        assert!(value["realtimeInput"].get("audioStreamEnd").is_none());
    }

    #[test]
    fn test_end_and_text_and_tool_response() {
        let end = serde_json::to_value(ClientMessage::audio_stream_end()).unwrap();
        assert_eq!(end, json!({ "realtimeInput": { "audioStreamEnd": true } }));

        let text = serde_json::to_value(ClientMessage::user_text("Hello")).unwrap();
        assert_eq!(text["clientContent"]["turnComplete"], true);
        assert_eq!(text["clientContent"]["turns"][0]["role"], "user");
        assert_eq!(text["clientContent"]["turns"][0]["parts"][0]["text"], "Hello");

        let resp = serde_json::to_value(ClientMessage::tool_response(
            "c1",
            "searchUserHistory",
            json!({ "result": "ok" }),
        ))
        .unwrap();
        assert_eq!(
            resp,
            json!({ "toolResponse": { "functionResponses": [
                { "id": "c1", "name": "searchUserHistory", "response": { "result": "ok" } }
            ] } })
        );
    }

    #[test]
    fn test_parse_pcm_rate() {
        assert_eq!(parse_pcm_rate("audio/pcm;rate=24000"), Some(24000));
        assert_eq!(parse_pcm_rate("audio/pcm; rate=16000"), Some(16000));
        assert_eq!(parse_pcm_rate("audio/pcm"), None);
    }

    #[test]
    fn test_server_content_events_in_order() {
        let audio = STANDARD.encode([0x01u8, 0x00, 0x02, 0x00]);
        let json = json!({
            "serverContent": {
                "modelTurn": { "parts": [
                    { "text": "Hi" },
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": audio } }
                ] },
                "turnComplete": true
            }
        });
        let msg = ServerMessage::parse(json.to_string().as_bytes()).unwrap();
        let events = msg.into_events(Duration::from_secs(2));

        assert_eq!(events.len(), 3);
        assert_eq!(events[0], AgentEvent::Text("Hi".to_string()));
        match &events[1] {
            AgentEvent::AudioData(frame) => {
                assert_eq!(frame.samples(), &[1, 2]);
                assert_eq!(frame.sample_rate(), 24000);
                assert_eq!(frame.source(), AudioSource::Remote);
                assert_eq!(frame.offset(), Duration::from_secs(2));
            }
            other => panic!("Expected AudioData, got {:?}", other),
        }
        assert_eq!(events[2], AgentEvent::TurnComplete);
    }

    #[test]
    fn test_interrupted() {
        let msg = ServerMessage::parse(br#"{"serverContent":{"interrupted":true}}"#).unwrap();
        assert_eq!(msg.into_events(Duration::ZERO), vec![AgentEvent::Interrupted]);
    }

    #[test]
    fn test_setup_complete() {
        let msg = ServerMessage::parse(br#"{"setupComplete":{}}"#).unwrap();
        assert!(msg.is_setup_complete());
        assert_eq!(msg.into_events(Duration::ZERO), vec![AgentEvent::Ready]);
    }

    #[test]
    fn test_batched_tool_calls() {
        let msg = ServerMessage::parse(
            br#"{"toolCall":{"functionCalls":[
                {"id":"a","name":"searchMedicalKnowledge","args":{"query":"ibuprofen"}},
                {"id":"b","name":"searchUserHistory","args":{"query":"sleep"}}
            ]}}"#,
        )
        .unwrap();
        let calls = msg.tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].call_id, "a");
        assert_eq!(calls[0].str_arg("query"), Some("ibuprofen"));
        assert_eq!(calls[1].name, "searchUserHistory");
    }

    #[test]
    fn test_singular_and_legacy_tool_call_shapes() {
        let singular = ServerMessage::parse(
            br#"{"functionCall":{"id":"s1","name":"searchUserHistory","args":{"query":"bp"}}}"#,
        )
        .unwrap();
        let calls = singular.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].call_id, "s1");

        let legacy = ServerMessage::parse(
            br#"{"name":"searchMedicalKnowledge","arguments":"{\"query\":\"rash\"}","call_id":"l1"}"#,
        )
        .unwrap();
        let events = legacy.into_events(Duration::ZERO);
        match &events[..] {
            [AgentEvent::ToolCall(calls)] => {
                assert_eq!(calls[0].call_id, "l1");
                assert_eq!(calls[0].name, "searchMedicalKnowledge");
                assert_eq!(calls[0].str_arg("query"), Some("rash"));
            }
            other => panic!("Expected one ToolCall, got {:?}", other),
        }
    }

    #[test]
    fn test_tool_call_cancellation() {
        let msg = ServerMessage::parse(br#"{"toolCallCancellation":{"ids":["a","b"]}}"#).unwrap();
        assert_eq!(
            msg.into_events(Duration::ZERO),
            vec![AgentEvent::ToolCallCancelled(vec!["a".to_string(), "b".to_string()])]
        );
    }

    #[test]
    fn test_unknown_message_yields_no_events() {
        let msg = ServerMessage::parse(br#"{"usageMetadata":{"totalTokenCount":12}}"#).unwrap();
        assert!(msg.into_events(Duration::ZERO).is_empty());
    }

    #[test]
    fn test_error_message() {
        let msg = ServerMessage::parse(br#"{"error":{"code":400,"message":"bad setup"}}"#).unwrap();
        assert_eq!(
            msg.into_events(Duration::ZERO),
            vec![AgentEvent::Error("bad setup".to_string())]
        );
    }
}
