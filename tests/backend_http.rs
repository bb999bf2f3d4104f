//! Upload and tool calls against a local HTTP backend.

mod common;

use serde_json::{json, Value};

use health_voice::audio::wav;
use health_voice::backend::{BackendClient, BackendError};
use health_voice::recorder::ContainerFormat;
use health_voice::tools::{ToolCallRequest, SEARCH_MEDICAL_KNOWLEDGE, SEARCH_USER_HISTORY};
use health_voice::upload::UploadError;
use health_voice::{health_companion_tools, ArtifactUploader, RecordedConversation, RecorderStrategyKind, UploadTarget};

use common::{http_stub, http_stub_raw, init_logging};

fn recording() -> RecordedConversation {
    let samples: Vec<i16> = (0..2400).map(|i| (i % 100) as i16).collect();
    let bytes = wav::encode_pcm16(&samples, 24000).unwrap();
    RecordedConversation::new(
        bytes,
        24000,
        samples.len() as u64,
        RecorderStrategyKind::TimelineMerge,
        ContainerFormat::Pcm16Wav,
        Vec::new(),
    )
}

fn tool_call(name: &str, query: &str) -> ToolCallRequest {
    ToolCallRequest {
        call_id: "call-1".to_string(),
        name: name.to_string(),
        args: json!({ "query": query }).as_object().cloned().unwrap(),
    }
}

#[tokio::test]
async fn test_upload_posts_multipart_wav() {
    init_logging();
    let keep = tempfile::tempdir().unwrap();
    let (url, mut requests) = http_stub(200, json!({ "message": "stored" })).await;
    let uploader =
        ArtifactUploader::new(BackendClient::new(url), UploadTarget::checkin()).with_keep_dir(keep.path());

    let receipt = uploader.upload(recording()).await.unwrap();
    assert!(receipt.file_name.starts_with("checkin_"));
    assert!(receipt.file_name.ends_with(".wav"));
    assert_eq!(receipt.bytes, recording().wav_bytes().len());
    assert_eq!(receipt.response["message"], "stored");

    let request = requests.recv().await.unwrap();
    assert!(request.head.starts_with("POST /upload-checkin "), "{}", request.head);
    let body = request.body_text();
    assert!(body.contains("name=\"file\""));
    assert!(body.contains(&format!("filename=\"{}\"", receipt.file_name)));
    assert!(body.contains("Content-Type: audio/wav"));
    assert!(body.contains("RIFF"));

    // Nothing kept locally on success
    assert_eq!(std::fs::read_dir(keep.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_rejected_upload_is_kept_then_retried() {
    init_logging();
    let keep = tempfile::tempdir().unwrap();
    let (url, _requests) = http_stub(500, json!({ "detail": "disk full" })).await;
    let uploader = ArtifactUploader::new(BackendClient::new(url), UploadTarget::insurance_consultation())
        .with_keep_dir(keep.path());

    let err = uploader.upload(recording()).await.unwrap_err();
    let kept_at = match err {
        UploadError::Failed {
            message,
            kept_at: Some(path),
        } => {
            assert!(message.contains("500"), "{}", message);
            path
        }
        other => panic!("unexpected error: {:?}", other),
    };
    let name = kept_at.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("insurance_consultation_"));
    assert_eq!(std::fs::read(&kept_at).unwrap(), recording().wav_bytes());

    // A healthy backend takes the kept copy and the local file goes away
    let (url, mut requests) = http_stub(200, json!({ "message": "ok" })).await;
    let retry = ArtifactUploader::new(BackendClient::new(url), UploadTarget::insurance_consultation())
        .with_keep_dir(keep.path());
    let receipt = retry.retry(&kept_at).await.unwrap();
    assert_eq!(receipt.file_name, name);
    assert!(!kept_at.exists());

    let request = requests.recv().await.unwrap();
    assert!(request.head.starts_with("POST /upload-insurance-consultation "));
}

#[tokio::test]
async fn test_medical_search_posts_query() {
    init_logging();
    let (url, mut requests) = http_stub(200, json!({ "answer": "Take ibuprofen with food." })).await;
    let tools = health_companion_tools(&BackendClient::new(url));

    let result = tools
        .dispatch(&tool_call(SEARCH_MEDICAL_KNOWLEDGE, "ibuprofen stomach"))
        .await
        .unwrap()
        .expect("reply");
    assert_eq!(result.call_id, "call-1");
    assert_eq!(result.payload, json!({ "result": "Take ibuprofen with food." }));

    let request = requests.recv().await.unwrap();
    assert!(request.head.starts_with("POST /medical-search "));
    let body: Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body, json!({ "query": "ibuprofen stomach" }));
}

#[tokio::test]
async fn test_empty_answer_uses_default_text() {
    init_logging();
    let (url, _requests) = http_stub(200, json!({ "answer": "" })).await;
    let tools = health_companion_tools(&BackendClient::new(url));

    let result = tools
        .dispatch(&tool_call(SEARCH_USER_HISTORY, "sleep"))
        .await
        .unwrap()
        .expect("reply");
    assert_eq!(result.payload, json!({ "result": "No relevant history found." }));
}

#[tokio::test]
async fn test_backend_error_uses_fallback_text() {
    init_logging();
    let (url, _requests) = http_stub(503, json!({ "detail": "maintenance" })).await;
    let tools = health_companion_tools(&BackendClient::new(url));

    let result = tools
        .dispatch(&tool_call(SEARCH_MEDICAL_KNOWLEDGE, "headache"))
        .await
        .unwrap()
        .expect("reply");
    assert_eq!(
        result.payload,
        json!({ "result": "Unable to search medical knowledge at this time." })
    );
}

#[tokio::test]
async fn test_context_loading_reads_json() {
    init_logging();
    let (url, mut requests) = http_stub(200, json!({ "name": "Asha", "conditions": ["hypertension"] })).await;
    let backend = BackendClient::new(format!("{}/", url));

    let context = backend.get_json("/user-context").await.unwrap();
    assert_eq!(context["conditions"][0], "hypertension");

    let request = requests.recv().await.unwrap();
    assert!(request.head.starts_with("GET /user-context "), "{}", request.head);
}

#[tokio::test]
async fn test_context_loading_surfaces_status() {
    init_logging();
    let (url, _requests) = http_stub(404, json!({ "detail": "no such user" })).await;
    let err = BackendClient::new(url).get_json("/user-context").await.unwrap_err();
    assert!(err.to_string().contains("404"), "{}", err);
}

#[tokio::test]
async fn test_non_json_body_is_a_parse_error() {
    init_logging();
    let (url, _requests) = http_stub_raw(200, "<html>gateway</html>".to_string()).await;
    let err = BackendClient::new(url).get_json("/user-context").await.unwrap_err();
    assert!(matches!(err, BackendError::Parse(_)), "{:?}", err);
}

#[tokio::test]
async fn test_empty_body_is_null() {
    init_logging();
    let (url, _requests) = http_stub_raw(200, String::new()).await;
    let context = BackendClient::new(url).get_json("/user-context").await.unwrap();
    assert_eq!(context, Value::Null);
}

#[tokio::test]
async fn test_unparseable_answer_uses_fallback_text() {
    init_logging();
    let (url, _requests) = http_stub_raw(200, "not json".to_string()).await;
    let tools = health_companion_tools(&BackendClient::new(url));

    let result = tools
        .dispatch(&tool_call(SEARCH_USER_HISTORY, "sleep"))
        .await
        .unwrap()
        .expect("reply");
    assert_eq!(result.payload, json!({ "result": "Unable to search user history at this time." }));
}
