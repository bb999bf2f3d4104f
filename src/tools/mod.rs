//! Tool calls requested by the voice agent
//!
//! The agent asks for tools by name with a JSON argument map and a
//! correlation id. The `ToolDispatcher` looks the name up, runs the handler
//! and produces a `ToolResult`, or withholds it when the tool is registered
//! with `ResultPolicy::Suppress`.
//!
//! Unknown tool names never reach a handler: they are logged and the
//! conversation carries on without a reply.

mod http;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};

pub use http::{health_companion_tools, HttpToolBackend, SEARCH_MEDICAL_KNOWLEDGE, SEARCH_USER_HISTORY};

/// A normalized tool invocation from the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub name: String,
    pub args: Map<String, Value>,
}

impl ToolCallRequest {
    /// String argument by name, if present.
    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }
}

/// Payload to send back for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    pub payload: Value,
}

/// Whether a tool's result is sent back to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultPolicy {
    #[default]
    Reply,
    /// Run the tool but never send the result
    Suppress,
}

/// Errors that can occur while dispatching a tool call
#[derive(Debug, Clone, PartialEq)]
pub enum ToolError {
    UnknownToolName(String),
    MissingArgument(String),
    Backend(String),
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolError::UnknownToolName(name) => write!(f, "Unknown tool: {}", name),
            ToolError::MissingArgument(arg) => write!(f, "Missing required argument: {}", arg),
            ToolError::Backend(e) => write!(f, "Tool backend failed: {}", e),
        }
    }
}

impl std::error::Error for ToolError {}

/// Declaration advertised to the agent at setup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolDeclaration {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters: json!({ "type": "object", "properties": {}, "required": [] }),
        }
    }

    /// Add a string parameter to the schema.
    pub fn string_param(mut self, name: &str, description: &str, required: bool) -> Self {
        if let Some(props) = self.parameters["properties"].as_object_mut() {
            props.insert(
                name.to_string(),
                json!({ "type": "string", "description": description }),
            );
        }
        if required {
            if let Some(req) = self.parameters["required"].as_array_mut() {
                req.push(Value::String(name.to_string()));
            }
        }
        self
    }
}

/// Executes one kind of tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, request: &ToolCallRequest) -> Result<Value, ToolError>;
}

struct RegisteredTool {
    declaration: ToolDeclaration,
    handler: Arc<dyn ToolHandler>,
    policy: ResultPolicy,
    fallback: Option<String>,
}

/// Registry of the tools a page exposes to the agent.
#[derive(Default)]
pub struct ToolDispatcher {
    tools: HashMap<String, RegisteredTool>,
    order: Vec<String>,
}

impl ToolDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A later registration with the same name replaces it.
    pub fn register(
        &mut self,
        declaration: ToolDeclaration,
        handler: Arc<dyn ToolHandler>,
        policy: ResultPolicy,
    ) -> &mut Self {
        let name = declaration.name.clone();
        if !self.tools.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.tools.insert(
            name,
            RegisteredTool {
                declaration,
                handler,
                policy,
                fallback: None,
            },
        );
        self
    }

    /// Text returned as the result when the handler fails.
    pub fn set_fallback(&mut self, name: &str, message: &str) -> &mut Self {
        if let Some(tool) = self.tools.get_mut(name) {
            tool.fallback = Some(message.to_string());
        }
        self
    }

    /// Declarations in registration order.
    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|t| t.declaration.clone())
            .collect()
    }

    pub fn policy(&self, name: &str) -> Option<ResultPolicy> {
        self.tools.get(name).map(|t| t.policy)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Run the tool named in `request`.
    ///
    /// Returns `Ok(None)` when the tool ran but its policy withholds the
    /// result. Handler failures become an error payload (or the configured
    /// fallback text) so the agent always hears back about a known tool.
    pub async fn dispatch(&self, request: &ToolCallRequest) -> Result<Option<ToolResult>, ToolError> {
        let tool = self
            .tools
            .get(&request.name)
            .ok_or_else(|| ToolError::UnknownToolName(request.name.clone()))?;

        log::info!("Tools: running {} (call {})", request.name, request.call_id);
        let payload = match tool.handler.call(request).await {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Tools: {} failed: {}", request.name, e);
                match &tool.fallback {
                    Some(message) => json!({ "result": message }),
                    None => json!({ "error": e.to_string() }),
                }
            }
        };

        if tool.policy == ResultPolicy::Suppress {
            log::info!(
                "Tools: result for {} (call {}) withheld by policy",
                request.name,
                request.call_id
            );
            return Ok(None);
        }

        Ok(Some(ToolResult {
            call_id: request.call_id.clone(),
            name: request.name.clone(),
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        async fn call(&self, request: &ToolCallRequest) -> Result<Value, ToolError> {
            let query = request
                .str_arg("query")
                .ok_or_else(|| ToolError::MissingArgument("query".to_string()))?;
            Ok(json!({ "result": query.to_uppercase() }))
        }
    }

    struct Broken;

    #[async_trait]
    impl ToolHandler for Broken {
        async fn call(&self, _request: &ToolCallRequest) -> Result<Value, ToolError> {
            Err(ToolError::Backend("connection refused".to_string()))
        }
    }

    fn request(name: &str, args: Value) -> ToolCallRequest {
        ToolCallRequest {
            call_id: "call-1".to_string(),
            name: name.to_string(),
            args: args.as_object().cloned().unwrap_or_default(),
        }
    }

    fn echo_decl(name: &str) -> ToolDeclaration {
        ToolDeclaration::new(name, "Echo the query").string_param("query", "Text to echo", true)
    }

    #[test]
    fn test_declaration_schema() {
        let decl = echo_decl("echo");
        assert_eq!(decl.parameters["type"], "object");
        assert_eq!(decl.parameters["properties"]["query"]["type"], "string");
        assert_eq!(decl.parameters["required"], json!(["query"]));
    }

    #[tokio::test]
    async fn test_dispatch_reply() {
        let mut dispatcher = ToolDispatcher::new();
        dispatcher.register(echo_decl("echo"), Arc::new(Echo), ResultPolicy::Reply);

        let result = dispatcher
            .dispatch(&request("echo", json!({ "query": "bp log" })))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.call_id, "call-1");
        assert_eq!(result.payload, json!({ "result": "BP LOG" }));
    }

    #[tokio::test]
    async fn test_dispatch_suppressed() {
        let mut dispatcher = ToolDispatcher::new();
        dispatcher.register(echo_decl("quiet"), Arc::new(Echo), ResultPolicy::Suppress);

        let result = dispatcher
            .dispatch(&request("quiet", json!({ "query": "x" })))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let dispatcher = ToolDispatcher::new();
        let err = dispatcher
            .dispatch(&request("bookFlight", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err, ToolError::UnknownToolName("bookFlight".to_string()));
    }

    #[tokio::test]
    async fn test_failure_uses_fallback_or_error_payload() {
        let mut dispatcher = ToolDispatcher::new();
        dispatcher.register(echo_decl("broken"), Arc::new(Broken), ResultPolicy::Reply);

        let result = dispatcher
            .dispatch(&request("broken", json!({})))
            .await
            .unwrap()
            .unwrap();
        assert!(result.payload["error"].as_str().unwrap().contains("connection refused"));

        dispatcher.set_fallback("broken", "Try again later.");
        let result = dispatcher
            .dispatch(&request("broken", json!({})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.payload, json!({ "result": "Try again later." }));
    }

    #[test]
    fn test_declarations_keep_registration_order() {
        let mut dispatcher = ToolDispatcher::new();
        dispatcher
            .register(echo_decl("b"), Arc::new(Echo), ResultPolicy::Reply)
            .register(echo_decl("a"), Arc::new(Echo), ResultPolicy::Reply)
            .register(echo_decl("b"), Arc::new(Echo), ResultPolicy::Suppress);

        let names: Vec<_> = dispatcher.declarations().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(dispatcher.policy("b"), Some(ResultPolicy::Suppress));
    }
}
