//! Tools backed by the REST backend

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{ResultPolicy, ToolCallRequest, ToolDeclaration, ToolDispatcher, ToolError, ToolHandler};
use crate::backend::BackendClient;

/// Posts `{"query": ...}` to a backend path and answers with its `answer`.
pub struct HttpToolBackend {
    backend: BackendClient,
    path: String,
    default_answer: String,
}

impl HttpToolBackend {
    pub fn new(backend: BackendClient, path: &str, default_answer: &str) -> Self {
        Self {
            backend,
            path: path.to_string(),
            default_answer: default_answer.to_string(),
        }
    }
}

#[async_trait]
impl ToolHandler for HttpToolBackend {
    async fn call(&self, request: &ToolCallRequest) -> Result<Value, ToolError> {
        let query = request
            .str_arg("query")
            .ok_or_else(|| ToolError::MissingArgument("query".to_string()))?;

        let response = self
            .backend
            .post_json(&self.path, &json!({ "query": query }))
            .await
            .map_err(|e| ToolError::Backend(e.to_string()))?;

        let answer = response
            .get("answer")
            .and_then(Value::as_str)
            .filter(|a| !a.is_empty())
            .unwrap_or(self.default_answer.as_str());
        Ok(json!({ "result": answer }))
    }
}

pub const SEARCH_MEDICAL_KNOWLEDGE: &str = "searchMedicalKnowledge";
pub const SEARCH_USER_HISTORY: &str = "searchUserHistory";

/// Retrieval tools used by the daily check-in.
pub fn health_companion_tools(backend: &BackendClient) -> ToolDispatcher {
    let mut dispatcher = ToolDispatcher::new();

    dispatcher
        .register(
            ToolDeclaration::new(
                SEARCH_MEDICAL_KNOWLEDGE,
                "Search the medical knowledge base for information about symptoms, \
                 conditions, medications and general health guidance.",
            )
            .string_param("query", "The medical question or topic to look up", true),
            Arc::new(HttpToolBackend::new(
                backend.clone(),
                "/medical-search",
                "No medical information found for this query.",
            )),
            ResultPolicy::Reply,
        )
        .set_fallback(
            SEARCH_MEDICAL_KNOWLEDGE,
            "Unable to search medical knowledge at this time.",
        );

    dispatcher
        .register(
            ToolDeclaration::new(
                SEARCH_USER_HISTORY,
                "Search the user's previous check-ins and health records for relevant history.",
            )
            .string_param("query", "What to look for in the user's history", true),
            Arc::new(HttpToolBackend::new(
                backend.clone(),
                "/user-history-search",
                "No relevant history found.",
            )),
            ResultPolicy::Reply,
        )
        .set_fallback(SEARCH_USER_HISTORY, "Unable to search user history at this time.");

    dispatcher
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_companion_declarations() {
        let dispatcher = health_companion_tools(&BackendClient::default());
        let decls = dispatcher.declarations();
        assert_eq!(decls.len(), 2);
        assert_eq!(decls[0].name, SEARCH_MEDICAL_KNOWLEDGE);
        assert_eq!(decls[1].name, SEARCH_USER_HISTORY);
        for decl in decls {
            assert_eq!(decl.parameters["required"], json!(["query"]));
        }
    }

    #[tokio::test]
    async fn test_unreachable_backend_uses_fallback() {
        // Port 9 (discard) on localhost is not an HTTP server
        let dispatcher = health_companion_tools(&BackendClient::new("http://127.0.0.1:9"));
        let request = ToolCallRequest {
            call_id: "c1".to_string(),
            name: SEARCH_USER_HISTORY.to_string(),
            args: json!({ "query": "sleep" }).as_object().cloned().unwrap(),
        };

        let result = dispatcher.dispatch(&request).await.unwrap().unwrap();
        assert_eq!(
            result.payload,
            json!({ "result": "Unable to search user history at this time." })
        );
    }

    #[tokio::test]
    async fn test_missing_query_argument() {
        let tool = HttpToolBackend::new(BackendClient::default(), "/medical-search", "none");
        let request = ToolCallRequest {
            call_id: "c2".to_string(),
            name: SEARCH_MEDICAL_KNOWLEDGE.to_string(),
            args: Default::default(),
        };
        assert_eq!(
            tool.call(&request).await.unwrap_err(),
            ToolError::MissingArgument("query".to_string())
        );
    }
}
