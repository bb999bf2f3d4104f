//! REST client for the health-companion backend
//!
//! Tool execution, context loading and artifact upload all go through this
//! client. A single `reqwest::Client` is shared for the process lifetime.

use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde_json::Value;
use std::sync::OnceLock;
use std::time::Duration;

/// Backend used when nothing else is configured
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8000";

/// Global HTTP client for reuse across requests (avoids TLS handshake overhead)
static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn http_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Backend: custom HTTP client failed ({}), using defaults", e);
                Client::new()
            })
    })
}

/// Errors that can occur talking to the backend
#[derive(Debug, Clone)]
pub enum BackendError {
    /// Network/HTTP error
    Network(String),
    /// The backend answered with a non-success status
    Api { status: u16, message: String },
    /// The response body was not what we expected
    Parse(String),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::Network(e) => write!(f, "Network error: {}", e),
            BackendError::Api { status, message } => {
                write!(f, "Backend error ({}): {}", status, message)
            }
            BackendError::Parse(e) => write!(f, "Failed to parse backend response: {}", e),
        }
    }
}

impl std::error::Error for BackendError {}

/// Handle to one backend base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendClient {
    base_url: String,
}

impl Default for BackendClient {
    fn default() -> Self {
        Self::new(DEFAULT_BACKEND_URL)
    }
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// POST a JSON body and return the JSON answer.
    pub async fn post_json(&self, path: &str, body: &Value) -> Result<Value, BackendError> {
        let url = self.url(path);
        log::debug!("Backend: POST {}", url);
        let response = http_client()
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;
        read_json(response).await
    }

    /// GET a JSON document (context loading).
    pub async fn get_json(&self, path: &str) -> Result<Value, BackendError> {
        let url = self.url(path);
        log::debug!("Backend: GET {}", url);
        let response = http_client()
            .get(&url)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;
        read_json(response).await
    }

    /// Upload bytes as multipart field `file`.
    pub async fn upload_file(
        &self,
        path: &str,
        file_name: &str,
        mime: &str,
        bytes: Vec<u8>,
    ) -> Result<Value, BackendError> {
        let url = self.url(path);
        let size = bytes.len();
        let part = Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(mime)
            .map_err(|e| BackendError::Network(e.to_string()))?;
        let form = Form::new().part("file", part);

        log::info!("Backend: uploading {} ({} bytes) to {}", file_name, size, url);
        let response = http_client()
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;
        read_json(response).await
    }
}

/// Decode a response, turning non-success statuses into `BackendError::Api`.
/// An empty success body is `Value::Null`; any other body must be JSON.
async fn read_json(response: Response) -> Result<Value, BackendError> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| BackendError::Network(e.to_string()))?;

    if !status.is_success() {
        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| {
                ["detail", "error", "message"]
                    .iter()
                    .find_map(|k| v.get(*k).and_then(Value::as_str).map(str::to_string))
            })
            .unwrap_or(text);
        return Err(BackendError::Api {
            status: status.as_u16(),
            message,
        });
    }

    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|e| BackendError::Parse(e.to_string()))
}
