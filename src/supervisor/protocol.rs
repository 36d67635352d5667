//! Client for the JSON-RPC over HTTP protocol spoken by capability servers.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

pub const SESSION_HEADER: &str = "Mcp-Session-Id";
pub const PROTOCOL_VERSION: &str = "2025-03-26";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(rename = "isError", default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl ToolResult {
    pub fn is_error(&self) -> bool {
        self.is_error.unwrap_or(false)
    }
}

pub fn endpoint_for_port(port: u16) -> String {
    format!("http://127.0.0.1:{}/mcp", port)
}

/// One session against a capability server. The session id comes from the
/// server's `Mcp-Session-Id` header, or is generated locally when the server
/// does not assign one, and is sent on every later request.
pub struct CapabilityClient {
    http: reqwest::Client,
    endpoint: String,
    session_id: String,
    next_id: AtomicU64,
    server_info: Value,
}

impl CapabilityClient {
    pub async fn connect(endpoint: impl Into<String>) -> Result<Self, ProtocolError> {
        let endpoint = endpoint.into();
        let http = reqwest::Client::new();

        let init = json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": "initialize",
            "params": {
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                },
            },
        });
        let response = http
            .post(&endpoint)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .json(&init)
            .send()
            .await?;

        let session_id = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let server_info = read_result(response).await?;

        let client = Self {
            http,
            endpoint,
            session_id,
            next_id: AtomicU64::new(1),
            server_info,
        };
        client.notify("notifications/initialized").await?;
        tracing::info!("Connected to {} (session {})", client.endpoint, client.session_id);
        Ok(client)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The `initialize` result as returned by the server.
    pub fn server_info(&self) -> &Value {
        &self.server_info
    }

    pub async fn list_tools(&self) -> Result<Vec<Value>, ProtocolError> {
        let result = self.request("tools/list", json!({})).await?;
        match result.get("tools") {
            Some(Value::Array(tools)) => Ok(tools.clone()),
            _ => Err(ProtocolError::InvalidResponse("missing `tools` array".to_string())),
        }
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult, ProtocolError> {
        let result = self
            .request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;
        serde_json::from_value(result).map_err(|e| ProtocolError::InvalidResponse(e.to_string()))
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, ProtocolError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        tracing::debug!("{} -> {} #{}", self.endpoint, method, id);
        let response = self
            .http
            .post(&self.endpoint)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .header(SESSION_HEADER, &self.session_id)
            .json(&body)
            .send()
            .await?;
        read_result(response).await
    }

    async fn notify(&self, method: &str) -> Result<(), ProtocolError> {
        let response = self
            .http
            .post(&self.endpoint)
            .header(SESSION_HEADER, &self.session_id)
            .json(&json!({ "jsonrpc": "2.0", "method": method }))
            .send()
            .await?;
        if !response.status().is_success() {
            tracing::warn!("{} rejected {}: {}", self.endpoint, method, response.status());
        }
        Ok(())
    }
}

async fn read_result(response: reqwest::Response) -> Result<Value, ProtocolError> {
    let status = response.status();
    let is_sse = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"));
    let text = response.text().await?;

    if !status.is_success() {
        return Err(ProtocolError::Status {
            status: status.as_u16(),
            body: text,
        });
    }

    let message = if is_sse { last_sse_data(&text)? } else { text };
    let value: Value =
        serde_json::from_str(&message).map_err(|e| ProtocolError::InvalidResponse(e.to_string()))?;

    if let Some(error) = value.get("error") {
        return Err(ProtocolError::Rpc {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    value
        .get("result")
        .cloned()
        .ok_or_else(|| ProtocolError::InvalidResponse("missing `result`".to_string()))
}

/// Servers may answer with a one-shot event stream; the reply is the last
/// `data:` payload.
fn last_sse_data(body: &str) -> Result<String, ProtocolError> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.trim().to_string())
        .filter(|data| !data.is_empty())
        .last()
        .ok_or_else(|| ProtocolError::InvalidResponse("event stream carried no data".to_string()))
}
