//! Network Protocol Definitions
//!
//! Defines the Data Transfer Objects (DTOs) used for HTTP communication between nodes.
//! Constants define the API endpoints every node serves.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ENDPOINT_PING: &str = "/rpc/ping";
pub const ENDPOINT_REQUEST_RESPONSE: &str = "/rpc/request_response";
pub const ENDPOINT_REQUEST_STREAM: &str = "/rpc/request_stream";

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Body of a request-response reply. Exactly one of `data` / `error` is set.
#[derive(Debug, Serialize, Deserialize)]
pub struct CallResponse {
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl CallResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self {
            data: None,
            error: Some(error.to_string()),
        }
    }
}

/// One line of a request-stream reply body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    Next { data: Value },
    Error { message: String },
    Complete,
}

impl StreamFrame {
    pub fn to_line(&self) -> String {
        match serde_json::to_string(self) {
            Ok(mut line) => {
                line.push('\n');
                line
            }
            Err(e) => {
                tracing::error!("Failed to encode stream frame: {}", e);
                let fallback = serde_json::json!({ "type": "error", "message": e.to_string() });
                format!("{}\n", fallback)
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PingResponse {
    pub address: String,
}
