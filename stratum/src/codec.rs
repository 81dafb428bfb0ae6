use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StratumError;

/// JSON-RPC request from a worker. `id` can be null, a string, or a number;
/// we keep it opaque and echo it back verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

fn default_version() -> String {
    "2.0".to_string()
}

impl StratumRequest {
    pub fn notification(method: &str, params: Value) -> Self {
        Self { id: None, jsonrpc: "2.0".to_string(), method: method.to_string(), params }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC response to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumResponse {
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl StratumResponse {
    pub fn ok(id: Option<Value>, result: Value) -> Self {
        Self { id, result: Some(result), error: None }
    }

    pub fn error(id: Option<Value>, code: i32, message: &str) -> Self {
        Self { id, result: None, error: Some(ErrorObject { code, message: message.to_string(), data: None }) }
    }

    pub fn stratum_error(id: Option<Value>, err: &StratumError) -> Self {
        Self::error(id, err.code(), &err.to_string())
    }

    pub fn parse_error() -> Self {
        Self::error(None, -32700, "parse error")
    }
}

/// Strip control characters that some ASIC firmwares embed inside JSON
/// strings. Newlines are already consumed by the line framer; anything else
/// below 0x20 is replaced with a space so the payload stays parseable.
fn sanitize_json_input(input: &str) -> String {
    input.chars().map(|c| if c.is_control() && c != '\n' && c != '\r' { ' ' } else { c }).collect()
}

/// Parse one line into a request, sanitizing control characters first when
/// the raw input needs it.
pub fn unmarshal_request(input: &str) -> Result<StratumRequest, serde_json::Error> {
    let needs_sanitization = input.chars().any(|c| c.is_control() && c != '\n' && c != '\r');
    if needs_sanitization {
        let sanitized = sanitize_json_input(input);
        match serde_json::from_str(&sanitized) {
            Ok(request) => {
                tracing::debug!("request sanitized (control characters replaced)");
                Ok(request)
            }
            Err(e) => Err(e),
        }
    } else {
        serde_json::from_str(input)
    }
}
