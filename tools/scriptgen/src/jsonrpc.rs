use crate::errors::ProxyError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const INTERNAL_ERROR: i64 = -32603;
pub const REQUEST_TIMEOUT: i64 = -32001;

/// Correlation id carried by requests and their responses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    Text(String),
}

impl RequestId {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(text) => Some(Self::Text(text.clone())),
            Value::Number(number) => number.as_i64().map(Self::Number),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Number(_) => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Number(number) => json!(number),
            Self::Text(text) => json!(text),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(number) => write!(f, "{number}"),
            Self::Text(text) => write!(f, "{text}"),
        }
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

/// A line received from the client, parsed just far enough to route it.
/// `raw` is forwarded to the browser service untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientMessage {
    pub id: Option<RequestId>,
    pub method: Option<String>,
    pub params: Value,
    pub raw: String,
}

impl ClientMessage {
    /// Requests carry both a method and an id; notifications and client-side
    /// responses never get an answer back.
    pub fn expects_response(&self) -> bool {
        self.id.is_some() && self.method.is_some()
    }

    pub fn method(&self) -> &str {
        self.method.as_deref().unwrap_or("")
    }

    pub fn tool_name(&self) -> Option<&str> {
        if self.method() != "tools/call" {
            return None;
        }
        self.params.get("name").and_then(Value::as_str)
    }

    pub fn tool_arguments(&self) -> Option<&Value> {
        self.tool_name()?;
        self.params.get("arguments")
    }
}

/// A line received from the browser service.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildMessage {
    pub id: Option<RequestId>,
    pub method: Option<String>,
    pub value: Value,
}

impl ChildMessage {
    pub fn is_response(&self) -> bool {
        self.id.is_some() && self.method.is_none()
    }

    pub fn is_success(&self) -> bool {
        self.value.get("result").is_some() && self.value.get("error").is_none()
    }
}

pub fn parse_client_line(line: &str) -> Result<ClientMessage, ProxyError> {
    let raw = line.trim().to_string();
    let value = serde_json::from_str::<Value>(&raw)
        .map_err(|err| ProxyError::Parse(err.to_string()))?;
    let Some(object) = value.as_object() else {
        return Err(ProxyError::InvalidRequest(
            "message must be a JSON object".to_string(),
        ));
    };

    let id = match object.get("id") {
        None | Some(Value::Null) => None,
        Some(value) => Some(RequestId::from_value(value).ok_or_else(|| {
            ProxyError::InvalidRequest("id must be a string or an integer".to_string())
        })?),
    };
    let method = match object.get("method") {
        None => None,
        Some(Value::String(method)) => Some(method.clone()),
        Some(_) => {
            return Err(ProxyError::InvalidRequest(
                "method must be a string".to_string(),
            ))
        }
    };
    let params = object.get("params").cloned().unwrap_or(Value::Null);

    Ok(ClientMessage {
        id,
        method,
        params,
        raw,
    })
}

pub fn parse_child_line(line: &str) -> Result<ChildMessage, ProxyError> {
    let value = serde_json::from_str::<Value>(line.trim()).map_err(|err| {
        ProxyError::Parse(format!(
            "invalid json from browser service: {err}; input={}",
            line.chars().take(256).collect::<String>(),
        ))
    })?;
    if !value.is_object() {
        return Err(ProxyError::Parse(
            "browser service sent a non-object message".to_string(),
        ));
    }
    let id = value.get("id").and_then(RequestId::from_value);
    let method = value
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(ChildMessage { id, method, value })
}

pub fn request_line(id: &RequestId, method: &str, params: Option<Value>) -> String {
    let mut request = json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
        "id": id.to_value(),
    });
    if let Some(params) = params {
        request["params"] = params;
    }
    request.to_string()
}

pub fn success_line(id: &RequestId, result: Value) -> String {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id.to_value(),
        "result": result,
    })
    .to_string()
}

pub fn error_line(id: Option<&RequestId>, code: i64, message: &str) -> String {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id.map(RequestId::to_value).unwrap_or(Value::Null),
        "error": {
            "code": code,
            "message": message,
        },
    })
    .to_string()
}

/// Error envelope for a failure surfaced to the caller.
pub fn error_line_for(id: Option<&RequestId>, error: &ProxyError) -> String {
    match error {
        ProxyError::Parse(_) => error_line(None, PARSE_ERROR, "Parse error"),
        ProxyError::InvalidRequest(detail) => {
            error_line(id, INVALID_REQUEST, &format!("Invalid Request: {detail}"))
        }
        ProxyError::Timeout(_) => error_line(id, REQUEST_TIMEOUT, &error.to_string()),
        other => error_line(id, INTERNAL_ERROR, &other.to_string()),
    }
}
