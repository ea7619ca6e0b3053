use crate::errors::ProxyError;
use crate::jsonrpc::ClientMessage;
use crate::logging::append_run_log;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const DEFAULT_WAIT_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Navigate,
    Fill,
    Click,
    Wait,
    Screenshot,
    Text,
    GetElements,
    Snapshot,
    Press,
    Hover,
    ToolCall,
    /// A browser method with no typed mapping, kept with its raw params.
    Passthrough,
}

/// One entry of the action log. `target` is the selector, tool name or
/// passthrough method; `payload` the value the action carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedAction {
    pub kind: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl RecordedAction {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            target: None,
            payload: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// How an action is performed again in a generated script.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayStep {
    Call { method: String, params: Value },
    Pause { millis: u64 },
    Skipped { reason: String },
}

pub fn is_browser_method(method: &str) -> bool {
    method.starts_with("browser/") || method.starts_with("page/") || method.starts_with("element/")
}

/// Maps a forwarded client request to a recordable action. Requests that are
/// not browser actions (`initialize`, `tools/list`, the local tool) yield
/// `None`.
pub fn derive_action(message: &ClientMessage, local_tool_name: &str) -> Option<RecordedAction> {
    let params = &message.params;
    let text = |key: &str| params.get(key).and_then(Value::as_str).map(str::to_string);
    let selector = text("selector");

    let action = match message.method() {
        "tools/call" => {
            let name = message.tool_name()?;
            if name == local_tool_name {
                return None;
            }
            RecordedAction::new(ActionKind::ToolCall)
                .with_target(name)
                .with_payload(message.tool_arguments().cloned().unwrap_or_else(|| json!({})))
        }
        "browser/navigate" => RecordedAction::new(ActionKind::Navigate)
            .with_payload(params.get("url").cloned().unwrap_or(Value::Null)),
        "page/fill" | "element/fill" => RecordedAction {
            kind: ActionKind::Fill,
            target: selector,
            payload: params.get("text").cloned(),
        },
        "page/click" | "element/click" => RecordedAction {
            kind: ActionKind::Click,
            target: selector,
            payload: None,
        },
        "page/wait" => {
            let millis = params
                .get("milliseconds")
                .and_then(Value::as_u64)
                .unwrap_or(DEFAULT_WAIT_MS);
            RecordedAction::new(ActionKind::Wait).with_payload(json!(millis))
        }
        "page/screenshot" => RecordedAction::new(ActionKind::Screenshot)
            .with_payload(params.get("path").cloned().unwrap_or(Value::Null)),
        "page/text" | "element/text" => RecordedAction {
            kind: ActionKind::Text,
            target: selector,
            payload: None,
        },
        "page/elements" | "element/query" => RecordedAction {
            kind: ActionKind::GetElements,
            target: selector,
            payload: None,
        },
        "page/content" => RecordedAction::new(ActionKind::Snapshot),
        "page/press" | "element/press" => RecordedAction {
            kind: ActionKind::Press,
            target: selector,
            payload: params.get("key").cloned(),
        },
        "page/hover" | "element/hover" => RecordedAction {
            kind: ActionKind::Hover,
            target: selector,
            payload: None,
        },
        method if is_browser_method(method) => {
            let error = ProxyError::UnsupportedAction(method.to_string());
            append_run_log(
                "warn",
                "recording.passthrough",
                json!({"method": method, "error": error.to_string()}),
            );
            RecordedAction::new(ActionKind::Passthrough)
                .with_target(method)
                .with_payload(params.clone())
        }
        _ => return None,
    };
    Some(action)
}

pub fn replay_step(action: &RecordedAction) -> ReplayStep {
    let selector = action.target.clone().unwrap_or_default();
    let payload = action.payload.clone().unwrap_or(Value::Null);
    let call = |method: &str, params: Value| ReplayStep::Call {
        method: method.to_string(),
        params,
    };

    match action.kind {
        ActionKind::Navigate => call("browser/navigate", json!({"url": payload})),
        ActionKind::Fill => call("page/fill", json!({"selector": selector, "text": payload})),
        ActionKind::Click => call("page/click", json!({"selector": selector})),
        ActionKind::Wait => ReplayStep::Pause {
            millis: payload.as_u64().unwrap_or(DEFAULT_WAIT_MS),
        },
        ActionKind::Screenshot => call("page/screenshot", json!({"path": payload})),
        ActionKind::Text => call("page/text", json!({"selector": selector})),
        ActionKind::GetElements => call("page/elements", json!({"selector": selector})),
        ActionKind::Snapshot => call("page/content", json!({})),
        ActionKind::Press => call("page/press", json!({"selector": selector, "key": payload})),
        ActionKind::Hover => call("page/hover", json!({"selector": selector})),
        ActionKind::ToolCall => match &action.target {
            Some(name) => call(
                "tools/call",
                json!({"name": name, "arguments": action.payload.clone().unwrap_or_else(|| json!({}))}),
            ),
            None => ReplayStep::Skipped {
                reason: "tool call without a tool name".to_string(),
            },
        },
        ActionKind::Passthrough => match &action.target {
            Some(method) => call(
                method,
                match payload {
                    Value::Null => json!({}),
                    other => other,
                },
            ),
            None => ReplayStep::Skipped {
                reason: "browser operation without a method".to_string(),
            },
        },
    }
}
