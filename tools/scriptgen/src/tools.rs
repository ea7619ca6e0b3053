use crate::config::ToolConfig;
use serde_json::{json, Value};

/// How the script-generation tool is advertised in `tools/list`.
pub fn local_tool_definition(tool: &ToolConfig) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "inputSchema": {
            "type": "object",
            "properties": {}
        }
    })
}

/// Adds `local` to the tool list in a `tools/list` response, replacing any
/// entry of the same name so it appears exactly once. Error responses and
/// results without a list are returned unchanged.
pub fn merge_tool_list(mut response: Value, local: &Value) -> Value {
    let local_name = local.get("name").and_then(Value::as_str).unwrap_or_default();
    let Some(tools) = response
        .get_mut("result")
        .and_then(|result| result.get_mut("tools"))
        .and_then(Value::as_array_mut)
    else {
        return response;
    };
    tools.retain(|tool| tool.get("name").and_then(Value::as_str) != Some(local_name));
    tools.push(local.clone());
    response
}
