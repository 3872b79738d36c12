//! MCP over HTTP
//!
//! A minimal tool surface mapping onto existing operations, under the same
//! auth rules as the rest of the admin API.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::apps;
use crate::error::{Error, Result};
use crate::http::envelope::Data;
use crate::state::SharedState;

/// `POST /mcp/initialize`
pub async fn initialize() -> Data<Value> {
    Data(json!({
        "protocolVersion": "2024-11-05",
        "serverInfo": { "name": "fazt", "version": env!("CARGO_PKG_VERSION") },
        "capabilities": { "tools": {} },
    }))
}

/// `POST /mcp/tools/list`
pub async fn tools_list() -> Data<Value> {
    Data(json!({
        "tools": [
            {
                "name": "apps_list",
                "description": "List deployed apps",
                "inputSchema": { "type": "object", "properties": {} },
            },
            {
                "name": "app_info",
                "description": "Inspect one app by id or name",
                "inputSchema": {
                    "type": "object",
                    "properties": { "app": { "type": "string" } },
                    "required": ["app"],
                },
            },
            {
                "name": "system_limits",
                "description": "Read the derived system limits",
                "inputSchema": { "type": "object", "properties": {} },
            },
        ],
    }))
}

#[derive(Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// `POST /mcp/tools/call`
pub async fn tools_call(
    State(state): State<SharedState>,
    Json(call): Json<ToolCall>,
) -> Result<Data<Value>> {
    let result = match call.name.as_str() {
        "apps_list" => {
            let listed = apps::list(&state.db.pool).await?;
            serde_json::to_value(listed).unwrap_or(Value::Null)
        }
        "app_info" => {
            let key = call
                .arguments
                .get("app")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::BadRequest("app argument required".to_string()))?;
            let app = apps::get_by_name(&state.db.pool, key)
                .await?
                .or(apps::get(&state.db.pool, key).await?)
                .ok_or_else(|| Error::NotFound(format!("app {key}")))?;
            serde_json::to_value(app).unwrap_or(Value::Null)
        }
        "system_limits" => serde_json::to_value(&*state.limits).unwrap_or(Value::Null),
        other => return Err(Error::NotFound(format!("tool {other}"))),
    };
    Ok(Data(json!({
        "content": [{ "type": "text", "text": result.to_string() }],
    })))
}
