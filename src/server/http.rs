//! REST introspection endpoints: health, session listing, history lookup,
//! plus the MCP placeholders.

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

use crate::server::ServerState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub active_sessions: usize,
}

#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub device_id: String,
    pub client_id: String,
    pub is_speaking: bool,
    pub history_length: usize,
}

/// Health check.
pub async fn health(State(state): State<ServerState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_sessions: state.sessions.len(),
    })
}

/// All currently connected sessions.
pub async fn list_sessions(State(state): State<ServerState>) -> Json<Vec<SessionInfo>> {
    let sessions = state
        .sessions
        .sessions()
        .into_iter()
        .map(|s| SessionInfo {
            session_id: s.session_id().to_string(),
            device_id: s.device_id().to_string(),
            client_id: s.client_id().to_string(),
            is_speaking: s.is_speaking(),
            history_length: s.history_len(),
        })
        .collect();
    Json(sessions)
}

/// Chat history of one session.
pub async fn session_history(
    State(state): State<ServerState>,
    Path(session_id): Path<String>,
) -> Json<Value> {
    match state.sessions.get(&session_id) {
        Some((session, _)) => Json(json!({
            "session_id": session_id,
            "history": session.history_snapshot(),
        })),
        None => Json(json!({"error": "Session not found"})),
    }
}

/// Device-side MCP tools (placeholder).
pub async fn list_mcp_tools() -> Json<Value> {
    Json(json!({
        "tools": [
            {"name": "set_volume", "description": "Điều chỉnh âm lượng"},
            {"name": "set_brightness", "description": "Điều chỉnh độ sáng"},
            {"name": "reboot", "description": "Khởi động lại thiết bị"},
        ]
    }))
}

/// Invoke an MCP tool on the device (placeholder).
pub async fn call_mcp_tool(
    Path(tool_name): Path<String>,
    Json(params): Json<Value>,
) -> Json<Value> {
    info!("MCP call: {} params={}", tool_name, params);
    Json(json!({
        "tool": tool_name,
        "status": "not_implemented",
        "message": "MCP tool calling chưa được implement trên thiết bị.",
    }))
}
