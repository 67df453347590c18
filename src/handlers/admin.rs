//! `admin/get_connections`, `admin/close_connection` (SPEC_FULL.md §6).

use crate::context::EngineContext;
use crate::error::RtmError;
use crate::handlers::require_str;
use serde_json::{json, Value};

pub async fn get_connections(ctx: &EngineContext) -> Result<Value, RtmError> {
    let mut connections = Vec::new();
    for conn in ctx.registry.list().await {
        let role = conn.role.lock().await.clone();
        let subscriptions: Vec<String> = conn.subscriptions.lock().await.keys().cloned().collect();
        connections.push(json!({
            "id": conn.connection_id,
            "appkey": conn.appkey,
            "role": role,
            "subscriptions": subscriptions,
        }));
    }
    Ok(json!({ "connections": connections }))
}

pub async fn close_connection(body: &Value, ctx: &EngineContext) -> Result<Value, RtmError> {
    let connection_id = require_str(body, "connection_id")?;
    // No dedicated "unknown connection" error kind exists; a missing target
    // is the same shape of failure as any other malformed request field, so
    // it is reported as `BadRequest`.
    let conn = ctx
        .registry
        .get(connection_id)
        .await
        .ok_or_else(|| RtmError::BadRequest(format!("no such connection {connection_id:?}")))?;
    conn.request_close();
    Ok(json!({}))
}
