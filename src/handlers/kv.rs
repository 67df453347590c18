//! `rtm/read`, `rtm/write`, `rtm/delete` (SPEC_FULL.md §4.6).

use crate::connection::ConnectionState;
use crate::context::EngineContext;
use crate::error::RtmError;
use crate::handlers::{pubsub, require_str};
use serde_json::{json, Value};

pub async fn read(body: &Value, conn: &ConnectionState, ctx: &EngineContext) -> Result<Value, RtmError> {
    let channel = require_str(body, "channel")?;
    let position = match body.get("position").and_then(Value::as_str) {
        Some(text) => Some(
            text.parse::<crate::backend::StreamCursor>()
                .map_err(|_| RtmError::BadRequest("position".to_string()))?,
        ),
        None => None,
    };

    let stream = pubsub::stream_name(&conn.appkey, channel);
    let entry = ctx.backend.read_one(&stream, position).await?;
    let message = match entry {
        Some(entry) => serde_json::from_str(&entry.json).map_err(|e| RtmError::BadRequest(format!("stored entry is not valid json: {e}")))?,
        None => Value::Null,
    };
    Ok(json!({ "message": message }))
}

/// Identical append semantics to `rtm/publish`, just a different reply action name.
pub async fn write(body: &Value, conn: &ConnectionState, ctx: &EngineContext) -> Result<Value, RtmError> {
    pubsub::publish_core(body, conn, ctx).await
}

pub async fn delete(body: &Value, conn: &ConnectionState, ctx: &EngineContext) -> Result<Value, RtmError> {
    let channel = require_str(body, "channel")?;
    let stream = pubsub::stream_name(&conn.appkey, channel);
    ctx.backend.delete(&stream).await?;
    Ok(json!({}))
}
