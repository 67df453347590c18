//! Decode → authenticate-gate → permission-gate → handler dispatch
//! (SPEC_FULL.md §4.3). This is the one place that wires the closed
//! [`Action`] table to its concrete implementation.

pub mod admin;
pub mod auth;
pub mod kv;
pub mod pubsub;

use crate::connection::ConnectionState;
use crate::context::EngineContext;
use crate::error::RtmError;
use crate::protocol::{self, Action, OutboundFrame};
use serde_json::Value;
use std::sync::Arc;

pub(crate) fn require_str<'a>(body: &'a Value, field: &str) -> Result<&'a str, RtmError> {
    body.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| RtmError::BadRequest(field.to_string()))
}

/// Decode one raw inbound frame and run it to an outbound reply. Never
/// returns `Err`: every failure becomes an `/error` (or, for an undecodable
/// frame, a `bad_schema`) `OutboundFrame` with `conn` marked not-ok where the
/// spec requires it.
pub async fn handle_frame(raw: &str, conn: &Arc<ConnectionState>, ctx: &EngineContext) -> OutboundFrame {
    let (frame, action) = match protocol::decode(raw) {
        Ok(parsed) => parsed,
        Err(_) => {
            conn.mark_not_ok();
            return OutboundFrame::bad_schema(1, raw);
        }
    };

    let result = run(action, &frame.body, conn, ctx).await;
    match result {
        Ok(body) => OutboundFrame::ok(action, frame.id, body),
        Err(err) => {
            if err.is_fatal_to_connection() {
                conn.mark_not_ok();
            }
            OutboundFrame::error_for(action.as_str(), frame.id, &err)
        }
    }
}

async fn run(action: Action, body: &Value, conn: &Arc<ConnectionState>, ctx: &EngineContext) -> Result<Value, RtmError> {
    let is_auth_action = matches!(action, Action::AuthHandshake | Action::AuthAuthenticate);
    if !is_auth_action && !conn.is_authenticated() {
        return Err(RtmError::Unauthenticated { action: action.as_str().to_string() });
    }

    let perms = conn.permissions.lock().await.clone();
    if !protocol::validate_permissions(&perms, action) {
        return Err(RtmError::PermissionDenied { action: action.as_str().to_string() });
    }

    match action {
        Action::AuthHandshake => auth::handshake(body, conn, ctx).await,
        Action::AuthAuthenticate => auth::authenticate(body, conn, ctx).await,
        Action::RtmPublish => pubsub::publish(body, conn, ctx).await,
        Action::RtmSubscribe => pubsub::subscribe(body, conn, ctx).await,
        Action::RtmUnsubscribe => pubsub::unsubscribe(body, conn).await,
        Action::RtmRead => kv::read(body, conn, ctx).await,
        Action::RtmWrite => kv::write(body, conn, ctx).await,
        Action::RtmDelete => kv::delete(body, conn, ctx).await,
        Action::AdminGetConnections => admin::get_connections(ctx).await,
        Action::AdminCloseConnection => admin::close_connection(body, ctx).await,
    }
}
