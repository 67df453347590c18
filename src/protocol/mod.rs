//! PDU envelope, the closed action table, and the decode → permission-gate →
//! dispatch pipeline (SPEC_FULL.md §4.3).

use crate::apps_config::Permission;
use crate::error::RtmError;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

#[derive(Debug, Deserialize)]
pub struct InboundFrame {
    pub action: String,
    #[serde(default = "default_id")]
    pub id: i64,
    #[serde(default)]
    pub body: Value,
}

fn default_id() -> i64 {
    1
}

#[derive(Debug, Serialize)]
pub struct OutboundFrame {
    pub action: String,
    pub id: i64,
    pub body: Value,
}

impl OutboundFrame {
    pub fn ok(action: Action, id: i64, body: Value) -> Self {
        Self {
            action: format!("{}/ok", action.as_str()),
            id,
            body,
        }
    }

    pub fn error_for(action_str: &str, id: i64, err: &RtmError) -> Self {
        Self {
            action: format!("{action_str}/error"),
            id,
            body: serde_json::json!({ "error": err.to_string(), "kind": err.kind() }),
        }
    }

    /// An unsolicited frame not issued in reply to any request `id`
    /// (`rtm/subscription/data`, `rtm/subscription/error`) — these omit `id`
    /// on the wire; we carry `0` so the shape stays uniform across every
    /// frame the server ever writes.
    pub fn unsolicited(action: &str, body: Value) -> Self {
        Self {
            action: action.to_string(),
            id: 0,
            body,
        }
    }

    pub fn bad_schema(id: i64, raw: &str) -> Self {
        Self {
            action: "bad_schema".to_string(),
            id,
            body: serde_json::json!({
                "error": "bad_schema",
                "reason": base64::engine::general_purpose::STANDARD.encode(raw.as_bytes()),
            }),
        }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"action":"bad_schema","id":1,"body":{"error":"internal serialization failure"}}"#.to_string()
        })
    }
}

/// The fixed action table, modeled as a closed enum per SPEC_FULL.md §9
/// ("typed dispatch") rather than a runtime string→handler map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    AuthHandshake,
    AuthAuthenticate,
    RtmPublish,
    RtmSubscribe,
    RtmUnsubscribe,
    RtmRead,
    RtmWrite,
    RtmDelete,
    AdminCloseConnection,
    AdminGetConnections,
}

impl Action {
    pub fn parse(action: &str) -> Option<Self> {
        Some(match action {
            "auth/handshake" => Action::AuthHandshake,
            "auth/authenticate" => Action::AuthAuthenticate,
            "rtm/publish" => Action::RtmPublish,
            "rtm/subscribe" => Action::RtmSubscribe,
            "rtm/unsubscribe" => Action::RtmUnsubscribe,
            "rtm/read" => Action::RtmRead,
            "rtm/write" => Action::RtmWrite,
            "rtm/delete" => Action::RtmDelete,
            "admin/close_connection" => Action::AdminCloseConnection,
            "admin/get_connections" => Action::AdminGetConnections,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::AuthHandshake => "auth/handshake",
            Action::AuthAuthenticate => "auth/authenticate",
            Action::RtmPublish => "rtm/publish",
            Action::RtmSubscribe => "rtm/subscribe",
            Action::RtmUnsubscribe => "rtm/unsubscribe",
            Action::RtmRead => "rtm/read",
            Action::RtmWrite => "rtm/write",
            Action::RtmDelete => "rtm/delete",
            Action::AdminCloseConnection => "admin/close_connection",
            Action::AdminGetConnections => "admin/get_connections",
        }
    }

    fn group_verb(&self) -> (&'static str, &'static str) {
        self.as_str().split_once('/').expect("every action name contains a '/'")
    }
}

/// `validatePermissions(perms, action)` from SPEC_FULL.md §4.3: `auth/*` is
/// always allowed, `*/unsubscribe` is always allowed, `admin/*` requires the
/// `admin` permission, everything else requires its verb as a permission.
pub fn validate_permissions(perms: &HashSet<Permission>, action: Action) -> bool {
    let (group, verb) = action.group_verb();
    if group == "auth" {
        return true;
    }
    if verb == "unsubscribe" {
        return true;
    }
    if group == "admin" {
        return perms.contains(&Permission::Admin);
    }
    verb.parse::<Permission>().map(|p| perms.contains(&p)).unwrap_or(false)
}

/// Decode one raw inbound frame. A parse failure or unknown action both
/// surface as `RtmError::BadSchema`, matching SPEC_FULL.md §4.3 steps 1-2.
pub fn decode(raw: &str) -> Result<(InboundFrame, Action), RtmError> {
    let frame: InboundFrame = serde_json::from_str(raw).map_err(|e| RtmError::BadSchema(e.to_string()))?;
    let action = Action::parse(&frame.action).ok_or_else(|| RtmError::BadSchema(format!("unknown action {:?}", frame.action)))?;
    Ok((frame, action))
}
