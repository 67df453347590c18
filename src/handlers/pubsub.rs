//! `rtm/publish`, `rtm/subscribe`, `rtm/unsubscribe` (SPEC_FULL.md §4.5).

use crate::backend::StreamCursor;
use crate::connection::{ConnectionState, SubscriptionHandle};
use crate::context::EngineContext;
use crate::error::RtmError;
use crate::handlers::require_str;
use crate::worker::{self, WorkerSpec};
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;

pub(crate) fn stream_name(appkey: &str, channel: &str) -> String {
    format!("{appkey}::{channel}")
}

/// Shared append path for both `rtm/publish` and `rtm/write`, which are
/// identical except for their reply action name.
pub(crate) async fn publish_core(body: &Value, conn: &ConnectionState, ctx: &EngineContext) -> Result<Value, RtmError> {
    let channel = require_str(body, "channel")?;
    let message = body.get("message").ok_or_else(|| RtmError::BadRequest("message".to_string()))?;

    let stream = stream_name(&conn.appkey, channel);
    let cursor = ctx
        .backend
        .append(&stream, "json", &message.to_string(), ctx.config.stream_max_len)
        .await?;
    Ok(json!({ "stream": cursor.to_string() }))
}

pub async fn publish(body: &Value, conn: &ConnectionState, ctx: &EngineContext) -> Result<Value, RtmError> {
    publish_core(body, conn, ctx).await
}

pub async fn subscribe(body: &Value, conn: &Arc<ConnectionState>, ctx: &EngineContext) -> Result<Value, RtmError> {
    let channel = require_str(body, "channel")?.to_string();
    let subscription_id = body
        .get("subscription_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| channel.clone());

    let filter = body.get("filter").and_then(Value::as_str).map(str::to_string);
    let batch_size = body.get("batch_size").and_then(Value::as_u64).unwrap_or(1) as usize;

    let position = match body.get("position").and_then(Value::as_str) {
        Some(text) => Some(StreamCursor::from_str(text).map_err(|_| RtmError::BadRequest("position".to_string()))?),
        None => None,
    };

    {
        let subs = conn.subscriptions.lock().await;
        if subs.contains_key(&subscription_id) {
            return Err(RtmError::DuplicateSubscription(subscription_id));
        }
        // Resource-exhaustion guard, not a pub/sub semantics change (SPEC_FULL.md §4.5).
        if subs.len() >= conn.max_subscriptions {
            return Err(RtmError::BadRequest(format!("max_subscriptions ({}) exceeded", conn.max_subscriptions)));
        }
    }

    let stream = stream_name(&conn.appkey, &channel);
    let start = match position {
        Some(p) => p,
        None => {
            let newest = ctx.backend.rev_range(&stream, "+", "-", 1).await?;
            newest.first().map(|e| e.cursor).unwrap_or(StreamCursor::ZERO)
        }
    };

    let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel();
    let spec = WorkerSpec {
        subscription_id: subscription_id.clone(),
        stream,
        start,
        filter: filter.clone(),
        batch_size,
    };
    let join = worker::spawn(spec, conn.clone(), ctx.clone(), cancel_rx);

    conn.subscriptions
        .lock()
        .await
        .insert(subscription_id.clone(), SubscriptionHandle::new(channel, Some(start), filter, cancel_tx, join));

    Ok(json!({ "subscription_id": subscription_id, "position": start.to_string() }))
}

pub async fn unsubscribe(body: &Value, conn: &ConnectionState) -> Result<Value, RtmError> {
    let subscription_id = require_str(body, "subscription_id")?;
    let handle = conn.subscriptions.lock().await.remove(subscription_id);
    match handle {
        Some(handle) => {
            handle.cancel().await;
            Ok(json!({}))
        }
        None => Err(RtmError::UnknownSubscription(subscription_id.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps_config::AppsConfig;
    use crate::backend::fake::FakeBackend;
    use crate::config::RtmConfig;
    use std::collections::HashSet;
    use std::io::Write;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message;

    fn ctx_with_cap(max_subscriptions: usize) -> EngineContext {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(br#"{"K": {"roles": {"pub": {"secret": "s", "permissions": ["publish", "subscribe"]}}}}"#)
            .unwrap();
        let apps_config = Arc::new(AppsConfig::load(f.path()).unwrap());
        let backend: Arc<dyn crate::backend::Backend> = Arc::new(FakeBackend::new());
        let config = Arc::new(RtmConfig {
            host: "0.0.0.0".into(),
            port: 0,
            apps_config_path: "/dev/null".into(),
            backend_url: "redis://127.0.0.1".into(),
            backend_password: None,
            cluster: false,
            max_subscriptions,
            idle_timeout: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(1),
            stream_max_len: 10,
            worker_reconnect_initial_delay: Duration::from_millis(1),
            log: "info".into(),
        });
        EngineContext::new(apps_config, backend, config)
    }

    fn test_ctx() -> EngineContext {
        ctx_with_cap(2)
    }

    #[tokio::test]
    async fn publish_returns_stream_cursor() {
        let ctx = test_ctx();
        let (conn, _rx) = ConnectionState::new("K".to_string(), None, 10);
        let reply = publish(&json!({"channel": "c", "message": {"x": 1}}), &conn, &ctx).await.unwrap();
        assert!(reply["stream"].as_str().is_some());
    }

    #[tokio::test]
    async fn publish_missing_fields_is_bad_request() {
        let ctx = test_ctx();
        let (conn, _rx) = ConnectionState::new("K".to_string(), None, 10);
        assert!(publish(&json!({"channel": "c"}), &conn, &ctx).await.is_err());
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe_round_trip() {
        let ctx = test_ctx();
        let (conn, mut rx) = ConnectionState::new("K".to_string(), None, 10);

        let reply = subscribe(&json!({"channel": "c", "subscription_id": "s"}), &conn, &ctx).await.unwrap();
        assert_eq!(reply["subscription_id"], "s");
        assert_eq!(conn.subscriptions.lock().await.len(), 1);

        publish(&json!({"channel": "c", "message": {"x": 1}}), &conn, &ctx).await.unwrap();
        let Message::Text(data) = rx.recv().await.unwrap() else { panic!("expected text") };
        let data: Value = serde_json::from_str(&data).unwrap();
        assert_eq!(data["action"], "rtm/subscription/data");

        unsubscribe(&json!({"subscription_id": "s"}), &conn).await.unwrap();
        assert!(conn.subscriptions.lock().await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_subscription_id_is_rejected() {
        let ctx = test_ctx();
        let (conn, _rx) = ConnectionState::new("K".to_string(), None, 10);
        subscribe(&json!({"channel": "c", "subscription_id": "s"}), &conn, &ctx).await.unwrap();
        let err = subscribe(&json!({"channel": "other", "subscription_id": "s"}), &conn, &ctx).await;
        assert!(matches!(err, Err(RtmError::DuplicateSubscription(_))));
    }

    #[tokio::test]
    async fn unsubscribe_unknown_id_is_rejected() {
        let ctx = test_ctx();
        let (conn, _rx) = ConnectionState::new("K".to_string(), None, 10);
        let err = unsubscribe(&json!({"subscription_id": "missing"}), &conn).await;
        assert!(matches!(err, Err(RtmError::UnknownSubscription(_))));
    }

    #[tokio::test]
    async fn subscribe_cap_is_enforced() {
        let ctx = test_ctx();
        let (conn, _rx) = ConnectionState::new("K".to_string(), None, 10);
        subscribe(&json!({"channel": "a", "subscription_id": "1"}), &conn, &ctx).await.unwrap();
        subscribe(&json!({"channel": "b", "subscription_id": "2"}), &conn, &ctx).await.unwrap();
        let err = subscribe(&json!({"channel": "c", "subscription_id": "3"}), &conn, &ctx).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn bad_position_is_rejected() {
        let ctx = test_ctx();
        let (conn, _rx) = ConnectionState::new("K".to_string(), None, 10);
        let err = subscribe(&json!({"channel": "c", "position": "not-a-cursor"}), &conn, &ctx).await;
        assert!(matches!(err, Err(RtmError::BadRequest(_))));
    }

    proptest::proptest! {
        #[test]
        fn subscription_ids_stay_unique_over_any_action_sequence(
            actions in proptest::collection::vec((0u8..2, 0u8..4), 1..40),
        ) {
            // A cap well above the id pool (4 ids) so the max_subscriptions guard
            // never interferes with the uniqueness property under test.
            let ctx = ctx_with_cap(8);
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let (conn, _rx) = ConnectionState::new("K".to_string(), None, 10);
                let mut live: HashSet<String> = HashSet::new();

                for (kind, id_idx) in actions {
                    let id = format!("sub-{id_idx}");
                    if kind == 0 {
                        let result = subscribe(&json!({"channel": id, "subscription_id": id}), &conn, &ctx).await;
                        if live.contains(&id) {
                            assert!(matches!(result, Err(RtmError::DuplicateSubscription(_))));
                        } else {
                            assert!(result.is_ok());
                            live.insert(id.clone());
                        }
                    } else {
                        let result = unsubscribe(&json!({"subscription_id": id}), &conn).await;
                        if live.remove(&id) {
                            assert!(result.is_ok());
                        } else {
                            assert!(matches!(result, Err(RtmError::UnknownSubscription(_))));
                        }
                    }
                    let actual: HashSet<String> = conn.subscriptions.lock().await.keys().cloned().collect();
                    assert_eq!(actual, live, "no two live subscriptions ever share an id");
                }
            });
        }
    }
}
