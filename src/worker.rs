//! The subscription worker: tails one backend stream and delivers ordered
//! frames to its owning connection (SPEC_FULL.md §4.7).
//!
//! One worker per subscription, each holding its own dedicated (leased)
//! backend connection — blocking `XREAD` is never multiplexed with
//! request/response traffic (SPEC_FULL.md §4.1.1, §9 "Blocking backend
//! reads -> dedicated connections").

use crate::backend::{ReadFrom, StreamCursor};
use crate::connection::ConnectionState;
use crate::context::EngineContext;
use crate::filter::{EqualityFilter, MessageFilter};
use crate::protocol::OutboundFrame;
use crate::retry::{next_delay, RetryConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub struct WorkerSpec {
    pub subscription_id: String,
    pub stream: String,
    pub start: StreamCursor,
    pub filter: Option<String>,
    pub batch_size: usize,
}

/// Spawn the worker task. The returned `JoinHandle` is what
/// `SubscriptionHandle::cancel` awaits after signaling `cancel_rx`.
pub fn spawn(spec: WorkerSpec, conn: Arc<ConnectionState>, ctx: EngineContext, cancel_rx: oneshot::Receiver<()>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run(spec, conn, ctx, cancel_rx))
}

async fn run(spec: WorkerSpec, conn: Arc<ConnectionState>, ctx: EngineContext, mut cancel_rx: oneshot::Receiver<()>) {
    let WorkerSpec { subscription_id, stream, start, filter, batch_size } = spec;
    let batch_size = if batch_size == 0 { 1 } else { batch_size };
    let filter_evaluator = EqualityFilter;

    // Unbounded retry (reconnect until cancelled), so only the backoff shape
    // from `RetryConfig` is reused here, not `retry_with_backoff`'s bounded loop.
    let backoff = RetryConfig {
        max_attempts: u32::MAX,
        initial_delay: ctx.config.worker_reconnect_initial_delay,
        max_delay: Duration::from_secs(30),
        multiplier: 2.0,
    };
    let mut delay = backoff.initial_delay;
    let mut cursor = start;

    loop {
        let read = ReadFrom { stream: stream.clone(), after: cursor };
        tokio::select! {
            biased;
            _ = &mut cancel_rx => {
                debug!(subscription_id = %subscription_id, "subscription cancelled");
                return;
            }
            result = ctx.backend.blocking_read(std::slice::from_ref(&read)) => {
                match result {
                    Ok(entries) => {
                        delay = backoff.initial_delay;
                        let mut batch: Vec<Value> = Vec::with_capacity(entries.len());
                        for (_stream_name, entry) in entries {
                            // Advance past every entry the backend returned,
                            // delivered or not, so a non-matching filter or a
                            // decode failure can never make the same entry
                            // come back on the next read.
                            cursor = entry.cursor;
                            match serde_json::from_str::<Value>(&entry.json) {
                                Ok(msg) => {
                                    let keep = match &filter {
                                        Some(f) => filter_evaluator.matches(f, &msg),
                                        None => true,
                                    };
                                    if keep {
                                        batch.push(msg);
                                        if batch.len() >= batch_size && !flush(&subscription_id, &mut batch, cursor, &conn) {
                                            return;
                                        }
                                    }
                                }
                                Err(e) => {
                                    let frame = OutboundFrame::unsolicited(
                                        "rtm/subscription/error",
                                        json!({
                                            "subscription_id": subscription_id,
                                            "position": entry.cursor.to_string(),
                                            "error": format!("decode failure: {e}"),
                                        }),
                                    );
                                    if !conn.send_frame(frame.to_text()) {
                                        return;
                                    }
                                }
                            }
                        }
                        if !batch.is_empty() && !flush(&subscription_id, &mut batch, cursor, &conn) {
                            return;
                        }
                    }
                    Err(e) if e.is_transient() => {
                        warn!(subscription_id = %subscription_id, err = %e, delay_ms = delay.as_millis(), "backend unavailable, reconnecting");
                        tokio::time::sleep(delay).await;
                        delay = next_delay(delay, &backoff);
                        // The cursor is left untouched: it never regresses,
                        // and the next `blocking_read` opens a fresh leased
                        // connection (see `RedisBackend::lease`).
                    }
                    Err(e) => {
                        warn!(subscription_id = %subscription_id, err = %e, "fatal backend error, terminating subscription");
                        conn.subscriptions.lock().await.remove(&subscription_id);
                        return;
                    }
                }
            }
        }
    }
}

/// Send one batch as `rtm/subscription/data`. Returns `false` on send
/// failure — a connection-level send failure is fatal to every worker on
/// that connection, so the caller returns immediately rather than retrying.
fn flush(subscription_id: &str, batch: &mut Vec<Value>, position: StreamCursor, conn: &ConnectionState) -> bool {
    let messages: Vec<Value> = batch.drain(..).collect();
    let frame = OutboundFrame::unsolicited(
        "rtm/subscription/data",
        json!({ "subscription_id": subscription_id, "messages": messages, "position": position.to_string() }),
    );
    conn.send_frame(frame.to_text())
}
