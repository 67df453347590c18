//! Per-WebSocket connection state: identity, permissions, open
//! subscriptions, and the serialized outbound send path (SPEC_FULL.md §4.2).

pub mod registry;

pub use registry::ConnectionRegistry;

use crate::apps_config::Permission;
use crate::backend::StreamCursor;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio_tungstenite::tungstenite::Message;

/// Owned by a subscription's [`crate::worker`] task; held in
/// `ConnectionState::subscriptions` so `rtm/unsubscribe` and connection
/// teardown can cancel it.
pub struct SubscriptionHandle {
    pub channel: String,
    pub position: Option<StreamCursor>,
    pub filter: Option<String>,
    cancel: Option<oneshot::Sender<()>>,
    join: tokio::task::JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn new(
        channel: String,
        position: Option<StreamCursor>,
        filter: Option<String>,
        cancel: oneshot::Sender<()>,
        join: tokio::task::JoinHandle<()>,
    ) -> Self {
        Self {
            channel,
            position,
            filter,
            cancel: Some(cancel),
            join,
        }
    }

    /// Signal cancellation and wait for the worker to finish releasing its
    /// backend connection. Idempotent: a handle is only ever cancelled once,
    /// since it is removed from the connection's map in the same step.
    pub async fn cancel(mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
        let _ = self.join.await;
    }
}

/// Sending half of the per-connection serialized send path: every handler
/// and every subscription worker holds a clone of this, never the WebSocket
/// sink itself, so at most one frame is ever in flight on the wire.
#[derive(Clone)]
pub struct SendPath {
    tx: mpsc::UnboundedSender<Message>,
    ok: Arc<AtomicBool>,
}

impl SendPath {
    /// Send one frame. Returns `false` (without panicking) once the
    /// connection has been marked not-ok — callers use this to stop
    /// producing further frames rather than queuing into a dead channel.
    pub fn send_text(&self, text: String) -> bool {
        if !self.ok.load(Ordering::Acquire) {
            return false;
        }
        self.tx.send(Message::Text(text)).is_ok()
    }

    pub fn is_ok(&self) -> bool {
        self.ok.load(Ordering::Acquire)
    }

    pub fn mark_not_ok(&self) {
        self.ok.store(false, Ordering::Release);
    }

    /// Send a non-text frame (e.g. a `Pong` reply to a `Ping`) through the
    /// same serialized path as every JSON frame, so the writer task never
    /// sees two concurrent senders.
    pub fn send_raw(&self, msg: Message) -> bool {
        if !self.ok.load(Ordering::Acquire) {
            return false;
        }
        self.tx.send(msg).is_ok()
    }
}

pub struct ConnectionState {
    pub connection_id: String,
    pub peer: Option<SocketAddr>,
    pub appkey: String,
    pub authenticated: AtomicBool,
    pub role: Mutex<Option<String>>,
    pub permissions: Mutex<HashSet<Permission>>,
    /// Consumed exactly once by `auth/authenticate`; cleared on both success
    /// and failure so a second authenticate always fails (SPEC_FULL.md §4.4).
    pub nonce: Mutex<Option<Vec<u8>>>,
    pub subscriptions: Mutex<HashMap<String, SubscriptionHandle>>,
    pub max_subscriptions: usize,
    send_path: SendPath,
    /// Signaled by `admin/close_connection` to wake the connection's
    /// read-loop `select!` even when no inbound frame is pending.
    pub close: Notify,
}

impl ConnectionState {
    pub fn new(appkey: String, peer: Option<SocketAddr>, max_subscriptions: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let send_path = SendPath {
            tx,
            ok: Arc::new(AtomicBool::new(true)),
        };
        let state = Arc::new(Self {
            connection_id: uuid::Uuid::new_v4().to_string(),
            peer,
            appkey,
            authenticated: AtomicBool::new(false),
            role: Mutex::new(None),
            permissions: Mutex::new(HashSet::new()),
            nonce: Mutex::new(None),
            subscriptions: Mutex::new(HashMap::new()),
            max_subscriptions,
            send_path,
            close: Notify::new(),
        });
        (state, rx)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn is_ok(&self) -> bool {
        self.send_path.is_ok()
    }

    pub fn send_path(&self) -> SendPath {
        self.send_path.clone()
    }

    pub fn send_frame(&self, text: String) -> bool {
        self.send_path.send_text(text)
    }

    pub fn mark_not_ok(&self) {
        self.send_path.mark_not_ok();
    }

    /// Used by `admin/close_connection`: mark not-ok and wake the owning
    /// connection's read loop so it tears down even with no inbound traffic.
    pub fn request_close(&self) {
        self.mark_not_ok();
        self.close.notify_waiters();
    }

    /// Cancel every owned subscription worker — called on socket close,
    /// fatal protocol error, or `admin/close_connection`.
    pub async fn teardown(&self) {
        self.mark_not_ok();
        let handles: Vec<SubscriptionHandle> = {
            let mut subs = self.subscriptions.lock().await;
            subs.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            handle.cancel().await;
        }
    }
}
