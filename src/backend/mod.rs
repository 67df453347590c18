//! Typed wrapper over the Redis-protocol backend: stream storage plus
//! cluster admin commands, used by both the protocol engine and the
//! reshard coordinator.

pub mod client;
pub mod cluster;

#[cfg(test)]
pub mod fake;

pub use client::RedisBackend;

use crate::error::BackendError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Opaque, monotonically-increasing position within one stream: `"<ms>-<seq>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCursor {
    pub ms: u64,
    pub seq: u64,
}

impl StreamCursor {
    pub const ZERO: StreamCursor = StreamCursor { ms: 0, seq: 0 };
}

impl fmt::Display for StreamCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl std::str::FromStr for StreamCursor {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ms, seq) = s.split_once('-').ok_or(())?;
        Ok(StreamCursor {
            ms: ms.parse().map_err(|_| ())?,
            seq: seq.parse().map_err(|_| ())?,
        })
    }
}

impl PartialOrd for StreamCursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StreamCursor {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.ms, self.seq).cmp(&(other.ms, other.seq))
    }
}

/// One decoded stream record: its cursor and the raw `json` field payload.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub cursor: StreamCursor,
    pub json: String,
}

#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub id: String,
    pub ip: String,
    pub port: u16,
    pub is_master: bool,
    pub slots: Vec<(u16, u16)>,
}

impl NodeInfo {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// What [`Backend::blocking_read`] waits on: a stream name and the cursor to
/// read strictly after.
#[derive(Debug, Clone)]
pub struct ReadFrom {
    pub stream: String,
    pub after: StreamCursor,
}

/// The operations the protocol engine and the reshard coordinator need from
/// the backend. A trait, not a concrete struct, so tests can substitute a
/// fake implementation instead of a live Redis-compatible server.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn append(&self, stream: &str, field: &str, data: &str, max_len: usize) -> Result<StreamCursor, BackendError>;

    async fn rev_range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BackendError>;

    /// Blocks until at least one entry past `after` appears on any listed
    /// stream. Implementations must use a dedicated (leased) connection,
    /// never one shared with request/response traffic.
    async fn blocking_read(&self, reads: &[ReadFrom]) -> Result<Vec<(String, StreamEntry)>, BackendError>;

    /// `rtm/read`: the newest entry (`position` absent) or the exact entry at
    /// `position`. Implementations must use a dedicated connection for the
    /// duration of the call and release it on every exit path (SPEC_FULL.md §4.6).
    async fn read_one(&self, stream: &str, position: Option<StreamCursor>) -> Result<Option<StreamEntry>, BackendError>;

    async fn delete(&self, key: &str) -> Result<(), BackendError>;
    async fn exists(&self, key: &str) -> Result<bool, BackendError>;
    async fn ping(&self) -> Result<(), BackendError>;

    async fn cluster_nodes(&self) -> Result<Vec<NodeInfo>, BackendError>;
    async fn cluster_slots(&self) -> Result<Vec<NodeInfo>, BackendError>;
    async fn cluster_set_slot(&self, node_addr: &str, slot: u16, state: SetSlotState, node_id: &str) -> Result<(), BackendError>;
    async fn cluster_get_keys_in_slot(&self, node_addr: &str, slot: u16, count: usize) -> Result<Vec<String>, BackendError>;
    async fn migrate(&self, node_addr: &str, dest_host: &str, dest_port: u16, timeout_ms: u64, keys: &[String]) -> Result<(), BackendError>;
}

#[derive(Debug, Clone, Copy)]
pub enum SetSlotState {
    Importing,
    Migrating,
    Node,
}

impl SetSlotState {
    pub fn as_str(self) -> &'static str {
        match self {
            SetSlotState::Importing => "IMPORTING",
            SetSlotState::Migrating => "MIGRATING",
            SetSlotState::Node => "NODE",
        }
    }
}
