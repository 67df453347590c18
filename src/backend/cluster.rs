//! Redis Cluster hash-slot routing: local slot computation plus a topology
//! cache that is corrected in place on MOVED/ASK redirects and otherwise
//! refreshed only on a bounded TTL (never recomputed from scratch per command).

use super::NodeInfo;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

pub const SLOT_COUNT: u16 = 16384;

/// CRC16 (XMODEM variant) over `buf`, per the Redis Cluster spec — the same
/// fixed algorithm every Redis Cluster client implements locally.
fn crc16(buf: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in buf {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// The hash slot for `key`, honoring `{hash-tag}` substrings: if `key`
/// contains a `{...}` with non-empty contents, only that substring is hashed
/// so related keys can be colocated on one node.
pub fn key_slot(key: &str) -> u16 {
    let hashed = match (key.find('{'), key.find('}')) {
        (Some(open), Some(close)) if close > open + 1 => &key[open + 1..close],
        _ => key,
    };
    crc16(hashed.as_bytes()) % SLOT_COUNT
}

struct CacheEntry {
    node: NodeInfo,
    fetched_at: Instant,
}

/// Slot -> owning node, refreshed lazily on a TTL and eagerly on redirects.
pub struct TopologyCache {
    ttl: Duration,
    slots: RwLock<HashMap<u16, CacheEntry>>,
}

impl TopologyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the whole cache from a fresh `CLUSTER SLOTS` snapshot.
    pub fn replace(&self, nodes: Vec<NodeInfo>) {
        let now = Instant::now();
        let mut slots = self.slots.write().expect("topology cache lock poisoned");
        slots.clear();
        for node in nodes {
            for &(start, end) in &node.slots {
                for slot in start..=end {
                    slots.insert(
                        slot,
                        CacheEntry {
                            node: node.clone(),
                            fetched_at: now,
                        },
                    );
                }
            }
        }
    }

    /// Correct one slot in place after a MOVED/ASK redirect named `node` as
    /// the authoritative owner — no full re-fetch needed.
    pub fn redirect(&self, slot: u16, node: NodeInfo) {
        let mut slots = self.slots.write().expect("topology cache lock poisoned");
        slots.insert(
            slot,
            CacheEntry {
                node,
                fetched_at: Instant::now(),
            },
        );
    }

    /// The node presently believed to own `slot`, along with whether the
    /// entry is stale and a caller should schedule a background refresh.
    pub fn owner(&self, slot: u16) -> Option<(NodeInfo, bool)> {
        let slots = self.slots.read().expect("topology cache lock poisoned");
        slots.get(&slot).map(|e| (e.node.clone(), e.fetched_at.elapsed() > self.ttl))
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().expect("topology cache lock poisoned").is_empty()
    }
}
