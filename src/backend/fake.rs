//! In-memory [`Backend`] double, so the protocol engine's handler and
//! worker tests never need a live Redis-compatible server.

use super::{Backend, NodeInfo, ReadFrom, SetSlotState, StreamCursor, StreamEntry};
use crate::error::BackendError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, Notify};

#[derive(Default)]
pub struct FakeBackend {
    streams: Mutex<HashMap<String, Vec<StreamEntry>>>,
    notify: Notify,
    cursor_counter: AtomicU64,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn append(&self, stream: &str, _field: &str, data: &str, max_len: usize) -> Result<StreamCursor, BackendError> {
        let ms = self.cursor_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let cursor = StreamCursor { ms, seq: 0 };
        {
            let mut streams = self.streams.lock().await;
            let entries = streams.entry(stream.to_string()).or_default();
            entries.push(StreamEntry { cursor, json: data.to_string() });
            if entries.len() > max_len {
                let excess = entries.len() - max_len;
                entries.drain(0..excess);
            }
        }
        self.notify.notify_waiters();
        Ok(cursor)
    }

    async fn rev_range(&self, stream: &str, start: &str, end: &str, count: usize) -> Result<Vec<StreamEntry>, BackendError> {
        let streams = self.streams.lock().await;
        let entries = streams.get(stream).cloned().unwrap_or_default();
        if start == "+" && end == "-" {
            Ok(entries.iter().rev().take(count).cloned().collect())
        } else {
            let target: StreamCursor = start
                .parse()
                .map_err(|_| BackendError::Protocol(format!("unparseable cursor {start:?}")))?;
            Ok(entries.iter().filter(|e| e.cursor == target).take(count).cloned().collect())
        }
    }

    async fn blocking_read(&self, reads: &[ReadFrom]) -> Result<Vec<(String, StreamEntry)>, BackendError> {
        loop {
            {
                let streams = self.streams.lock().await;
                let mut out: Vec<(String, StreamEntry)> = Vec::new();
                for r in reads {
                    if let Some(entries) = streams.get(&r.stream) {
                        out.extend(entries.iter().filter(|e| e.cursor > r.after).map(|e| (r.stream.clone(), e.clone())));
                    }
                }
                if !out.is_empty() {
                    out.sort_by_key(|(_, e)| e.cursor);
                    return Ok(out);
                }
            }
            self.notify.notified().await;
        }
    }

    async fn read_one(&self, stream: &str, position: Option<StreamCursor>) -> Result<Option<StreamEntry>, BackendError> {
        let streams = self.streams.lock().await;
        let entries = streams.get(stream).cloned().unwrap_or_default();
        Ok(match position {
            Some(target) => entries.into_iter().find(|e| e.cursor == target),
            None => entries.into_iter().next_back(),
        })
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.streams.lock().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        Ok(self.streams.lock().await.contains_key(key))
    }

    async fn ping(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn cluster_nodes(&self) -> Result<Vec<NodeInfo>, BackendError> {
        Ok(Vec::new())
    }

    async fn cluster_slots(&self) -> Result<Vec<NodeInfo>, BackendError> {
        Ok(Vec::new())
    }

    async fn cluster_set_slot(&self, _node_addr: &str, _slot: u16, _state: SetSlotState, _node_id: &str) -> Result<(), BackendError> {
        Ok(())
    }

    async fn cluster_get_keys_in_slot(&self, _node_addr: &str, _slot: u16, _count: usize) -> Result<Vec<String>, BackendError> {
        Ok(Vec::new())
    }

    async fn migrate(&self, _node_addr: &str, _dest_host: &str, _dest_port: u16, _timeout_ms: u64, _keys: &[String]) -> Result<(), BackendError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_then_rev_range_newest() {
        let backend = FakeBackend::new();
        backend.append("s", "json", "{\"a\":1}", 100).await.unwrap();
        backend.append("s", "json", "{\"a\":2}", 100).await.unwrap();
        let newest = backend.rev_range("s", "+", "-", 1).await.unwrap();
        assert_eq!(newest.len(), 1);
        assert_eq!(newest[0].json, "{\"a\":2}");
    }

    #[tokio::test]
    async fn blocking_read_wakes_on_append() {
        let backend = std::sync::Arc::new(FakeBackend::new());
        let b2 = backend.clone();
        let handle = tokio::spawn(async move {
            b2.blocking_read(&[ReadFrom { stream: "s".to_string(), after: StreamCursor::ZERO }]).await
        });
        tokio::task::yield_now().await;
        backend.append("s", "json", "{\"a\":1}", 100).await.unwrap();
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].0, "s");
    }

    #[tokio::test]
    async fn read_one_returns_newest_with_no_position() {
        let backend = FakeBackend::new();
        backend.append("s", "json", "first", 100).await.unwrap();
        backend.append("s", "json", "second", 100).await.unwrap();
        let entry = backend.read_one("s", None).await.unwrap().unwrap();
        assert_eq!(entry.json, "second");
    }

    #[tokio::test]
    async fn read_one_empty_stream_is_none() {
        let backend = FakeBackend::new();
        assert!(backend.read_one("absent", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn max_len_trims_oldest_entries() {
        let backend = FakeBackend::new();
        for i in 0..5 {
            backend.append("s", "json", &i.to_string(), 2).await.unwrap();
        }
        let all = backend.rev_range("s", "+", "-", 100).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].json, "4");
    }
}
