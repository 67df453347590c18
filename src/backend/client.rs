//! `RedisBackend` — the concrete [`Backend`] implementation over a
//! Redis-protocol connection.
//!
//! Two acquisition modes, per SPEC_FULL.md §4.1.1:
//! - *borrow*: a short multiplexed checkout from `redis::aio::ConnectionManager`,
//!   used for every request/response command.
//! - *lease*: a dedicated `redis::aio::MultiplexedConnection` opened fresh and
//!   held for the lifetime of one blocking `XREAD` or one `rtm/read` call,
//!   released on every exit path because it is simply dropped.
//!
//! In cluster mode (SPEC_FULL.md §4.1.2), both modes route through a
//! [`TopologyCache`] keyed on the command's stream name: each command is sent
//! to the node presently believed to own that key's hash slot, corrected in
//! place on a MOVED/ASK reply rather than by re-fetching the whole topology.

use super::cluster::{key_slot, TopologyCache};
use super::{Backend, NodeInfo, ReadFrom, SetSlotState, StreamCursor, StreamEntry};
use crate::error::BackendError;
use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::RwLock;

/// How long a cached slot owner is trusted before a background refresh is
/// scheduled on next use (SPEC_FULL.md §4.1.2: bounded TTL, not per-command
/// re-fetch).
const TOPOLOGY_TTL: Duration = Duration::from_secs(5);

/// Shared, multiplexed connection used for all non-blocking commands.
pub struct RedisBackend {
    client: Client,
    manager: ConnectionManager,
    /// `Some` only when connected with cluster routing enabled.
    topology: Option<TopologyCache>,
    /// Per-node connection managers, populated lazily as commands route to
    /// nodes other than the bootstrap node.
    node_managers: RwLock<HashMap<String, ConnectionManager>>,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> Result<Self, BackendError> {
        Self::connect_with_cluster(url, false).await
    }

    pub async fn connect_with_cluster(url: &str, cluster: bool) -> Result<Self, BackendError> {
        let client = Client::open(url).map_err(BackendError::from)?;
        let manager = ConnectionManager::new(client.clone()).await.map_err(BackendError::from)?;
        let topology = cluster.then(|| TopologyCache::new(TOPOLOGY_TTL));
        Ok(Self {
            client,
            manager,
            topology,
            node_managers: RwLock::new(HashMap::new()),
        })
    }

    /// Open a dedicated connection for one blocking read or one `rtm/read`
    /// call — never shared with the multiplexed manager above.
    pub async fn lease(&self) -> Result<redis::aio::MultiplexedConnection, BackendError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(BackendError::from)
    }

    /// A connection to an arbitrary cluster node address, for admin commands
    /// that must target a specific master rather than whichever node the
    /// default client happens to be pinned to.
    async fn connect_to(&self, node_addr: &str) -> Result<redis::aio::MultiplexedConnection, BackendError> {
        let client = Client::open(format!("redis://{node_addr}")).map_err(BackendError::from)?;
        client.get_multiplexed_async_connection().await.map_err(BackendError::from)
    }

    fn parse_stream_entries(rows: Vec<(String, HashMap<String, String>)>) -> Vec<StreamEntry> {
        rows.into_iter()
            .filter_map(|(id, fields)| {
                let cursor = StreamCursor::from_str(&id).ok()?;
                let json = fields.get("json")?.clone();
                Some(StreamEntry { cursor, json })
            })
            .collect()
    }

    /// The address of the node presently believed to own `key`'s slot, or
    /// `None` outside cluster mode (single-node dispatch).
    async fn owner_addr(&self, key: &str) -> Result<Option<String>, BackendError> {
        let Some(topology) = &self.topology else {
            return Ok(None);
        };
        let slot = key_slot(key);
        match topology.owner(slot) {
            Some((node, stale)) => {
                if stale {
                    let _ = self.refresh_topology().await;
                }
                Ok(Some(node.addr()))
            }
            None => {
                self.refresh_topology().await?;
                topology
                    .owner(slot)
                    .map(|(node, _)| Some(node.addr()))
                    .ok_or_else(|| BackendError::Protocol(format!("no owner known for slot {slot}")))
            }
        }
    }

    async fn refresh_topology(&self) -> Result<(), BackendError> {
        if self.topology.is_some() {
            let nodes = self.cluster_slots_via_bootstrap().await?;
            if let Some(topology) = &self.topology {
                topology.replace(nodes);
            }
        }
        Ok(())
    }

    /// `CLUSTER SLOTS` against the bootstrap manager, independent of
    /// per-command routing (used to (re)populate the topology cache itself).
    async fn cluster_slots_via_bootstrap(&self) -> Result<Vec<NodeInfo>, BackendError> {
        let mut conn = self.manager.clone();
        let raw: redis::Value = redis::cmd("CLUSTER").arg("SLOTS").query_async(&mut conn).await.map_err(BackendError::from)?;
        parse_cluster_slots(&raw)
    }

    /// The routed `ConnectionManager` for `key`, creating and caching one for
    /// the owning node on first use.
    async fn manager_for(&self, key: &str) -> Result<ConnectionManager, BackendError> {
        let Some(addr) = self.owner_addr(key).await? else {
            return Ok(self.manager.clone());
        };
        self.node_manager(&addr).await
    }

    /// A leased, dedicated connection for `key` — the bootstrap client's
    /// lease outside cluster mode, or a fresh connection to the owning node.
    async fn leased_conn_for(&self, key: &str) -> Result<MultiplexedConnection, BackendError> {
        match self.owner_addr(key).await? {
            Some(addr) => self.connect_to(&addr).await,
            None => self.lease().await,
        }
    }

    async fn node_manager(&self, addr: &str) -> Result<ConnectionManager, BackendError> {
        if let Some(m) = self.node_managers.read().await.get(addr) {
            return Ok(m.clone());
        }
        let client = Client::open(format!("redis://{addr}")).map_err(BackendError::from)?;
        let manager = ConnectionManager::new(client).await.map_err(BackendError::from)?;
        self.node_managers.write().await.insert(addr.to_string(), manager.clone());
        Ok(manager)
    }

    /// Correct the topology cache in place after a MOVED/ASK reply, so the
    /// next command for this slot routes directly instead of redirecting
    /// again (SPEC_FULL.md §4.1.2).
    fn apply_redirect(&self, slot: u16, addr: &str) {
        let Some(topology) = &self.topology else {
            return;
        };
        let Some((ip, port)) = addr.rsplit_once(':').and_then(|(ip, port)| Some((ip.to_string(), port.parse().ok()?))) else {
            return;
        };
        topology.redirect(
            slot,
            NodeInfo {
                id: addr.to_string(),
                ip,
                port,
                is_master: true,
                slots: Vec::new(),
            },
        );
    }
}

/// Parses a MOVED/ASK error reply (`"MOVED 3999 127.0.0.1:6381"`) out of a
/// Redis error's message, independent of the error's classified kind — this
/// client doesn't enable the `cluster-async` feature, so redirects surface as
/// plain server error text rather than a dedicated error variant.
fn parse_redirect(message: &str) -> Option<(u16, String)> {
    let mut tokens = message.split_whitespace();
    while let Some(tok) = tokens.next() {
        if tok == "MOVED" || tok == "ASK" {
            let slot: u16 = tokens.next()?.parse().ok()?;
            let addr = tokens.next()?.to_string();
            return Some((slot, addr));
        }
    }
    None
}

#[async_trait]
impl Backend for RedisBackend {
    async fn append(&self, stream: &str, field: &str, data: &str, max_len: usize) -> Result<StreamCursor, BackendError> {
        let mut conn = self.manager_for(stream).await?;
        let result = redis::cmd("XADD")
            .arg(stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(max_len)
            .arg("*")
            .arg(field)
            .arg(data)
            .query_async::<String>(&mut conn)
            .await;
        let id = match result {
            Ok(id) => id,
            Err(e) => match parse_redirect(&e.to_string()) {
                Some((slot, addr)) => {
                    self.apply_redirect(slot, &addr);
                    let mut conn = self.node_manager(&addr).await?;
                    redis::cmd("XADD")
                        .arg(stream)
                        .arg("MAXLEN")
                        .arg("~")
                        .arg(max_len)
                        .arg("*")
                        .arg(field)
                        .arg(data)
                        .query_async::<String>(&mut conn)
                        .await
                        .map_err(BackendError::from)?
                }
                None => return Err(BackendError::from(e)),
            },
        };
        StreamCursor::from_str(&id).map_err(|_| BackendError::Protocol(format!("unparseable stream id {id:?}")))
    }

    async fn rev_range(&self, stream: &str, start: &str, end: &str, count: usize) -> Result<Vec<StreamEntry>, BackendError> {
        let mut conn = self.manager_for(stream).await?;
        type Rows = Vec<(String, HashMap<String, String>)>;
        let result = redis::cmd("XREVRANGE")
            .arg(stream)
            .arg(start)
            .arg(end)
            .arg("COUNT")
            .arg(count)
            .query_async::<Rows>(&mut conn)
            .await;
        let rows = match result {
            Ok(rows) => rows,
            Err(e) => match parse_redirect(&e.to_string()) {
                Some((slot, addr)) => {
                    self.apply_redirect(slot, &addr);
                    let mut conn = self.node_manager(&addr).await?;
                    redis::cmd("XREVRANGE")
                        .arg(stream)
                        .arg(start)
                        .arg(end)
                        .arg("COUNT")
                        .arg(count)
                        .query_async::<Rows>(&mut conn)
                        .await
                        .map_err(BackendError::from)?
                }
                None => return Err(BackendError::from(e)),
            },
        };
        Ok(Self::parse_stream_entries(rows))
    }

    async fn blocking_read(&self, reads: &[ReadFrom]) -> Result<Vec<(String, StreamEntry)>, BackendError> {
        // Dedicated connection for the lifetime of this one blocking call —
        // never the shared manager, which would stall every other command
        // multiplexed onto it for as long as the read blocks. Every caller in
        // this engine passes exactly one `ReadFrom` per call (subscription
        // workers tail one stream each), so routing by `reads[0]` covers the
        // real dispatch path; a multi-stream call in cluster mode routes by
        // the first stream only.
        let mut conn = match reads.first() {
            Some(r) => self.leased_conn_for(&r.stream).await?,
            None => self.lease().await?,
        };
        let mut cmd = redis::cmd("XREAD");
        cmd.arg("BLOCK").arg(0).arg("STREAMS");
        for r in reads {
            cmd.arg(&r.stream);
        }
        for r in reads {
            cmd.arg(r.after.to_string());
        }

        type Reply = Vec<(String, Vec<(String, HashMap<String, String>)>)>;
        let reply: Option<Reply> = cmd.query_async(&mut conn).await.map_err(BackendError::from)?;

        let mut out = Vec::new();
        for (stream, rows) in reply.unwrap_or_default() {
            for entry in Self::parse_stream_entries(rows) {
                out.push((stream.clone(), entry));
            }
        }
        Ok(out)
    }

    async fn read_one(&self, stream: &str, position: Option<StreamCursor>) -> Result<Option<StreamEntry>, BackendError> {
        let mut conn = self.leased_conn_for(stream).await?;
        let (start, end) = match &position {
            Some(p) => (p.to_string(), p.to_string()),
            None => ("+".to_string(), "-".to_string()),
        };
        let rows: Vec<(String, HashMap<String, String>)> = redis::cmd("XREVRANGE")
            .arg(stream)
            .arg(&start)
            .arg(&end)
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(BackendError::from)?;
        Ok(Self::parse_stream_entries(rows).into_iter().next())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        let mut conn = self.manager_for(key).await?;
        let result = conn.del::<_, i64>(key).await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => match parse_redirect(&e.to_string()) {
                Some((slot, addr)) => {
                    self.apply_redirect(slot, &addr);
                    let mut conn = self.node_manager(&addr).await?;
                    let _: i64 = conn.del(key).await.map_err(BackendError::from)?;
                    Ok(())
                }
                None => Err(BackendError::from(e)),
            },
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        let mut conn = self.manager_for(key).await?;
        let result = conn.exists::<_, i64>(key).await;
        let n = match result {
            Ok(n) => n,
            Err(e) => match parse_redirect(&e.to_string()) {
                Some((slot, addr)) => {
                    self.apply_redirect(slot, &addr);
                    let mut conn = self.node_manager(&addr).await?;
                    conn.exists(key).await.map_err(BackendError::from)?
                }
                None => return Err(BackendError::from(e)),
            },
        };
        Ok(n > 0)
    }

    async fn ping(&self) -> Result<(), BackendError> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(BackendError::from)?;
        Ok(())
    }

    async fn cluster_nodes(&self) -> Result<Vec<NodeInfo>, BackendError> {
        self.cluster_slots().await
    }

    async fn cluster_slots(&self) -> Result<Vec<NodeInfo>, BackendError> {
        let mut conn = self.manager.clone();
        let raw: redis::Value = redis::cmd("CLUSTER")
            .arg("SLOTS")
            .query_async(&mut conn)
            .await
            .map_err(BackendError::from)?;
        parse_cluster_slots(&raw)
    }

    async fn cluster_set_slot(&self, node_addr: &str, slot: u16, state: SetSlotState, node_id: &str) -> Result<(), BackendError> {
        let mut conn = self.connect_to(node_addr).await?;
        let mut cmd = redis::cmd("CLUSTER");
        cmd.arg("SETSLOT").arg(slot).arg(state.as_str());
        if !matches!(state, SetSlotState::Node) || !node_id.is_empty() {
            cmd.arg(node_id);
        }
        let _: () = cmd.query_async(&mut conn).await.map_err(BackendError::from)?;
        Ok(())
    }

    async fn cluster_get_keys_in_slot(&self, node_addr: &str, slot: u16, count: usize) -> Result<Vec<String>, BackendError> {
        let mut conn = self.connect_to(node_addr).await?;
        let keys: Vec<String> = redis::cmd("CLUSTER")
            .arg("GETKEYSINSLOT")
            .arg(slot)
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(BackendError::from)?;
        Ok(keys)
    }

    async fn migrate(&self, node_addr: &str, dest_host: &str, dest_port: u16, timeout_ms: u64, keys: &[String]) -> Result<(), BackendError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.connect_to(node_addr).await?;
        let mut cmd = redis::cmd("MIGRATE");
        cmd.arg(dest_host).arg(dest_port).arg("").arg(0).arg(timeout_ms);
        if keys.len() > 1 {
            cmd.arg("KEYS");
        }
        for k in keys {
            cmd.arg(k);
        }
        let _: () = cmd.query_async(&mut conn).await.map_err(BackendError::from)?;
        Ok(())
    }
}

/// `CLUSTER SLOTS` replies as nested arrays: `[[start, end, [ip, port, id], ...replicas], ...]`.
fn parse_cluster_slots(raw: &redis::Value) -> Result<Vec<NodeInfo>, BackendError> {
    let redis::Value::Array(slot_ranges) = raw else {
        return Err(BackendError::Protocol("CLUSTER SLOTS did not return an array".into()));
    };

    let mut by_id: HashMap<String, NodeInfo> = HashMap::new();
    for range in slot_ranges {
        let redis::Value::Array(fields) = range else {
            continue;
        };
        let [start, end, master, ..] = fields.as_slice() else {
            continue;
        };
        let (start, end) = match (as_i64(start), as_i64(end)) {
            (Some(s), Some(e)) => (s as u16, e as u16),
            _ => continue,
        };
        let redis::Value::Array(master_fields) = master else {
            continue;
        };
        let (Some(ip), Some(port), Some(id)) = (
            master_fields.first().and_then(as_string),
            master_fields.get(1).and_then(as_i64),
            master_fields.get(2).and_then(as_string),
        ) else {
            continue;
        };

        by_id
            .entry(id.clone())
            .or_insert_with(|| NodeInfo {
                id,
                ip,
                port: port as u16,
                is_master: true,
                slots: Vec::new(),
            })
            .slots
            .push((start, end));
    }
    Ok(by_id.into_values().collect())
}

fn as_i64(v: &redis::Value) -> Option<i64> {
    match v {
        redis::Value::Int(i) => Some(*i),
        _ => None,
    }
}

fn as_string(v: &redis::Value) -> Option<String> {
    match v {
        redis::Value::BulkString(b) => Some(String::from_utf8_lossy(b).into_owned()),
        redis::Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}
