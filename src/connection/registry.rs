//! Process-wide table of live connections, consulted only by `admin/*`.

use super::ConnectionState;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Arc<ConnectionState>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, state: Arc<ConnectionState>) {
        self.connections.lock().await.insert(state.connection_id.clone(), state);
    }

    pub async fn unregister(&self, connection_id: &str) {
        self.connections.lock().await.remove(connection_id);
    }

    pub async fn list(&self) -> Vec<Arc<ConnectionState>> {
        self.connections.lock().await.values().cloned().collect()
    }

    pub async fn get(&self, connection_id: &str) -> Option<Arc<ConnectionState>> {
        self.connections.lock().await.get(connection_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }
}
