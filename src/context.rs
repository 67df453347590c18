//! Shared, read-only handles every connection's handler invocations borrow:
//! apps config, backend, resolved runtime config, and the admin registry.

use crate::apps_config::AppsConfig;
use crate::backend::Backend;
use crate::config::RtmConfig;
use crate::connection::ConnectionRegistry;
use std::sync::Arc;
use std::time::Instant;

/// Cheap to clone: every field is an `Arc` (or `Copy`, for `started_at`), so
/// a subscription worker can hold an owned copy for its whole lifetime
/// without borrowing from the connection's handler call.
#[derive(Clone)]
pub struct EngineContext {
    pub apps_config: Arc<AppsConfig>,
    pub backend: Arc<dyn Backend>,
    pub config: Arc<RtmConfig>,
    pub registry: Arc<ConnectionRegistry>,
    pub started_at: Instant,
}

impl EngineContext {
    pub fn new(apps_config: Arc<AppsConfig>, backend: Arc<dyn Backend>, config: Arc<RtmConfig>) -> Self {
        Self {
            apps_config,
            backend,
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            started_at: Instant::now(),
        }
    }
}
