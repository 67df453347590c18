//! Layered configuration: built-in defaults -> `config.toml` -> CLI flags / environment.
//!
//! Mirrors the precedence the rest of the ambient stack uses for its own
//! config surface: a plain struct of resolved values built from a `clap`
//! parser where every flag also accepts an environment-variable fallback,
//! with an optional TOML file filling the gap between defaults and CLI/env.

use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::error;

const DEFAULT_PORT: u16 = 8900;
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_MAX_SUBSCRIPTIONS: usize = 100;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_STREAM_MAX_LEN: usize = 1000;
const DEFAULT_WORKER_RECONNECT_SECS: u64 = 1;

/// `{config path}` — all fields are optional overrides, colocated next to the
/// apps-config file. Priority: CLI / env var > TOML > built-in default.
#[derive(Debug, Deserialize, Default)]
struct TomlConfig {
    host: Option<String>,
    port: Option<u16>,
    backend_url: Option<String>,
    backend_password: Option<String>,
    cluster: Option<bool>,
    max_subscriptions: Option<usize>,
    idle_timeout_secs: Option<u64>,
    stream_max_len: Option<usize>,
    worker_reconnect_secs: Option<u64>,
    log: Option<String>,
}

/// Loads `config.toml` next to `apps_config_path`, if present. A missing file
/// is not an error — it just means no TOML layer; a present-but-unparseable
/// file falls back to defaults/CLI with a logged warning rather than aborting
/// startup over an optional layer.
fn load_toml(apps_config_path: &Path) -> TomlConfig {
    let path = apps_config_path.with_file_name("config.toml");
    let Ok(contents) = std::fs::read_to_string(&path) else {
        return TomlConfig::default();
    };
    match toml::from_str(&contents) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            TomlConfig::default()
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "rtmd", about = "RTM real-time pub/sub and KV broker", version)]
pub struct Args {
    /// WebSocket + health listen host
    #[arg(long, env = "RTM_HOST")]
    pub host: Option<String>,

    /// WebSocket + health listen port
    #[arg(long, env = "RTM_PORT")]
    pub port: Option<u16>,

    /// Path to the apps-config JSON document (appkey -> role -> {secret, permissions})
    #[arg(long, env = "RTM_APPS_CONFIG")]
    pub apps_config: PathBuf,

    /// Backend connection URL, e.g. redis://127.0.0.1:6379
    #[arg(long, env = "RTM_BACKEND_URL")]
    pub backend_url: Option<String>,

    /// Backend AUTH password, if required
    #[arg(long, env = "RTM_BACKEND_PASSWORD")]
    pub backend_password: Option<String>,

    /// Treat the backend as a sharded cluster and route by hash slot
    #[arg(long, env = "RTM_CLUSTER")]
    pub cluster: Option<bool>,

    /// Max subscriptions a single connection may hold open at once
    #[arg(long, env = "RTM_MAX_SUBSCRIPTIONS")]
    pub max_subscriptions: Option<usize>,

    /// Close a connection after this many seconds with no inbound frame
    #[arg(long, env = "RTM_IDLE_TIMEOUT_SECS")]
    pub idle_timeout_secs: Option<u64>,

    /// Approximate max length enforced on published streams (XADD MAXLEN ~)
    #[arg(long, env = "RTM_STREAM_MAX_LEN")]
    pub stream_max_len: Option<usize>,

    /// Initial delay, in seconds, before a subscription worker retries after
    /// a transient backend error (doubles on each subsequent retry)
    #[arg(long, env = "RTM_WORKER_RECONNECT_SECS")]
    pub worker_reconnect_secs: Option<u64>,

    /// Log level filter, e.g. "info", "debug", "rtmd=trace,info"
    #[arg(long, env = "RTM_LOG")]
    pub log: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RtmConfig {
    pub host: String,
    pub port: u16,
    pub apps_config_path: PathBuf,
    pub backend_url: String,
    pub backend_password: Option<String>,
    pub cluster: bool,
    pub max_subscriptions: usize,
    pub idle_timeout: Duration,
    pub handshake_timeout: Duration,
    pub stream_max_len: usize,
    pub worker_reconnect_initial_delay: Duration,
    pub log: String,
}

/// `backend_url` has no sane built-in default, so it is the one knob that can
/// still be missing after all three layers are merged.
#[derive(Debug, thiserror::Error)]
#[error("backend_url is required: pass --backend-url, set RTM_BACKEND_URL, or add it to config.toml")]
pub struct MissingBackendUrl;

impl TryFrom<Args> for RtmConfig {
    type Error = MissingBackendUrl;

    /// Merge CLI/env (`args`, highest precedence) over `config.toml` next to
    /// the apps-config file (middle) over built-in defaults (lowest).
    fn try_from(args: Args) -> Result<Self, Self::Error> {
        let toml = load_toml(&args.apps_config);
        Ok(Self {
            host: args.host.or(toml.host).unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: args.port.or(toml.port).unwrap_or(DEFAULT_PORT),
            apps_config_path: args.apps_config,
            backend_url: args.backend_url.or(toml.backend_url).ok_or(MissingBackendUrl)?,
            backend_password: args.backend_password.or(toml.backend_password),
            cluster: args.cluster.or(toml.cluster).unwrap_or(false),
            max_subscriptions: args.max_subscriptions.or(toml.max_subscriptions).unwrap_or(DEFAULT_MAX_SUBSCRIPTIONS),
            idle_timeout: Duration::from_secs(
                args.idle_timeout_secs.or(toml.idle_timeout_secs).unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS),
            ),
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            stream_max_len: args.stream_max_len.or(toml.stream_max_len).unwrap_or(DEFAULT_STREAM_MAX_LEN),
            worker_reconnect_initial_delay: Duration::from_secs(
                args.worker_reconnect_secs.or(toml.worker_reconnect_secs).unwrap_or(DEFAULT_WORKER_RECONNECT_SECS),
            ),
            log: args.log.or(toml.log).unwrap_or_else(|| "info".to_string()),
        })
    }
}
