//! `rtmd`: parse CLI/env config, load the apps-config snapshot, connect to
//! the backend, and run the WebSocket + health server.

use anyhow::{Context, Result};
use clap::Parser;
use rtmd::apps_config::AppsConfig;
use rtmd::backend::RedisBackend;
use rtmd::config::{Args, RtmConfig};
use rtmd::context::EngineContext;
use rtmd::server;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = RtmConfig::try_from(args).context("resolving configuration")?;

    tracing_subscriber::fmt().with_env_filter(config.log.clone()).compact().init();

    let apps_config = Arc::new(
        AppsConfig::load(&config.apps_config_path)
            .with_context(|| format!("loading apps config from {}", config.apps_config_path.display()))?,
    );

    let connect_url = with_auth(&config.backend_url, config.backend_password.as_deref());
    let backend = Arc::new(
        RedisBackend::connect_with_cluster(&connect_url, config.cluster)
            .await
            .with_context(|| format!("connecting to backend at {}", config.backend_url))?,
    );

    let ctx = EngineContext::new(apps_config, backend, Arc::new(config));
    server::run(ctx).await
}

/// Inject `backend_password`, if set, as Redis URL userinfo, so callers never
/// need to hand-assemble the URL themselves.
fn with_auth(url: &str, password: Option<&str>) -> String {
    match password {
        Some(p) if !p.is_empty() => match url.strip_prefix("redis://") {
            Some(rest) => format!("redis://:{p}@{rest}"),
            None => url.to_string(),
        },
        _ => url.to_string(),
    }
}
