//! Job API server command: `bugsniper serve`.

use std::sync::Arc;

use anyhow::Result;

use bugsniper::bugsniper_config::BugsniperConfig;
use bugsniper::jobs::api::AppState;
use bugsniper::jobs::github::GhCliPublisher;
use bugsniper::jobs::server::{ServerConfig, start_server};

pub async fn cmd_serve(
    config: &BugsniperConfig,
    port: Option<u16>,
    host: Option<String>,
    dev: bool,
) -> Result<()> {
    let server = &config.toml.server;
    let db = super::open_db(config)?;
    let dispatcher = super::build_dispatcher(config, db.clone())?;

    let state = Arc::new(AppState {
        db,
        dispatcher,
        publisher: Arc::new(GhCliPublisher),
    });

    tracing::info!(db = %config.db_path().display(), "job database ready");
    start_server(
        ServerConfig {
            host: host.unwrap_or_else(|| server.host.clone()),
            port: port.unwrap_or(server.port),
            dev_mode: dev || server.dev_mode,
        },
        state,
    )
    .await
}
