//! CREDFIX DASHBOARD - HTTP server behind the web dashboard
//!
//! Wires settings, the real probe context and one progress broadcaster into
//! the axum router. Scans always run against the actual machine.

mod config;
mod http;
mod state;

use anyhow::{Context, Result};
use credfix_engine::doctor::events::BroadcastSink;
use credfix_engine::{ProbeContext, Settings};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::load_config;
use crate::http::AppState;
use crate::state::{new_state, ScanStore};

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("credfix_dashboard=info,credfix_engine=info")),
        )
        .init();

    let cfg = load_config().await;
    let settings = Settings::load().await.context("Failed to load credfix settings")?;
    let ctx = ProbeContext::from_environment(settings).context("Failed to build probe context")?;

    let app_state = AppState {
        ctx,
        scans: new_state(ScanStore::new(cfg.history)),
        events: BroadcastSink::new(cfg.event_buffer.max(1)),
    };
    let app = http::build_router(app_state);

    let listener = TcpListener::bind(&cfg.bind)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.bind))?;
    info!("Dashboard listening on http://{}", cfg.bind);
    axum::serve(listener, app).await.context("HTTP server failed")?;
    Ok(())
}
