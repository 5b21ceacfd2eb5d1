mod config;
mod hlss;
mod metrics;
mod routes;
mod state;
mod tokens;

use std::net::SocketAddr;

use config::AppConfig;
use routes::build_router;
use state::AppState;
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cfg = AppConfig::from_env();
    if cfg.token_secret.is_none() {
        tracing::warn!("SLATE__TOKEN_SECRET not set; using an ephemeral signing secret");
    }

    let state = AppState::new(&cfg);
    let app = build_router(state);

    let addr: SocketAddr = cfg.bind_addr.parse()?;
    info!("slate broker listening on {addr}");
    info!("callback base url: {}", cfg.public_base_url);
    axum::serve(
        tokio::net::TcpListener::bind(addr).await?,
        app.into_make_service(),
    )
    .await?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
