mod categories;
mod config;
mod error;
mod failover;
mod handlers;
mod scheduler;
mod state;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::MasterConfig;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "master=debug,common=debug,tower_http=info".into()),
        )
        .init();

    let config = MasterConfig::from_env()?;
    let bind_addr = config.bind_addr.clone();
    info!(
        max_retries = config.submit_defaults.max_retries,
        max_forsaken = config.submit_defaults.max_forsaken,
        heartbeat_timeout = ?config.heartbeat_timeout,
        categories = config.category_resources.len(),
        "configuración cargada"
    );

    let state = AppState::new(config);

    // router HTTP
    let app = handlers::build_router(state.clone());

    // detección de workers caídos en segundo plano
    let failover_state = state.clone();
    tokio::spawn(async move {
        failover::run_failover_loop(failover_state).await;
    });

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {}", bind_addr))?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
