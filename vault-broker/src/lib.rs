pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod models;
pub mod state;
pub mod telemetry;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};
use vault_broker_core::{LifecycleManager, SharedBackend};

use auth::BasicCredentials;
use config::BrokerConfig;
use models::CatalogResponse;

pub use state::AppState;
pub use telemetry::CorrelationId;

#[derive(Clone, Debug)]
pub struct BrokerRuntimeConfig {
    pub http_addr: SocketAddr,
    pub broker: BrokerConfig,
}

pub async fn run(config: BrokerRuntimeConfig) -> anyhow::Result<()> {
    let state = build_state(&config.broker).await?;

    let http_listener = TcpListener::bind(config.http_addr).await.with_context(|| {
        format!(
            "failed to bind http listener on {addr}",
            addr = config.http_addr
        )
    })?;

    let http_addr = http_listener.local_addr()?;
    info!(%http_addr, "starting server");

    let http_router = http::router(state.clone());
    let served = axum::serve(http_listener, http_router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(anyhow::Error::from);

    state.manager.stop();
    served
}

/// Construct the configured backend, start the lifecycle manager (which
/// replays persisted tenants and bindings) and assemble the HTTP state.
pub async fn build_state(config: &BrokerConfig) -> anyhow::Result<AppState> {
    let backend = config::load_backend(config)?;
    build_state_with_backend(config, backend).await
}

pub async fn build_state_with_backend(
    config: &BrokerConfig,
    backend: SharedBackend,
) -> anyhow::Result<AppState> {
    let manager = Arc::new(LifecycleManager::new(backend, config.broker_settings()));
    let report = manager
        .start()
        .await
        .context("failed to start broker")?;
    info!(
        tenants = report.tenants,
        bindings = report.bindings,
        skipped = report.skipped,
        "broker started"
    );

    Ok(AppState::new(
        manager,
        CatalogResponse::from_config(config),
        BasicCredentials::new(
            config.security_user_name.clone(),
            config.security_user_password.clone(),
        ),
    ))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(?err, "failed to install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => warn!(?err, "failed to install sigterm handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received interrupt"),
        _ = terminate => info!("received terminate"),
    }
}
