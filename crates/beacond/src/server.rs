//! Process lifecycle: migrate, bring up the hub, serve HTTP, start CDC.
//!
//! CDC is layered on top of a functioning request/response service: a
//! failing change stream degrades to best-effort (logged, retried per
//! policy) and never blocks HTTP availability.

use std::sync::Arc;

use anyhow::Context;
use beacon_cdc::{ChangeRouter, ChangeStreamClient, TrackedTables};
use beacon_realtime::Hub;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::api::{self, ApiState};
use crate::cli::Cli;
use crate::handlers::UsersChangeHandler;
use crate::migrate;
use crate::store::{PgUserStore, UserStore};

/// Tables whose changes are fanned out to clients.
pub const TRACKED_TABLES: &[&str] = &["users"];

/// Capacity of the stream-to-router channel.
const CHANGE_BUFFER: usize = 1024;

/// Startup phases, logged as the process advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Migrating,
    BroadcasterReady,
    StreamStarting,
    Running,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Migrating => "migrating",
            Phase::BroadcasterReady => "broadcaster-ready",
            Phase::StreamStarting => "stream-starting",
            Phase::Running => "running",
        };
        f.write_str(s)
    }
}

/// Run the server until a shutdown signal arrives.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    info!(phase = %Phase::Migrating, "running database migrations");
    let pg_store = PgUserStore::connect(
        &cli.pg_host,
        cli.pg_port,
        &cli.pg_user,
        &cli.pg_password,
        &cli.pg_database,
    )
    .await
    .context("failed to connect to postgres")?;
    migrate::run(pg_store.client(), &cli.publication, &cli.slot)
        .await
        .context("migration failed")?;
    let store: Arc<dyn UserStore> = Arc::new(pg_store);

    let hub = Hub::new(cli.ws_buffer);
    let ws_listener = TcpListener::bind(cli.ws_bind)
        .await
        .with_context(|| format!("failed to bind websocket listener on {}", cli.ws_bind))?;
    {
        let hub = hub.clone();
        tokio::spawn(async move {
            if let Err(e) = beacon_realtime::serve(hub, ws_listener).await {
                error!("websocket listener failed: {e}");
            }
        });
    }
    info!(phase = %Phase::BroadcasterReady, addr = %cli.ws_bind, "websocket hub ready");

    let app = api::router(
        ApiState {
            store: store.clone(),
        },
        &cli.frontend_url,
    );
    let http_listener = TcpListener::bind(cli.bind)
        .await
        .with_context(|| format!("failed to bind http listener on {}", cli.bind))?;

    let stream_client = if cli.cdc_enabled {
        info!(phase = %Phase::StreamStarting, slot = %cli.slot, "starting change stream");
        let (tx, rx) = mpsc::channel(CHANGE_BUFFER);
        let stream_client = ChangeStreamClient::new(cli.stream_config(), tx);
        stream_client.start();

        let router = ChangeRouter::new(TrackedTables::new(TRACKED_TABLES.iter().copied()))
            .with_handler(
                "users",
                Arc::new(UsersChangeHandler::new(store.clone(), hub.clone())),
            );
        tokio::spawn(router.run(rx));
        Some(stream_client)
    } else {
        info!("change stream disabled by configuration");
        None
    };

    info!(phase = %Phase::Running, addr = %cli.bind, "http server listening");
    axum::serve(http_listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    if let Some(stream_client) = stream_client {
        info!("stopping change stream");
        stream_client.stop();
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install ctrl-c handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
