//! # Image Relay Server
//!
//! Bridges browser WebSocket clients to a single upstream processing server.
//!
//! ## Functionality:
//! - **Client Endpoint**: Accepts WebSocket sessions on the configured path
//!   (`/numberws` by default) with `/health` and `/status` alongside.
//! - **Signaling Fan-out**: JSON signaling from one client is relayed to all
//!   other clients.
//! - **Upstream Link**: Image payloads go to the upstream server over one shared
//!   connection that reconnects at a fixed delay; upstream results are broadcast
//!   to every client.
//! - **Configuration**: Defaults, then `server_relay.conf` (JSON), then
//!   environment variables and command-line flags.
//! - **TLS**: Served over rustls when both a certificate and key are given.
//! - **Graceful Shutdown**: `tokio-graceful` drains the listener on Ctrl+C or
//!   SIGTERM, then the relay closes every session and the upstream link.

mod relay_logic;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_graceful::{Shutdown, ShutdownGuard};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use lib_relay::core::Relay;
use lib_relay::loggers::setup::setup_logging;
use lib_relay::transports::{relay_router, WsUpstreamConnector};

use relay_logic::config::{self, Settings};

const SHUTDOWN_LIMIT: Duration = Duration::from_secs(10);

enum Listener {
    Plain(TcpListener),
    Tls(RustlsConfig),
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    // Both rustls and the upstream client may try to pick a provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let settings = config::load_config();

    let _log_guard = match setup_logging("server_relay", &settings.log_dir, &settings.log_level) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        port = settings.port,
        ws_path = %settings.ws_path,
        upstream = %settings.upstream_url,
        tls = settings.tls.is_some(),
        "starting server_relay"
    );

    let connector = Arc::new(WsUpstreamConnector::new(settings.upstream_url.clone()));
    let relay = Arc::new(Relay::start(connector, settings.relay_options()));

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    let app = relay_router(Arc::clone(&relay), &settings.ws_path).layer(cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = bind(addr, &settings).await?;

    let (failed_tx, failed_rx) = oneshot::channel::<()>();
    let shutdown = Shutdown::new(async move {
        tokio::select! {
            _ = tokio_graceful::default_signal() => info!("shutdown signal received"),
            _ = failed_rx => warn!("listener stopped, shutting down"),
        }
    });

    shutdown.spawn_task_fn(move |guard| async move {
        if let Err(e) = serve(app, addr, listener, guard).await {
            error!("server error: {:#}", e);
        }
        drop(failed_tx);
    });

    match shutdown.shutdown_with_limit(SHUTDOWN_LIMIT).await {
        Ok(elapsed) => {
            info!(
                "shutdown: gracefully {}s after shutdown signal received",
                elapsed.as_secs_f64()
            );
        }
        Err(e) => {
            warn!("shutdown: forcefully due to timeout: {}", e);
        }
    }

    relay.shutdown().await;
    info!("Shutdown complete.");

    Ok(())
}

async fn bind(addr: SocketAddr, settings: &Settings) -> Result<Listener> {
    match &settings.tls {
        Some((cert, key)) => {
            info!("Loading TLS certs from: {}", cert.display());
            let tls_config = load_tls(cert.clone(), key.clone()).await?;
            Ok(Listener::Tls(tls_config))
        }
        None => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {}", addr))?;
            Ok(Listener::Plain(listener))
        }
    }
}

async fn load_tls(cert: PathBuf, key: PathBuf) -> Result<RustlsConfig> {
    RustlsConfig::from_pem_file(cert, key)
        .await
        .map_err(|e| anyhow::anyhow!("TLS Configuration Error: {}", e))
}

async fn serve(app: Router, addr: SocketAddr, listener: Listener, guard: ShutdownGuard) -> Result<()> {
    let service = app.into_make_service_with_connect_info::<SocketAddr>();
    match listener {
        Listener::Plain(listener) => {
            info!("Relay live at ws://{}", addr);
            axum::serve(listener, service)
                .with_graceful_shutdown(async move { guard.cancelled().await })
                .await?;
        }
        Listener::Tls(tls_config) => {
            info!("Relay live at wss://{}", addr);
            let handle = axum_server::Handle::new();
            let signal_handle = handle.clone();
            tokio::spawn(async move {
                guard.cancelled().await;
                signal_handle.graceful_shutdown(Some(SHUTDOWN_LIMIT));
            });
            axum_server::bind_rustls(addr, tls_config)
                .handle(handle)
                .serve(service)
                .await?;
        }
    }
    Ok(())
}
