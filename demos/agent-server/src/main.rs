//! Agent hub server.
//!
//! Run with: cargo run -p agent-server -- --config agent-hub.toml
//!
//! Streams connect on `/ws`; unary clients use `/sessions`.

mod config;

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use agent_hub_core::echo::{
    EchoAgentFactory, EchoInvoker, StaticConfigurationProvider, TrackingCleanup,
};
use agent_hub_session::{Collaborators, SessionManager};
use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

/// Multiplexed agent session server
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "agent-hub.toml")]
    config: PathBuf,

    /// Host to bind (overrides config file and SERVICE_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides config file and SERVICE_PORT)
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    config.apply_env()?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let mut configs = StaticConfigurationProvider::new(std::mem::take(&mut config.users));
    if config.allow_unknown_users {
        configs = configs.with_fallback();
    }

    let manager = Arc::new(SessionManager::start(
        Collaborators {
            configs: Arc::new(configs),
            factory: Arc::new(EchoAgentFactory),
            invoker: Arc::new(EchoInvoker::new()),
            cleanup: Some(Arc::new(TrackingCleanup::new())),
        },
        config.sessions.to_manager_config(),
    )?);

    let app = agent_hub_transport::create_router(Arc::clone(&manager))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let ip: IpAddr = config
        .server
        .host
        .parse()
        .with_context(|| format!("invalid host {}", config.server.host))?;
    let addr = SocketAddr::new(ip, config.server.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    info!("Server listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.shutdown().await;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
