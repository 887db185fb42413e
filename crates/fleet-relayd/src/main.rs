//! fleet-relayd - realtime multi-tenant telemetry relay
//!
//! Holds one streaming connection to the tracking backend and fans its
//! messages out to authenticated viewers, filtered per tenant.
//!
//! Usage:
//!   fleet-relayd [--config fleet-relay.toml] [--listen 0.0.0.0:8082] [--log-json]

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use fleet_relay::{status_router, OwnershipResolver, RelayService};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "fleet-relayd")]
#[command(about = "Realtime multi-tenant telemetry relay")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "FLEET_RELAY_CONFIG", default_value = "fleet-relay.toml")]
    config: PathBuf,

    /// Override the downstream listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "fleet_relayd=info,fleet_relay=info,fleet_tracker=info".into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    tracing::info!("Starting fleet-relayd");
    tracing::info!("Loading config from: {}", cli.config.display());

    let mut config = Config::load(&cli.config)?;
    config.apply_env_overrides();
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    config.validate()?;

    let relay = Arc::new(RelayService::new(
        config.relay_config()?,
        Arc::new(config.token_verifier()),
        config.session_provider()?,
        OwnershipResolver::from_registry(config.device_registry()?),
    ));

    let addr = relay.start().await?;
    tracing::info!("Relaying on ws://{}{}", addr, config.server.path);

    let (status_shutdown, status_task) = match config.server.status_listen {
        Some(status_addr) => {
            let listener = tokio::net::TcpListener::bind(status_addr)
                .await
                .with_context(|| format!("Failed to bind status listener on {}", status_addr))?;
            tracing::info!("Status endpoint on http://{}", status_addr);

            let (tx, rx) = tokio::sync::oneshot::channel::<()>();
            let app = status_router(relay.clone());
            let task = tokio::spawn(async move {
                let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                    let _ = rx.await;
                });
                if let Err(e) = serve.await {
                    tracing::error!(error = %e, "Status endpoint failed");
                }
            });
            (Some(tx), Some(task))
        }
        None => (None, None),
    };

    shutdown_signal().await;
    tracing::info!("Shutdown requested");

    relay.stop().await;
    if let Some(tx) = status_shutdown {
        let _ = tx.send(());
    }
    if let Some(task) = status_task {
        let _ = task.await;
    }

    tracing::info!("fleet-relayd stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
