use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use ragvault::{api, config, logging, services::Services};
use tokio::net::TcpListener;

/// Per-tenant encrypted document ingestion and retrieval server.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Port to listen on; overrides `SERVER_PORT`.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = config::load_config().context("failed to load configuration")?;
    logging::init_tracing();

    let mut services = Services::from_config(&config).context("failed to build services")?;
    let worker = services.start_worker();
    let worker_handle = services.worker().cloned();
    let app = api::create_router(Arc::new(services));

    let (listener, port) = bind_listener(cli.port.or(config.server_port))
        .await
        .context("failed to bind listener")?;
    tracing::info!("Listening on http://0.0.0.0:{}", port);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    if let Some(handle) = worker_handle {
        handle.shutdown().await.ok();
    }
    worker.await.context("ingestion worker panicked")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

async fn bind_listener(port: Option<u16>) -> Result<(TcpListener, u16), std::io::Error> {
    use std::net::Ipv4Addr;

    if let Some(port) = port {
        return TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map(|listener| (listener, port));
    }

    const PORT_RANGE: std::ops::RangeInclusive<u16> = 4100..=4199;
    for port in PORT_RANGE {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => {
                tracing::debug!(port, "Bound server port");
                return Ok((listener, port));
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::debug!(port, "Port already in use; trying next");
            }
            Err(err) => return Err(err),
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        "No available port found in range 4100-4199",
    ))
}
