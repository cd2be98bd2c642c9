// ===================================================================================================
// networkcore - FileZap network core daemon
// ===================================================================================================
//
// Joins the FileZap network, serves chunks and overlay requests, and
// runs until SIGINT/SIGTERM. Exit code 0 on graceful shutdown, 1 on
// startup failure.
// ===================================================================================================

use anyhow::{bail, Context};
use clap::Parser;
use filezap::cli::Cli;
use filezap::config::Config;
use filezap::engine::NetworkEngine;
use filezap::logging;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    logging::init_logging_safe();

    if let Err(e) = run().await {
        error!("startup failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load_or_default(cli.config.clone()).context("loading configuration")?;
    cli.apply_to(&mut config);

    // The OS TUN shim comes from platform-specific integrations; the
    // bare daemon has none to offer.
    if config.vpn.enabled {
        bail!("--enable-vpn requires a TUN integration");
    }

    let engine = NetworkEngine::new(config, None)
        .await
        .context("constructing network engine")?;

    if let Err(e) = engine.bootstrap().await {
        let _ = engine.close().await;
        return Err(e).context("bootstrapping");
    }

    info!(peer_id = %engine.local_peer_id(), "networkcore running");
    wait_for_signal().await;

    if let Err(e) = engine.close().await {
        error!("shutdown reported errors: {}", e);
    }
    info!("networkcore stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("SIGTERM handler unavailable: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("interrupt received");
}
