use anyhow::Context;
use clap::Parser;
use pyramid_core::{logging, PyramidConfig};
use pyramid_relay::RelayServer;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "pyramid-relay", version, about = "Rendezvous relay for Pyramid Stream rooms")]
struct Args {
    /// Path to a TOML/YAML/JSON configuration file
    #[arg(short, long, env = "PYRAMID_CONFIG")]
    config: Option<String>,

    /// Address to listen on, overrides relay_server.bind_addr
    #[arg(short, long)]
    bind: Option<String>,

    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = PyramidConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(bind) = args.bind {
        config.relay_server.bind_addr = bind;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    logging::init_logging(&config.logging)?;

    // Room settings are irrelevant to the relay itself
    if let Err(errors) = config.validate() {
        let fatal: Vec<_> = errors
            .iter()
            .filter(|e| e.starts_with("relay_server.") || e.starts_with("logging."))
            .collect();
        for e in &fatal {
            error!("Configuration error: {}", e);
        }
        if !fatal.is_empty() {
            anyhow::bail!("invalid configuration");
        }
    }

    info!("Starting pyramid-relay v{}", env!("CARGO_PKG_VERSION"));

    let listener = TcpListener::bind(&config.relay_server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.relay_server.bind_addr))?;

    let shutdown = CancellationToken::new();
    let server = RelayServer::new(config.relay_server.clone());
    let handle = tokio::spawn(server.serve(listener, shutdown.clone()));

    shutdown_signal().await;
    info!("Shutdown signal received, stopping relay...");
    shutdown.cancel();

    handle.await??;
    Ok(())
}

/// Wait for SIGTERM or Ctrl+C
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
