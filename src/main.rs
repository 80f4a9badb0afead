//! Controller runtime binary.
//!
//! Loads the configuration, connects to the cluster and runs the manager
//! until a signal or a fatal error. Exits 0 on clean shutdown.

use std::path::PathBuf;

use clap::Parser;
use kube::Client;
use whitebox_controller::{Config, Manager};

/// Generic Kubernetes controller runtime driven by external handlers.
#[derive(Parser)]
#[command(name = "whitebox-controller")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("whitebox_controller=info".parse()?)
                .add_directive("kube=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load_file(&cli.config)?;
    tracing::info!(
        path = %cli.config.display(),
        controllers = config.controllers.len(),
        webhook = config.webhook.is_some(),
        "configuration loaded"
    );

    let client = Client::try_default().await?;
    tracing::info!("connected to Kubernetes cluster");

    let manager = Manager::new(config, client);
    let token = manager.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        token.cancel();
    });

    manager.run().await?;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
