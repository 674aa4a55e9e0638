use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "jobservice", about = "Container registry job service")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "JOB_SERVICE_CONFIG", default_value = "./config.yml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Install the ring provider before any TLS configuration is built.
    rustls::crypto::ring::default_provider().install_default().ok();

    let config = jobservice_config::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    jobservice_observability::init(&config.loggers).context("failed to initialize logging")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    jobservice_api::bootstrap::run(config, shutdown)
        .await
        .context("job service terminated with an error")
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
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
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
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
    tracing::info!("shutdown signal received");
    shutdown.cancel();
}
