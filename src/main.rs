use clap::Parser;
use prerender_service::{setup_logging, Cli, CliRunner, Metrics, PrometheusExporter};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    setup_logging(args.verbose)?;

    info!("Starting prerender v{}", env!("CARGO_PKG_VERSION"));

    let config = args.load_config().await?;

    // the recorder must be installed before any metric handle is registered
    if let Some(port) = args.metrics_port {
        PrometheusExporter::new(port).start()?;
    }
    let metrics = Arc::new(Metrics::new());

    let cli_runner = CliRunner::new(config, metrics);

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel(1);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx);

    let result = tokio::select! {
        result = cli_runner.run(args.command) => {
            info!("Command completed");
            result
        }
        Ok(()) = shutdown_rx.recv() => {
            info!("Received shutdown signal");
            Ok(())
        }
    };

    info!("Shutting down...");
    cli_runner.shutdown().await;

    if let Err(e) = result {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }

    info!("prerender stopped");
    Ok(())
}

fn setup_shutdown_handler(
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let (mut sigint, mut sigterm) = match (
            signal::unix::signal(signal::unix::SignalKind::interrupt()),
            signal::unix::signal(signal::unix::SignalKind::terminate()),
        ) {
            (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }

        let _ = shutdown_tx.send(());
    })
}
