use std::path::Path;

use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::watch;
use tracing::error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use translib::config::TranslibConfig;
use translib::store::MemStoreClient;
use translib::Error;
use translib::Result;
use translib::TranslibBuilder;

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<()> {
    let config = TranslibConfig::new()?.validate()?;

    // Initializing Logs
    let _guard = init_observability(&config.monitoring.log_dir);

    // Initializing Shutdown Signal
    let (graceful_tx, graceful_rx) = watch::channel(());

    let translib = TranslibBuilder::from_config(config)
        .store_client(std::sync::Arc::new(MemStoreClient::new()))
        .with_table_app()?
        .start_metrics_server(graceful_rx.clone())
        .build();

    info!(?translib, "Translib started. Waiting for CTRL+C signal...");
    if let Err(e) = graceful_shutdown(graceful_tx).await {
        error!("Failed to shutdown: {:?}", e);
    }

    translib.shutdown().await;
    println!("Exiting program.");
    Ok(())
}

async fn graceful_shutdown(graceful_tx: watch::Sender<()>) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).map_err(|e| Error::Fatal(e.to_string()))?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(|e| Error::Fatal(e.to_string()))?;
    tokio::select! {
        _ = sigint.recv() => {
            info!("SIGINT detected.");
        },
        _ = sigterm.recv() => {
            info!("SIGTERM detected.");
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C detected.");
        },
    }

    graceful_tx.send(()).map_err(|e| {
        error!("Failed to send shutdown signal: {}", e);
        Error::Fatal(format!("Failed to send shutdown signal: {e}"))
    })?;

    info!("Shutdown completed");
    Ok(())
}

fn init_observability(log_dir: &Path) -> WorkerGuard {
    let log_file = tracing_appender::rolling::never(log_dir, "translibd.log");

    let (non_blocking, guard) = tracing_appender::non_blocking(log_file);
    let base_subscriber = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(base_subscriber).init();

    guard
}
