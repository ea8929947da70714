use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use metrics_alerting::{
    buf::{fan_in, Ingestor},
    config::ServerConfig,
    dump::SnapshotWriter,
    logging,
    server::{self, AppState, WRITE_TIMEOUT},
    shutdown::shutdown_signal,
    storage::open_storage,
};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let cfg = ServerConfig::parse();

    let storage = open_storage(&cfg.database_dsn)
        .await
        .context("open metric storage")?;
    let (publisher, updates) = fan_in();
    let mut writer =
        SnapshotWriter::new(cfg.file_storage_path.clone(), cfg.store_interval(), updates);
    if cfg.restore {
        writer
            .restore(storage.as_ref())
            .await
            .with_context(|| format!("restore {}", cfg.file_storage_path.display()))?;
    }

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let mut writer = tokio::spawn(writer.run_until(async move {
        let _ = stop_rx.await;
    }));

    let state = Arc::new(AppState {
        ingestor: Ingestor::new(storage, publisher, WRITE_TIMEOUT),
    });
    let shutdown = shutdown_signal();
    tokio::select! {
        served = server::serve(&cfg.address, state, cfg.signing_key(), shutdown) => {
            let _ = stop_tx.send(());
            writer
                .await
                .context("snapshot writer task")?
                .context("snapshot writer")?;
            served.context("serve")?;
        }
        // a failed flush stops the process instead of losing updates silently
        stopped = &mut writer => {
            stopped.context("snapshot writer task")?.context("snapshot writer")?;
            anyhow::bail!("snapshot writer stopped unexpectedly");
        }
    }
    info!("server stopped");
    Ok(())
}
