//! Durability writer: mirrors the fan-in into a snapshot and persists it to a JSON file.

use std::{
    collections::BTreeMap,
    future::Future,
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::{
    fs,
    io::AsyncWriteExt,
    time::{Interval, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::{
    buf::MetricReceiver,
    error::{Result, StorageError},
    metric::{Metric, MetricId},
    storage::Storage,
};

/// Last known metric per id, as written to disk.
pub type Snapshot = BTreeMap<MetricId, Metric>;

#[derive(Debug)]
pub struct SnapshotWriter {
    path: PathBuf,
    /// Zero flushes after every update.
    interval: Duration,
    snapshot: Snapshot,
    updates: MetricReceiver,
}
impl SnapshotWriter {
    pub fn new(path: impl Into<PathBuf>, interval: Duration, updates: MetricReceiver) -> Self {
        Self {
            path: path.into(),
            interval,
            snapshot: Snapshot::new(),
            updates,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Loads the snapshot file into this writer and replays every entry into `storage`.
    ///
    /// A missing or empty file is an empty snapshot. A backend that already holds metrics, such as
    /// a database kept across restarts, is left as is and seeds the snapshot instead, since
    /// replaying counter totals on top of it would count them twice. Returns the number of entries
    /// applied.
    pub async fn restore(&mut self, storage: &dyn Storage) -> Result<usize> {
        let gauges = storage.list_gauges().await?;
        let counters = storage.list_counters().await?;
        if !gauges.is_empty() || !counters.is_empty() {
            let held = gauges
                .into_iter()
                .map(|(id, value)| Metric::gauge(id, value))
                .chain(counters.into_iter().map(|(id, delta)| Metric::counter(id, delta)));
            for metric in held {
                self.record(metric);
            }
            info!(
                path = ?self.path,
                count = self.snapshot.len(),
                "backend already holds metrics, skipping snapshot restore"
            );
            return Ok(0);
        }
        let snapshot = read_snapshot(&self.path).await?;
        let count = snapshot.len();
        for metric in snapshot.values() {
            storage.upsert(metric.clone()).await?;
        }
        self.snapshot.extend(snapshot);
        info!(path = ?self.path, count, "restored metrics snapshot");
        Ok(count)
    }

    fn record(&mut self, metric: Metric) {
        self.snapshot.insert(metric.id.clone(), metric);
    }

    /// Replaces the file with the current snapshot.
    ///
    /// Writes a sibling temporary file and renames it over the target, so a crash mid-write
    /// leaves the previous snapshot intact.
    pub async fn flush(&self) -> Result<()> {
        let io_err = |source: std::io::Error| StorageError::Snapshot {
            path: self.path.clone(),
            source,
        };
        let buf = serde_json::to_vec(&self.snapshot).map_err(StorageError::Encode)?;
        let tmp = tmp_path(&self.path);
        let mut file = fs::File::create(&tmp).await.map_err(io_err)?;
        file.write_all(&buf).await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        drop(file);
        fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        debug!(path = ?self.path, count = self.snapshot.len(), "flushed metrics snapshot");
        Ok(())
    }

    /// Consumes updates until every publisher is gone, then flushes one final time.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Consumes updates until `shutdown` resolves or every publisher is gone. Updates already
    /// queued are recorded, then the snapshot is flushed exactly once more.
    ///
    /// Any flush error ends the loop and is returned.
    pub async fn run_until(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        let mut ticker = (!self.interval.is_zero()).then(|| {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        if let Some(ticker) = ticker.as_mut() {
            // the first tick completes immediately
            ticker.tick().await;
        }
        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => break,
                update = self.updates.recv() => match update {
                    Some(metric) => {
                        self.record(metric);
                        if ticker.is_none() {
                            self.flush().await?;
                        }
                    }
                    None => break,
                },
                () = tick(&mut ticker) => self.flush().await?,
            }
        }
        while let Some(metric) = self.updates.try_recv() {
            self.record(metric);
        }
        info!(path = ?self.path, count = self.snapshot.len(), "writing final metrics snapshot");
        self.flush().await
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Opens (creating if absent) and decodes a snapshot file.
pub async fn read_snapshot(path: &Path) -> Result<Snapshot> {
    let io_err = |source: std::io::Error| StorageError::Snapshot {
        path: path.to_path_buf(),
        source,
    };
    let file = fs::OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)
        .await
        .map_err(io_err)?;
    drop(file);
    let buf = fs::read(path).await.map_err(io_err)?;
    if buf.iter().all(u8::is_ascii_whitespace) {
        return Ok(Snapshot::new());
    }
    serde_json::from_slice(&buf).map_err(|source| StorageError::Decode {
        path: path.to_path_buf(),
        source,
    })
}
