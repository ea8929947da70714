//! Ingestion fan-in: every stored update, in storage order, to the single durability consumer.

use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;

use crate::{
    error::{Result, StorageError},
    metric::{Metric, RawMetric},
    storage::Storage,
};

/// One slot: a publisher waits until the durability writer has taken the previous update.
pub const FAN_IN_CAPACITY: usize = 1;

pub fn fan_in() -> (MetricPublisher, MetricReceiver) {
    let (tx, rx) = mpsc::channel(FAN_IN_CAPACITY);
    (MetricPublisher { tx }, MetricReceiver { rx })
}

#[derive(Debug, Clone)]
pub struct MetricPublisher {
    tx: mpsc::Sender<Metric>,
}
impl MetricPublisher {
    /// Waits for channel capacity.
    pub async fn publish(&self, metric: Metric) -> Result<()> {
        self.tx.send(metric).await.map_err(|_| StorageError::Closed)
    }
}

/// The consuming end. Not `Clone`: only the durability writer reads it.
#[derive(Debug)]
pub struct MetricReceiver {
    rx: mpsc::Receiver<Metric>,
}
impl MetricReceiver {
    /// `None` once every publisher is dropped and the channel is drained.
    pub async fn recv(&mut self) -> Option<Metric> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Metric> {
        self.rx.try_recv().ok()
    }
}

/// The write path used by request handlers: store first, then publish what was stored.
#[derive(Debug, Clone)]
pub struct Ingestor {
    storage: Arc<dyn Storage>,
    publisher: MetricPublisher,
    timeout: Duration,
}
impl Ingestor {
    pub fn new(storage: Arc<dyn Storage>, publisher: MetricPublisher, timeout: Duration) -> Self {
        Self {
            storage,
            publisher,
            timeout,
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub async fn update(&self, raw: RawMetric) -> Result<Metric> {
        let stored = tokio::time::timeout(self.timeout, self.storage.upsert_raw(raw))
            .await
            .map_err(|_| StorageError::Timeout)??;
        self.publisher.publish(stored.clone()).await?;
        Ok(stored)
    }

    pub async fn update_metric(&self, metric: Metric) -> Result<Metric> {
        let stored = tokio::time::timeout(self.timeout, self.storage.upsert(metric))
            .await
            .map_err(|_| StorageError::Timeout)??;
        self.publisher.publish(stored.clone()).await?;
        Ok(stored)
    }

    pub async fn update_batch(&self, raw: Vec<RawMetric>) -> Result<Vec<Metric>> {
        let stored = tokio::time::timeout(self.timeout, self.storage.upsert_batch_raw(raw))
            .await
            .map_err(|_| StorageError::Timeout)??;
        for metric in &stored {
            self.publisher.publish(metric.clone()).await?;
        }
        Ok(stored)
    }
}
