//! The backend contract shared by the in-memory and relational stores.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;

use crate::{
    error::Result,
    in_mem::MemStorage,
    metric::{Metric, MetricId, MetricKey, RawMetric},
    sql::SqlStorage,
};

/// Owns current metric state and applies [`crate::metric::merge`] under its own locking.
#[async_trait]
pub trait Storage: core::fmt::Debug + Send + Sync {
    /// Merges `metric` into the stored state and returns a copy of the result.
    async fn upsert(&self, metric: Metric) -> Result<Metric>;

    /// Merges every metric in input order.
    ///
    /// Repeated ids are applied as separate merges, so the last gauge wins and counters add up.
    async fn upsert_batch(&self, metrics: Vec<Metric>) -> Result<Vec<Metric>>;

    async fn get(&self, key: &MetricKey) -> Result<Metric>;

    async fn list_gauges(&self) -> Result<BTreeMap<MetricId, f64>>;

    async fn list_counters(&self) -> Result<BTreeMap<MetricId, i64>>;

    /// Liveness of the backing store.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// Validates a wire metric before it touches any state.
    async fn upsert_raw(&self, raw: RawMetric) -> Result<Metric> {
        let metric = Metric::try_from(raw)?;
        self.upsert(metric).await
    }

    /// Validates the whole batch first; nothing is applied if any element is invalid.
    async fn upsert_batch_raw(&self, raw: Vec<RawMetric>) -> Result<Vec<Metric>> {
        let metrics = raw
            .into_iter()
            .map(Metric::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        self.upsert_batch(metrics).await
    }
}

/// Picks the backend for a connection string: empty means in-memory.
pub async fn open_storage(dsn: &str) -> Result<Arc<dyn Storage>> {
    if dsn.is_empty() {
        tracing::info!("using in-memory metric storage");
        return Ok(Arc::new(MemStorage::new()));
    }
    let storage = SqlStorage::connect(dsn).await?;
    Ok(Arc::new(storage))
}

/// Backend conformance checks run against every implementation.
#[cfg(test)]
pub(crate) mod conformance {
    use super::*;
    use crate::{error::StorageError, error::ValidationError, metric::MetricKind};

    pub async fn last_gauge_wins(storage: &dyn Storage) {
        storage.upsert(Metric::gauge("Alloc", 1.1)).await.unwrap();
        let stored = storage.upsert(Metric::gauge("Alloc", 2.2)).await.unwrap();
        assert_eq!(stored, Metric::gauge("Alloc", 2.2));
        storage.upsert(Metric::gauge("Alloc", 0.5)).await.unwrap();
        let got = storage
            .get(&MetricKey::new("Alloc", MetricKind::Gauge))
            .await
            .unwrap();
        assert_eq!(got, Metric::gauge("Alloc", 0.5));
    }

    pub async fn counters_accumulate(storage: &dyn Storage) {
        storage.upsert(Metric::counter("PollCount", 1)).await.unwrap();
        let stored = storage.upsert(Metric::counter("PollCount", 1)).await.unwrap();
        assert_eq!(stored, Metric::counter("PollCount", 2));
        for delta in [5, -3, 10] {
            storage.upsert(Metric::counter("PollCount", delta)).await.unwrap();
        }
        let got = storage
            .get(&MetricKey::new("PollCount", MetricKind::Counter))
            .await
            .unwrap();
        assert_eq!(got, Metric::counter("PollCount", 14));
    }

    pub async fn kinds_are_separate(storage: &dyn Storage) {
        storage.upsert(Metric::gauge("x", 1.0)).await.unwrap();
        storage.upsert(Metric::counter("x", 7)).await.unwrap();
        assert_eq!(
            storage.list_gauges().await.unwrap(),
            BTreeMap::from([("x".to_string(), 1.0)])
        );
        assert_eq!(
            storage.list_counters().await.unwrap(),
            BTreeMap::from([("x".to_string(), 7)])
        );
    }

    pub async fn missing_is_not_found(storage: &dyn Storage) {
        let err = storage
            .get(&MetricKey::new("nope", MetricKind::Gauge))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
        assert!(err.is_client_error());
    }

    pub async fn unknown_kind_leaves_state_untouched(storage: &dyn Storage) {
        let raw = RawMetric {
            id: "x".into(),
            kind: "histogram".into(),
            value: Some(1.0),
            delta: None,
        };
        let err = storage.upsert_raw(raw).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::Validation(ValidationError::UnknownKind(_))
        ));
        assert!(storage.list_gauges().await.unwrap().is_empty());
        assert!(storage.list_counters().await.unwrap().is_empty());
    }

    pub async fn batch_applies_in_order(storage: &dyn Storage) {
        let stored = storage
            .upsert_batch(vec![
                Metric::gauge("Alloc", 1.0),
                Metric::counter("PollCount", 2),
                Metric::gauge("Alloc", 3.0),
                Metric::counter("PollCount", 5),
            ])
            .await
            .unwrap();
        assert_eq!(
            stored,
            vec![
                Metric::gauge("Alloc", 1.0),
                Metric::counter("PollCount", 2),
                Metric::gauge("Alloc", 3.0),
                Metric::counter("PollCount", 7),
            ]
        );
        assert_eq!(storage.list_gauges().await.unwrap()["Alloc"], 3.0);
        assert_eq!(storage.list_counters().await.unwrap()["PollCount"], 7);
    }

    pub async fn invalid_batch_applies_nothing(storage: &dyn Storage) {
        let batch = vec![
            RawMetric {
                id: "Alloc".into(),
                kind: "gauge".into(),
                value: Some(1.0),
                delta: None,
            },
            RawMetric {
                id: "PollCount".into(),
                kind: "counter".into(),
                value: None,
                delta: None,
            },
        ];
        let err = storage.upsert_batch_raw(batch).await.unwrap_err();
        assert!(err.is_client_error());
        assert!(storage.list_gauges().await.unwrap().is_empty());
    }

    pub async fn run_all<S, F, Fut>(new: F)
    where
        S: Storage,
        F: Fn() -> Fut,
        Fut: core::future::Future<Output = S>,
    {
        // each check expects a fresh backend
        last_gauge_wins(&new().await).await;
        counters_accumulate(&new().await).await;
        kinds_are_separate(&new().await).await;
        missing_is_not_found(&new().await).await;
        unknown_kind_leaves_state_untouched(&new().await).await;
        batch_applies_in_order(&new().await).await;
        invalid_batch_applies_nothing(&new().await).await;
    }
}
