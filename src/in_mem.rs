use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    error::{Result, StorageError},
    metric::{merge, Metric, MetricId, MetricKey, MetricKind, MetricValue},
    storage::Storage,
};

/// Gauges and counters in two maps behind one lock.
#[derive(Debug, Default)]
pub struct MemStorage {
    state: Mutex<MemState>,
}
impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Default)]
struct MemState {
    gauges: HashMap<MetricId, f64>,
    counters: HashMap<MetricId, i64>,
}
impl MemState {
    fn current(&self, id: &str, kind: MetricKind) -> Option<MetricValue> {
        match kind {
            MetricKind::Gauge => self.gauges.get(id).copied().map(MetricValue::Gauge),
            MetricKind::Counter => self.counters.get(id).copied().map(MetricValue::Counter),
        }
    }

    fn apply(&mut self, metric: Metric) -> Metric {
        let merged = merge(self.current(&metric.id, metric.kind()), metric.value);
        match merged {
            MetricValue::Gauge(value) => {
                self.gauges.insert(metric.id.clone(), value);
            }
            MetricValue::Counter(delta) => {
                self.counters.insert(metric.id.clone(), delta);
            }
        }
        Metric {
            id: metric.id,
            value: merged,
        }
    }
}

#[async_trait]
impl Storage for MemStorage {
    async fn upsert(&self, metric: Metric) -> Result<Metric> {
        let mut state = self.state.lock().await;
        Ok(state.apply(metric))
    }

    async fn upsert_batch(&self, metrics: Vec<Metric>) -> Result<Vec<Metric>> {
        let mut state = self.state.lock().await;
        Ok(metrics.into_iter().map(|metric| state.apply(metric)).collect())
    }

    async fn get(&self, key: &MetricKey) -> Result<Metric> {
        let state = self.state.lock().await;
        let value = state
            .current(&key.id, key.kind)
            .ok_or_else(|| StorageError::NotFound {
                id: key.id.clone(),
                kind: key.kind,
            })?;
        Ok(Metric {
            id: key.id.clone(),
            value,
        })
    }

    async fn list_gauges(&self) -> Result<BTreeMap<MetricId, f64>> {
        let state = self.state.lock().await;
        Ok(state.gauges.iter().map(|(k, v)| (k.clone(), *v)).collect())
    }

    async fn list_counters(&self) -> Result<BTreeMap<MetricId, i64>> {
        let state = self.state.lock().await;
        Ok(state.counters.iter().map(|(k, v)| (k.clone(), *v)).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::storage::conformance;

    #[tokio::test]
    async fn conforms() {
        conformance::run_all(|| async { MemStorage::new() }).await;
    }

    #[tokio::test]
    async fn concurrent_counter_updates_all_land() {
        let storage = Arc::new(MemStorage::new());
        let mut handles = vec![];
        for _ in 0..16 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    storage.upsert(Metric::counter("hits", 1)).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let got = storage
            .get(&MetricKey::new("hits", MetricKind::Counter))
            .await
            .unwrap();
        assert_eq!(got, Metric::counter("hits", 1600));
    }

    #[tokio::test]
    async fn returned_metric_is_a_copy() {
        let storage = MemStorage::new();
        let mut stored = storage.upsert(Metric::counter("c", 1)).await.unwrap();
        stored.value = MetricValue::Counter(100);
        storage.upsert(Metric::counter("c", 1)).await.unwrap();
        assert_eq!(storage.list_counters().await.unwrap()["c"], 2);
    }
}
