use std::collections::HashMap;

use crate::metric::{merge, Metric, MetricId, MetricKind};

/// Agent-side metrics observed since the last report.
///
/// Keyed by kind and id: a gauge keeps only its latest observation, a counter sums its deltas.
#[derive(Debug, Clone, Default)]
pub struct MetricBatch {
    metrics: HashMap<(MetricKind, MetricId), Metric>,
}
impl MetricBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, metric: Metric) {
        let key = (metric.kind(), metric.id.clone());
        let existing = self.metrics.get(&key).map(|m| m.value);
        let value = merge(existing, metric.value);
        self.metrics.insert(
            key,
            Metric {
                id: metric.id,
                value,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Captures everything observed so far and leaves the batch empty.
    pub fn take(&mut self) -> Vec<Metric> {
        let mut metrics: Vec<_> = std::mem::take(&mut self.metrics).into_values().collect();
        metrics.sort_by(|a, b| (a.kind(), &a.id).cmp(&(b.kind(), &b.id)));
        metrics
    }
}
