//! Scalar metric model and the merge rule every backend applies.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

pub type MetricId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Gauge,
    Counter,
}
impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gauge => "gauge",
            Self::Counter => "counter",
        }
    }
}
impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
impl FromStr for MetricKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gauge" => Ok(Self::Gauge),
            "counter" => Ok(Self::Counter),
            other => Err(ValidationError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Gauge(f64),
    Counter(i64),
}
impl MetricValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Gauge(_) => MetricKind::Gauge,
            Self::Counter(_) => MetricKind::Counter,
        }
    }

    /// Parses a textual value, as received in an update URL.
    pub fn parse(kind: MetricKind, raw: &str) -> Result<Self, ValidationError> {
        let invalid = || ValidationError::InvalidNumber {
            kind,
            raw: raw.to_string(),
        };
        match kind {
            MetricKind::Gauge => match raw.parse::<f64>() {
                Ok(value) if value.is_finite() => Ok(Self::Gauge(value)),
                _ => Err(invalid()),
            },
            MetricKind::Counter => raw.parse().map(Self::Counter).map_err(|_| invalid()),
        }
    }
}
impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gauge(value) => write!(f, "{value}"),
            Self::Counter(delta) => write!(f, "{delta}"),
        }
    }
}

/// Gauges take the incoming value; counters add the incoming delta to what is stored.
///
/// Counter addition wraps on overflow.
pub fn merge(existing: Option<MetricValue>, incoming: MetricValue) -> MetricValue {
    match (existing, incoming) {
        (Some(MetricValue::Counter(stored)), MetricValue::Counter(delta)) => {
            MetricValue::Counter(stored.wrapping_add(delta))
        }
        (_, incoming) => incoming,
    }
}

/// A validated metric. Storage hands out copies, never references into its maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMetric", into = "RawMetric")]
pub struct Metric {
    pub id: MetricId,
    pub value: MetricValue,
}
impl Metric {
    pub fn gauge(id: impl Into<MetricId>, value: f64) -> Self {
        Self {
            id: id.into(),
            value: MetricValue::Gauge(value),
        }
    }
    pub fn counter(id: impl Into<MetricId>, delta: i64) -> Self {
        Self {
            id: id.into(),
            value: MetricValue::Counter(delta),
        }
    }

    /// Builds a metric from the three path segments of `/update/{kind}/{id}/{value}`.
    pub fn parse(kind: &str, id: &str, value: &str) -> Result<Self, ValidationError> {
        let kind = kind.parse()?;
        if id.is_empty() {
            return Err(ValidationError::EmptyId);
        }
        let value = MetricValue::parse(kind, value)?;
        Ok(Self {
            id: id.to_string(),
            value,
        })
    }

    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }
    pub fn key(&self) -> MetricKey {
        MetricKey {
            id: self.id.clone(),
            kind: self.kind(),
        }
    }
}

/// Addresses one stored metric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricKey {
    pub id: MetricId,
    pub kind: MetricKind,
}
impl MetricKey {
    pub fn new(id: impl Into<MetricId>, kind: MetricKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}
impl TryFrom<&RawMetric> for MetricKey {
    type Error = ValidationError;

    fn try_from(raw: &RawMetric) -> Result<Self, Self::Error> {
        let kind = raw.kind.parse()?;
        if raw.id.is_empty() {
            return Err(ValidationError::EmptyId);
        }
        Ok(Self::new(raw.id.clone(), kind))
    }
}

/// Wire shape of a metric: `{"id", "type", "value"?, "delta"?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMetric {
    pub id: MetricId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
}
impl TryFrom<RawMetric> for Metric {
    type Error = ValidationError;

    fn try_from(raw: RawMetric) -> Result<Self, Self::Error> {
        let key = MetricKey::try_from(&raw)?;
        let missing = |field| ValidationError::MissingField {
            id: raw.id.clone(),
            kind: key.kind,
            field,
        };
        let value = match key.kind {
            MetricKind::Gauge => MetricValue::Gauge(raw.value.ok_or_else(|| missing("value"))?),
            MetricKind::Counter => {
                MetricValue::Counter(raw.delta.ok_or_else(|| missing("delta"))?)
            }
        };
        Ok(Self { id: key.id, value })
    }
}
impl From<Metric> for RawMetric {
    fn from(metric: Metric) -> Self {
        let (value, delta) = match metric.value {
            MetricValue::Gauge(value) => (Some(value), None),
            MetricValue::Counter(delta) => (None, Some(delta)),
        };
        Self {
            id: metric.id,
            kind: metric.value.kind().to_string(),
            value,
            delta,
        }
    }
}
