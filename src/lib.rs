pub mod agent;
pub mod buf;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod dump;
pub mod error;
pub mod exporter;
pub mod in_mem;
pub mod logging;
pub mod metric;
pub mod poll;
pub mod server;
pub mod shutdown;
pub mod sql;
pub mod storage;
pub mod view;

pub use error::{StorageError, ValidationError};
pub use metric::{Metric, MetricId, MetricKey, MetricKind, MetricValue, RawMetric};
pub use storage::Storage;
