//! Command-line and environment configuration for both binaries.
//!
//! Every flag falls back to an environment variable; the environment wins over defaults only.

use std::{path::PathBuf, time::Duration};

use clap::{ArgAction, Parser};

#[derive(Parser, Debug, Clone)]
#[command(name = "server", about = "Metric collector")]
pub struct ServerConfig {
    /// Listen address, host:port
    #[arg(short, long, env = "ADDRESS", default_value = "localhost:8080")]
    pub address: String,

    /// Seconds between snapshot flushes; 0 flushes on every update
    #[arg(short = 'i', long, env = "STORE_INTERVAL", default_value_t = 0)]
    pub store_interval: u64,

    /// Snapshot file
    #[arg(short = 'f', long, env = "FILE_STORAGE_PATH", default_value = "metrics.json")]
    pub file_storage_path: PathBuf,

    /// Restore the snapshot file at startup
    #[arg(short, long, env = "RESTORE", default_value_t = true, action = ArgAction::Set)]
    pub restore: bool,

    /// Database connection string; empty keeps metrics in memory
    #[arg(short, long = "database-dsn", env = "DATABASE_DSN", default_value = "")]
    pub database_dsn: String,

    /// Request signing key
    #[arg(short, long, env = "KEY")]
    pub key: Option<String>,
}
impl ServerConfig {
    pub fn store_interval(&self) -> Duration {
        Duration::from_secs(self.store_interval)
    }

    /// An empty key disables signing.
    pub fn signing_key(&self) -> Option<String> {
        non_empty(&self.key)
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "agent", about = "Metric polling agent")]
pub struct AgentConfig {
    /// Collector address, host:port
    #[arg(short, long, env = "ADDRESS", default_value = "localhost:8080")]
    pub address: String,

    /// Seconds between reports
    #[arg(
        short,
        long,
        env = "REPORT_INTERVAL",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub report_interval: u64,

    /// Seconds between polls
    #[arg(
        short,
        long,
        env = "POLL_INTERVAL",
        default_value_t = 2,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub poll_interval: u64,

    /// Concurrent deliveries
    #[arg(
        short = 'l',
        long,
        env = "RATE_LIMIT",
        default_value_t = 1,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub rate_limit: u64,

    /// Request signing key
    #[arg(short, long, env = "KEY")]
    pub key: Option<String>,
}
impl AgentConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval)
    }
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    /// An empty key disables signing.
    pub fn signing_key(&self) -> Option<String> {
        non_empty(&self.key)
    }
}

fn non_empty(key: &Option<String>) -> Option<String> {
    key.clone().filter(|k| !k.is_empty())
}
