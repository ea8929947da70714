//! Agent runtime: poll sources into a batch, report the batch to the collector.

use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{sync::Semaphore, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, error, info};

use crate::{
    config::AgentConfig,
    consumer::MetricBatch,
    exporter::HttpExporter,
    poll::{HostSource, MetricSource, PollSource},
};

#[derive(Debug)]
pub struct Agent {
    sources: Vec<Box<dyn MetricSource>>,
    batch: Arc<Mutex<MetricBatch>>,
    exporter: Arc<HttpExporter>,
    workers: Arc<Semaphore>,
    poll_interval: Duration,
    report_interval: Duration,
}
impl Agent {
    pub fn new(cfg: &AgentConfig) -> Self {
        let exporter = HttpExporter::new(&cfg.address, cfg.signing_key());
        let sources: Vec<Box<dyn MetricSource>> =
            vec![Box::new(PollSource), Box::new(HostSource::new())];
        Self::with_sources(
            exporter,
            sources,
            cfg.poll_interval(),
            cfg.report_interval(),
            cfg.rate_limit as usize,
        )
    }

    pub fn with_sources(
        exporter: HttpExporter,
        sources: Vec<Box<dyn MetricSource>>,
        poll_interval: Duration,
        report_interval: Duration,
        rate_limit: usize,
    ) -> Self {
        Self {
            sources,
            batch: Arc::new(Mutex::new(MetricBatch::new())),
            exporter: Arc::new(exporter),
            workers: Arc::new(Semaphore::new(rate_limit.max(1))),
            poll_interval,
            report_interval,
        }
    }

    pub fn poll_once(&mut self) {
        let mut batch = self.batch.lock().unwrap_or_else(|e| e.into_inner());
        for source in &mut self.sources {
            for metric in source.poll() {
                batch.push(metric);
            }
        }
    }

    /// Captures the batch and hands it to a delivery worker once one is free.
    ///
    /// `None` when nothing was observed since the last report.
    pub fn report(&self) -> Option<JoinHandle<()>> {
        let metrics = self.batch.lock().unwrap_or_else(|e| e.into_inner()).take();
        if metrics.is_empty() {
            return None;
        }
        let workers = self.workers.clone();
        let exporter = self.exporter.clone();
        Some(tokio::spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                return;
            };
            let count = metrics.len();
            let res =
                tokio::task::spawn_blocking(move || exporter.export_with_retry(&metrics)).await;
            match res {
                Ok(Ok(())) => debug!(count, "report delivered"),
                Ok(Err(e)) => error!(count, error = %e, "report dropped"),
                Err(e) => error!(error = %e, "delivery worker panicked"),
            }
        }))
    }

    /// Polls and reports until `shutdown` resolves. Delivery failures never stop the loops.
    pub async fn run_until(mut self, shutdown: impl Future<Output = ()>) {
        info!(
            url = self.exporter.url(),
            poll = ?self.poll_interval,
            report = ?self.report_interval,
            "agent started"
        );
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut report = tokio::time::interval_at(
            tokio::time::Instant::now() + self.report_interval,
            self.report_interval,
        );
        report.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => break,
                _ = poll.tick() => self.poll_once(),
                _ = report.tick() => {
                    self.report();
                }
            }
        }
        info!("agent stopped");
    }
}
