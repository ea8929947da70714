//! Metric sources the agent polls.

use rand::Rng;
use sysinfo::System;

use crate::metric::Metric;

pub trait MetricSource: core::fmt::Debug + Send {
    fn poll(&mut self) -> Vec<Metric>;
}

/// Host memory, CPU and load.
#[derive(Debug)]
pub struct HostSource {
    sys: System,
}
impl HostSource {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu_usage();
        Self { sys }
    }
}
impl Default for HostSource {
    fn default() -> Self {
        Self::new()
    }
}
impl MetricSource for HostSource {
    fn poll(&mut self) -> Vec<Metric> {
        self.sys.refresh_memory();
        self.sys.refresh_cpu_usage();
        let mut metrics = vec![
            Metric::gauge("TotalMemory", self.sys.total_memory() as f64),
            Metric::gauge("FreeMemory", self.sys.free_memory() as f64),
            Metric::gauge("UsedMemory", self.sys.used_memory() as f64),
            Metric::gauge("CPUutilization", f64::from(self.sys.global_cpu_usage())),
            Metric::gauge("LoadAverage1", System::load_average().one),
        ];
        for (i, cpu) in self.sys.cpus().iter().enumerate() {
            metrics.push(Metric::gauge(
                format!("CPUutilization{}", i + 1),
                f64::from(cpu.cpu_usage()),
            ));
        }
        metrics
    }
}

/// `PollCount` (one per poll) and a `RandomValue` gauge in `[1, 10)`.
#[derive(Debug, Default)]
pub struct PollSource;
impl MetricSource for PollSource {
    fn poll(&mut self) -> Vec<Metric> {
        let random = rand::thread_rng().gen_range(1.0..10.0);
        vec![
            Metric::counter("PollCount", 1),
            Metric::gauge("RandomValue", random),
        ]
    }
}
