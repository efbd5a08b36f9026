pub mod core;
pub mod error;
pub mod gateway;
pub mod modules;
pub mod utils;
pub mod worker;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use crate::core::engine::Orchestrator;
pub use crate::core::job::{
    DegradedProbe, DispatchMessage, Finding, Job, JobId, JobStatus, Principal, Role, Severity,
};
pub use crate::core::queue::{Delivery, JobQueue, MemoryQueue};
pub use crate::core::result_aggregator::{severity_summary, FindingAggregator, ProbeReport};
pub use crate::core::state::{FileJobStore, JobStore, MemoryJobStore, StatusUpdate};
pub use crate::error::{
    GatewayError, OrchestrationError, PersistStage, ProbeError, QueueError, StoreError,
    ValidationError,
};
pub use crate::gateway::{AuthGate, ScanGateway, StaticAuthGate};
pub use crate::modules::{Probe, ProbeRegistry};
pub use crate::utils::read_lines;
pub use crate::worker::{Disposition, Worker, WorkerPool, WorkerStats};

/// Per-job scan options. Normalized once at submission and never touched again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanConfig {
    pub depth: u32,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self { depth: 1, headers: BTreeMap::new() }
    }
}

impl ScanConfig {
    /// Normalizes untrusted client input.
    ///
    /// `depth` survives only as a positive integer, `headers` only as an
    /// object (non-string values are dropped). Everything else falls back
    /// to the defaults.
    pub fn normalize(raw: &Value) -> Self {
        let depth = raw
            .get("depth")
            .and_then(positive_depth)
            .unwrap_or(1);

        let headers = raw
            .get("headers")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Self { depth, headers }
    }
}

fn positive_depth(v: &Value) -> Option<u32> {
    if let Some(n) = v.as_u64() {
        return u32::try_from(n).ok().filter(|d| *d > 0);
    }
    let f = v.as_f64()?;
    if f.fract() == 0.0 && f >= 1.0 && f <= u32::MAX as f64 {
        Some(f as u32)
    } else {
        None
    }
}

/// Parses `Key: Value` strings as given on the command line.
pub fn parse_custom_headers(raw: &[String]) -> Vec<(String, String)> {
    raw.iter().filter_map(|h| {
        let mut parts = h.splitn(2, ':');
        let key = parts.next()?.trim().to_string();
        let val = parts.next().unwrap_or("").trim().to_string();
        if key.is_empty() { return None; }
        Some((key, val))
    }).collect()
}

/// Process-wide settings for the worker pool and orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub workers: usize,
    pub probe_timeout_secs: u64,
    pub max_delivery_attempts: u32,
    pub retry_delay_ms: u64,
    pub disabled_probes: Vec<String>,
    pub store_path: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            probe_timeout_secs: 30,
            max_delivery_attempts: 5,
            retry_delay_ms: 500,
            disabled_probes: Vec::new(),
            store_path: None,
        }
    }
}

impl EngineConfig {
    /// Reads a JSON config file. Missing keys keep their defaults.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&data)?;
        Ok(config)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn is_probe_enabled(&self, name: &str) -> bool {
        !self.disabled_probes.iter().any(|d| d.eq_ignore_ascii_case(name))
    }
}

/// Operator-facing hook for the pipeline.
/// The CLI renders these to the terminal, services forward them to alerting.
pub trait ScanEventSink: Send + Sync {
    fn on_status(&self, job: &Job);
    fn on_probe_degraded(&self, job_id: JobId, marker: &DegradedProbe);
    /// The job was left non-terminal because its final write failed.
    fn on_persistence_failure(&self, job_id: JobId, error: &StoreError);
}

pub type SinkRef = Arc<dyn ScanEventSink>;

/// Routes pipeline events to the `log` facade.
pub struct LogSink;

impl LogSink {
    pub fn new_ref() -> SinkRef {
        Arc::new(Self)
    }
}

impl ScanEventSink for LogSink {
    fn on_status(&self, job: &Job) {
        log::info!("job {} is {} ({} finding(s))", job.id, job.status, job.findings.len());
    }

    fn on_probe_degraded(&self, job_id: JobId, marker: &DegradedProbe) {
        log::warn!("job {}: probe '{}' degraded: {}", job_id, marker.probe, marker.reason);
    }

    fn on_persistence_failure(&self, job_id: JobId, error: &StoreError) {
        log::error!("job {}: final write failed, job left non-terminal: {}", job_id, error);
    }
}

/// Terminal output sink for CLI usage.
pub struct ConsoleSink {
    verbose: bool,
}

impl ConsoleSink {
    pub fn new_ref(verbose: bool) -> SinkRef {
        Arc::new(Self { verbose })
    }
}

impl ScanEventSink for ConsoleSink {
    fn on_status(&self, job: &Job) {
        use colored::*;
        let label = match job.status {
            JobStatus::Completed => job.status.to_string().green().bold(),
            JobStatus::Failed => job.status.to_string().red().bold(),
            JobStatus::Cancelled => job.status.to_string().yellow().bold(),
            _ => job.status.to_string().cyan(),
        };
        if self.verbose || job.is_terminal() {
            println!("[*] {} {} -> {}", job.id.to_string().dimmed(), job.target, label);
        }
    }

    fn on_probe_degraded(&self, job_id: JobId, marker: &DegradedProbe) {
        use colored::*;
        println!(
            "{}",
            format!("[!] {} probe '{}' degraded: {}", job_id, marker.probe, marker.reason).yellow()
        );
    }

    fn on_persistence_failure(&self, job_id: JobId, error: &StoreError) {
        use colored::*;
        eprintln!(
            "{}",
            format!("[!] {} could not be finalized: {}", job_id, error).red().bold()
        );
    }
}
