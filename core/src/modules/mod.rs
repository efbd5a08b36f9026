pub mod paths;
pub mod ports;
pub mod subdomains;
pub mod vulns;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use log::debug;
use url::Url;

use crate::core::job::Finding;
use crate::core::result_aggregator::ProbeReport;
use crate::error::ProbeError;
use crate::{EngineConfig, ScanConfig};

pub use paths::PathDiscovery;
pub use ports::PortDiscovery;
pub use subdomains::SubdomainEnumeration;
pub use vulns::VulnerabilityChecks;

/// One detection technique run against a target.
///
/// Implementations hold no per-invocation mutable state, so a single
/// instance serves every job and every worker concurrently.
#[async_trait]
pub trait Probe: Send + Sync {
    fn name(&self) -> &'static str;

    /// Overrides the registry-wide deadline for this probe.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn probe(&self, target: &Url, config: &ScanConfig) -> Result<Vec<Finding>, ProbeError>;
}

/// Fixed, ordered set of probes assembled at process start.
/// Registration order is the aggregation order.
pub struct ProbeRegistry {
    probes: Vec<Arc<dyn Probe>>,
    timeout: Duration,
}

impl ProbeRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self { probes: Vec::new(), timeout }
    }

    /// The four canonical probes minus any disabled in `config`.
    pub fn with_defaults(config: &EngineConfig) -> Self {
        let mut registry = Self::new(config.probe_timeout());
        let defaults: [Arc<dyn Probe>; 4] = [
            Arc::new(PortDiscovery),
            Arc::new(SubdomainEnumeration),
            Arc::new(PathDiscovery),
            Arc::new(VulnerabilityChecks),
        ];
        for probe in defaults {
            if config.is_probe_enabled(probe.name()) {
                registry.register(probe);
            } else {
                debug!("probe '{}' disabled by configuration", probe.name());
            }
        }
        registry
    }

    pub fn register(&mut self, probe: Arc<dyn Probe>) -> &mut Self {
        self.probes.push(probe);
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.probes.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Runs the probe at `index` under its hard deadline.
    ///
    /// A timeout is reported like any other probe failure. The call itself
    /// is never interrupted by job cancellation.
    pub async fn run(&self, index: usize, target: &Url, config: &ScanConfig) -> Option<ProbeReport> {
        let probe = self.probes.get(index)?;
        let deadline = probe.timeout().unwrap_or(self.timeout);

        let start = Instant::now();
        let call = tokio::time::timeout(deadline, probe.probe(target, config));
        let outcome = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProbeError::Timeout(deadline)),
            Err(panic) => Err(ProbeError::Crashed(panic_message(&*panic))),
        };

        Some(ProbeReport {
            index,
            probe: probe.name().to_string(),
            outcome,
            elapsed_ms: start.elapsed().as_millis(),
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Host of `target`, or a `MalformedTarget` error naming the probe.
pub(crate) fn require_host<'a>(target: &'a Url, probe: &str) -> Result<&'a str, ProbeError> {
    target
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ProbeError::MalformedTarget(format!("{probe}: target has no host")))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sleepy;

    #[async_trait]
    impl Probe for Sleepy {
        fn name(&self) -> &'static str {
            "sleepy"
        }

        async fn probe(&self, _: &Url, _: &ScanConfig) -> Result<Vec<Finding>, ProbeError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }
    }

    struct Broken;

    #[async_trait]
    impl Probe for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn probe(&self, _: &Url, _: &ScanConfig) -> Result<Vec<Finding>, ProbeError> {
            panic!("wordlist missing");
        }
    }

    #[tokio::test]
    async fn test_run_contains_panics() {
        let mut registry = ProbeRegistry::new(Duration::from_secs(1));
        registry.register(Arc::new(Broken));
        let target = Url::parse("https://example.com").unwrap();

        let report = registry.run(0, &target, &ScanConfig::default()).await.unwrap();
        assert_eq!(report.outcome, Err(ProbeError::Crashed("wordlist missing".into())));
    }

    #[test]
    fn test_default_registration_order() {
        let registry = ProbeRegistry::with_defaults(&EngineConfig::default());
        assert_eq!(registry.names(), vec!["ports", "subdomains", "paths", "vulns"]);
    }

    #[test]
    fn test_disabled_probes_are_skipped() {
        let config = EngineConfig {
            disabled_probes: vec!["subdomains".into()],
            ..EngineConfig::default()
        };
        let registry = ProbeRegistry::with_defaults(&config);
        assert_eq!(registry.names(), vec!["ports", "paths", "vulns"]);
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let mut registry = ProbeRegistry::new(Duration::from_millis(20));
        registry.register(Arc::new(Sleepy));
        let target = Url::parse("https://example.com").unwrap();

        let report = registry.run(0, &target, &ScanConfig::default()).await.unwrap();
        assert!(matches!(report.outcome, Err(ProbeError::Timeout(_))));
        assert!(registry.run(1, &target, &ScanConfig::default()).await.is_none());
    }
}
