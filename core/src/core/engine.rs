use std::sync::Arc;

use log::{debug, info, warn};
use url::Url;

use crate::core::job::{DegradedProbe, Finding, Job, JobId, JobStatus};
use crate::core::result_aggregator::FindingAggregator;
use crate::core::state::{JobStore, StatusUpdate};
use crate::error::{OrchestrationError, PersistStage, StoreError};
use crate::modules::ProbeRegistry;
use crate::SinkRef;

/// Drives one job from `pending` to a terminal state.
///
/// The orchestrator:
/// 1. Loads the job and returns early for anything that is not `pending`
/// 2. Claims it with a `pending -> running` compare-and-swap
/// 3. Runs every registered probe in order, absorbing probe failures
/// 4. Aggregates findings in registration order
/// 5. Writes the terminal state with a `running -> {completed|failed}`
///    compare-and-swap, so a concurrent cancellation is never overwritten
pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    registry: Arc<ProbeRegistry>,
    sink: SinkRef,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<ProbeRegistry>, sink: SinkRef) -> Self {
        Self { store, registry, sink }
    }

    /// Executes the job. Safe to call again for the same id: a job that has
    /// already left `pending` is reported as a no-op error and left untouched.
    ///
    /// Returns the job as stored at the end, which is `cancelled` when a
    /// cancellation landed while probes were running.
    pub async fn execute(&self, job_id: JobId) -> Result<Job, OrchestrationError> {
        let job = self
            .store
            .load_job(job_id)
            .await
            .map_err(|source| OrchestrationError::PersistenceFailure { stage: PersistStage::Load, source })?
            .ok_or(OrchestrationError::NotFound(job_id))?;

        match job.status {
            JobStatus::Pending => {}
            JobStatus::Running => return Err(OrchestrationError::AlreadyRunning(job_id)),
            status => return Err(OrchestrationError::AlreadyTerminal { id: job_id, status }),
        }

        let job = self.claim(job_id).await?;
        info!("job {} running against {}", job_id, job.target);
        self.sink.on_status(&job);

        let target = match Url::parse(&job.target) {
            Ok(url) => url,
            Err(e) => {
                warn!("job {}: stored target '{}' is unparseable: {}", job_id, job.target, e);
                return self.finish(job_id, JobStatus::Failed, Vec::new(), Vec::new()).await;
            }
        };

        let mut aggregator = FindingAggregator::new();
        for index in 0..self.registry.len() {
            if let Some(cancelled) = self.cancelled_while_running(job_id).await? {
                info!("job {} cancelled before probe #{}, stopping", job_id, index);
                return Ok(cancelled);
            }

            let Some(report) = self.registry.run(index, &target, &job.config).await else {
                break;
            };

            match &report.outcome {
                Ok(found) => debug!(
                    "job {}: probe '{}' returned {} finding(s) in {}ms",
                    job_id, report.probe, found.len(), report.elapsed_ms
                ),
                Err(e) => {
                    let marker = DegradedProbe { probe: report.probe.clone(), reason: e.to_string() };
                    warn!("job {}: probe '{}' degraded: {}", job_id, marker.probe, marker.reason);
                    self.sink.on_probe_degraded(job_id, &marker);
                }
            }
            aggregator.push(report);
        }

        let (findings, degraded) = aggregator.finish();
        self.finish(job_id, JobStatus::Completed, findings, degraded).await
    }

    async fn claim(&self, job_id: JobId) -> Result<Job, OrchestrationError> {
        match self
            .store
            .update_job_status(job_id, JobStatus::Pending, JobStatus::Running, StatusUpdate::none())
            .await
        {
            Ok(job) => Ok(job),
            Err(StoreError::NotFound(id)) => Err(OrchestrationError::NotFound(id)),
            Err(StoreError::StatusConflict { actual, .. }) if actual.is_terminal() => {
                Err(OrchestrationError::AlreadyTerminal { id: job_id, status: actual })
            }
            Err(StoreError::StatusConflict { .. }) => Err(OrchestrationError::AlreadyRunning(job_id)),
            Err(source) => Err(OrchestrationError::PersistenceFailure { stage: PersistStage::Claim, source }),
        }
    }

    /// Cooperative cancellation point between probes. A failed read is not
    /// fatal here: the final compare-and-swap still guards the result.
    async fn cancelled_while_running(&self, job_id: JobId) -> Result<Option<Job>, OrchestrationError> {
        match self.store.load_job(job_id).await {
            Ok(Some(job)) if job.status == JobStatus::Cancelled => Ok(Some(job)),
            Ok(Some(_)) => Ok(None),
            Ok(None) => Err(OrchestrationError::NotFound(job_id)),
            Err(e) => {
                warn!("job {}: status re-check failed, continuing: {}", job_id, e);
                Ok(None)
            }
        }
    }

    /// Single atomic terminal write, applied only if the job is still `running`.
    async fn finish(
        &self,
        job_id: JobId,
        status: JobStatus,
        findings: Vec<Finding>,
        degraded: Vec<DegradedProbe>,
    ) -> Result<Job, OrchestrationError> {
        let findings = if status == JobStatus::Completed { findings } else { Vec::new() };
        let fields = StatusUpdate::finished().with_findings(findings).with_degraded(degraded);

        match self
            .store
            .update_job_status(job_id, JobStatus::Running, status, fields)
            .await
        {
            Ok(job) => {
                info!(
                    "job {} {} with {} finding(s), {} degraded probe(s)",
                    job_id, job.status, job.findings.len(), job.degraded.len()
                );
                self.sink.on_status(&job);
                Ok(job)
            }
            Err(StoreError::StatusConflict { actual: JobStatus::Cancelled, .. }) => {
                info!("job {} was cancelled while running, discarding {} result", job_id, status);
                self.store
                    .load_job(job_id)
                    .await
                    .map_err(|source| OrchestrationError::PersistenceFailure { stage: PersistStage::Load, source })?
                    .ok_or(OrchestrationError::NotFound(job_id))
            }
            Err(StoreError::StatusConflict { actual, .. }) if actual.is_terminal() => {
                Err(OrchestrationError::AlreadyTerminal { id: job_id, status: actual })
            }
            Err(StoreError::NotFound(id)) => Err(OrchestrationError::NotFound(id)),
            Err(e) => {
                self.sink.on_persistence_failure(job_id, &e);
                Err(OrchestrationError::PersistenceFailure { stage: PersistStage::Finalize, source: e })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::core::job::Severity;
    use crate::core::state::MemoryJobStore;
    use crate::error::ProbeError;
    use crate::modules::Probe;
    use crate::{LogSink, ScanConfig};

    struct Fixed(&'static str, usize);

    #[async_trait]
    impl Probe for Fixed {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn probe(&self, _: &Url, _: &ScanConfig) -> Result<Vec<Finding>, ProbeError> {
            Ok((0..self.1)
                .map(|i| Finding::new(self.0, i.to_string(), Severity::Low, "", ""))
                .collect())
        }
    }

    struct Unreachable;

    #[async_trait]
    impl Probe for Unreachable {
        fn name(&self) -> &'static str {
            "unreachable"
        }

        async fn probe(&self, _: &Url, _: &ScanConfig) -> Result<Vec<Finding>, ProbeError> {
            Err(ProbeError::Network("connection refused".into()))
        }
    }

    fn orchestrator(store: Arc<MemoryJobStore>, probes: Vec<Arc<dyn Probe>>) -> Orchestrator {
        let mut registry = ProbeRegistry::new(Duration::from_secs(1));
        for p in probes {
            registry.register(p);
        }
        Orchestrator::new(store, Arc::new(registry), LogSink::new_ref())
    }

    async fn pending(store: &MemoryJobStore, target: &str) -> Job {
        let job = Job::new("alice", target, ScanConfig::default());
        store.create_job(&job).await.unwrap();
        job
    }

    #[tokio::test]
    async fn test_execute_completes_with_aggregated_findings() {
        let store = Arc::new(MemoryJobStore::new());
        let job = pending(&store, "https://example.com").await;
        let engine = orchestrator(store.clone(), vec![Arc::new(Fixed("a", 2)), Arc::new(Fixed("b", 1))]);

        let done = engine.execute(job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.findings.len(), 3);
        assert!(done.invariants_hold());
    }

    #[tokio::test]
    async fn test_probe_failure_degrades_instead_of_failing() {
        let store = Arc::new(MemoryJobStore::new());
        let job = pending(&store, "https://example.com").await;
        let engine = orchestrator(store.clone(), vec![Arc::new(Unreachable), Arc::new(Fixed("b", 1))]);

        let done = engine.execute(job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.findings.len(), 1);
        assert_eq!(done.degraded[0].probe, "unreachable");
    }

    #[tokio::test]
    async fn test_unparseable_target_fails_job() {
        let store = Arc::new(MemoryJobStore::new());
        let job = pending(&store, "not a url").await;
        let engine = orchestrator(store.clone(), vec![Arc::new(Fixed("a", 1))]);

        let done = engine.execute(job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.findings.is_empty());
        assert!(done.invariants_hold());
    }

    #[tokio::test]
    async fn test_missing_and_non_pending_jobs() {
        let store = Arc::new(MemoryJobStore::new());
        let engine = orchestrator(store.clone(), vec![]);
        assert!(matches!(engine.execute(JobId::new()).await, Err(OrchestrationError::NotFound(_))));

        let job = pending(&store, "https://example.com").await;
        store
            .update_job_status(job.id, JobStatus::Pending, JobStatus::Running, StatusUpdate::none())
            .await
            .unwrap();
        let err = engine.execute(job.id).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::AlreadyRunning(_)));
        assert!(err.is_noop());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_is_noop() {
        let store = Arc::new(MemoryJobStore::new());
        let job = pending(&store, "https://example.com").await;
        store
            .update_job_status(job.id, JobStatus::Pending, JobStatus::Cancelled, StatusUpdate::finished())
            .await
            .unwrap();

        let engine = orchestrator(store.clone(), vec![Arc::new(Fixed("a", 1))]);
        let err = engine.execute(job.id).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::AlreadyTerminal { status: JobStatus::Cancelled, .. }));
    }
}
