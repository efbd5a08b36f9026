//! Submission and cancellation entry points.
//!
//! Sits between an (out-of-crate) request layer and the pipeline: it trusts
//! the principal handed to it, validates input, writes job records and
//! talks to the queue. It never runs probes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde_json::Value;

use crate::core::job::{DispatchMessage, Job, JobId, JobStatus, Principal};
use crate::core::queue::JobQueue;
use crate::core::state::{JobStore, StatusUpdate};
use crate::error::{GatewayError, StoreError};
use crate::utils::validate_target;
use crate::ScanConfig;

/// Upper bound on `list` results.
pub const LIST_LIMIT: usize = 100;

/// Resolves an inbound credential to a principal and role.
#[async_trait]
pub trait AuthGate: Send + Sync {
    async fn resolve(&self, credential: &str) -> Result<Principal, GatewayError>;
}

/// Fixed token table, for the CLI and tests.
#[derive(Debug, Default, Clone)]
pub struct StaticAuthGate {
    tokens: HashMap<String, Principal>,
}

impl StaticAuthGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, principal: Principal) -> Self {
        self.tokens.insert(token.into(), principal);
        self
    }
}

#[async_trait]
impl AuthGate for StaticAuthGate {
    async fn resolve(&self, credential: &str) -> Result<Principal, GatewayError> {
        self.tokens.get(credential).cloned().ok_or(GatewayError::Unauthenticated)
    }
}

pub struct ScanGateway {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
}

impl ScanGateway {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn JobQueue>) -> Self {
        Self { store, queue }
    }

    /// Validates the target, normalizes `config`, records a `pending` job and
    /// enqueues it.
    ///
    /// If the enqueue fails the record stays `pending` with nothing to run it.
    /// The error is returned so the caller can retry the submission.
    pub async fn submit(
        &self,
        principal: &Principal,
        target: &str,
        config: &Value,
    ) -> Result<Job, GatewayError> {
        validate_target(target)?;
        let config = ScanConfig::normalize(config);
        let job = Job::new(principal.principal_id.clone(), target.trim(), config);

        self.store.create_job(&job).await?;

        if let Err(e) = self.queue.enqueue(DispatchMessage { job_id: job.id }).await {
            error!("job {} recorded but not enqueued, it stays pending: {}", job.id, e);
            return Err(e.into());
        }

        info!("job {} submitted by {} for {}", job.id, principal.principal_id, job.target);
        Ok(job)
    }

    /// Cancels a `pending` or `running` job, then tries to pull its message
    /// from the queue.
    ///
    /// Message removal is best effort. A job already picked up by a worker is
    /// still cancelled: the orchestrator's final write will not overwrite it.
    pub async fn cancel(&self, principal: &Principal, job_id: JobId) -> Result<Job, GatewayError> {
        let job = self.load_authorized(principal, job_id).await?;

        let mut expected = job.status;
        let cancelled = loop {
            if !expected.is_cancellable() {
                return Err(GatewayError::InvalidState { id: job_id, status: expected });
            }
            match self
                .store
                .update_job_status(job_id, expected, JobStatus::Cancelled, StatusUpdate::finished())
                .await
            {
                Ok(job) => break job,
                // Lost a race with a worker claim or a terminal write; retry from what is stored now.
                Err(StoreError::StatusConflict { actual, .. }) => expected = actual,
                Err(StoreError::NotFound(id)) => return Err(GatewayError::NotFound(id)),
                Err(e) => return Err(e.into()),
            }
        };

        info!("job {} cancelled by {} (was {})", job_id, principal.principal_id, expected);
        self.withdraw(job_id).await;
        Ok(cancelled)
    }

    pub async fn get(&self, principal: &Principal, job_id: JobId) -> Result<Job, GatewayError> {
        self.load_authorized(principal, job_id).await
    }

    /// Caller's own jobs, or every job for an elevated principal. Newest first.
    pub async fn list(&self, principal: &Principal) -> Result<Vec<Job>, GatewayError> {
        let owner = if principal.is_elevated() { None } else { Some(principal.principal_id.as_str()) };
        Ok(self.store.list_jobs(owner, LIST_LIMIT).await?)
    }

    async fn load_authorized(&self, principal: &Principal, job_id: JobId) -> Result<Job, GatewayError> {
        let job = self
            .store
            .load_job(job_id)
            .await?
            .ok_or(GatewayError::NotFound(job_id))?;
        if !principal.can_access(&job) {
            return Err(GatewayError::Forbidden);
        }
        Ok(job)
    }

    /// Removes not-yet-started messages for `job_id`. Returns how many went.
    async fn withdraw(&self, job_id: JobId) -> usize {
        let pending = match self.queue.list_pending().await {
            Ok(p) => p,
            Err(e) => {
                warn!("job {}: could not list queued messages: {}", job_id, e);
                return 0;
            }
        };

        let mut removed = 0;
        for delivery in pending.iter().filter(|d| d.job_id() == job_id) {
            match self.queue.remove(delivery).await {
                Ok(true) => removed += 1,
                Ok(false) => debug!("job {}: message {} already picked up", job_id, delivery.id),
                Err(e) => warn!("job {}: could not remove message {}: {}", job_id, delivery.id, e),
            }
        }
        removed
    }
}
