use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::core::job::{JobId, JobStatus};

/// Rejected submission input. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("target URL is missing")]
    EmptyTarget,
    #[error("target is not a valid absolute URL: {0}")]
    InvalidUrl(String),
    #[error("unsupported scheme '{0}', expected http or https")]
    UnsupportedScheme(String),
    #[error("target URL has no host")]
    MissingHost,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {0} already exists")]
    Duplicate(JobId),
    #[error("job {id} is {actual}, expected {expected}")]
    StatusConflict {
        id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },
    /// The lifecycle does not allow `from -> to`, whatever is stored.
    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("job store unavailable: {0}")]
    Unavailable(String),
    #[error("job store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("job store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,
    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

/// Per-probe failure. Absorbed by the orchestrator as a degraded result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed target: {0}")]
    MalformedTarget(String),
    #[error("probe crashed: {0}")]
    Crashed(String),
}

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("job {0} not found")]
    NotFound(JobId),
    /// Redelivery of a settled job. Callers treat this as success.
    #[error("job {id} is already {status}")]
    AlreadyTerminal { id: JobId, status: JobStatus },
    /// Another worker has claimed the job. Callers treat this as success.
    #[error("job {0} is already running")]
    AlreadyRunning(JobId),
    /// With [`PersistStage::Finalize`] the job is left in `running`.
    #[error("persistence failure while {stage}: {source}")]
    PersistenceFailure {
        stage: PersistStage,
        #[source]
        source: StoreError,
    },
}

/// Which store call an orchestration run was making when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistStage {
    Load,
    Claim,
    Finalize,
}

impl fmt::Display for PersistStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PersistStage::Load => "loading",
            PersistStage::Claim => "claiming",
            PersistStage::Finalize => "finalizing",
        };
        f.write_str(s)
    }
}

impl OrchestrationError {
    /// True for outcomes that mean "nothing to do" rather than a fault.
    pub fn is_noop(&self) -> bool {
        matches!(
            self,
            OrchestrationError::AlreadyTerminal { .. } | OrchestrationError::AlreadyRunning(_)
        )
    }

    /// The terminal write failed after probes ran. Redelivery cannot finish
    /// the job: it will find it `running` and skip it.
    pub fn is_stranded(&self) -> bool {
        matches!(
            self,
            OrchestrationError::PersistenceFailure { stage: PersistStage::Finalize, .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("access denied")]
    Forbidden,
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {id} is {status} and cannot be cancelled")]
    InvalidState { id: JobId, status: JobStatus },
    #[error(transparent)]
    Persistence(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl GatewayError {
    /// Only infrastructure failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Persistence(_) | GatewayError::Queue(_))
    }
}
