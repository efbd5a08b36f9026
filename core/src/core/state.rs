//! Job record persistence.
//!
//! Every mutation is a single-job update. Status changes are conditional on
//! the currently stored status, which is what lets the orchestrator and the
//! cancellation path share a record without overwriting each other.
//!
//! `FileJobStore` flushes the whole table to a JSON file after each mutation
//! using an atomic write (tmp + rename) so a crash mid-flush never leaves a
//! truncated file behind.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::core::job::{DegradedProbe, Finding, Job, JobId, JobStatus};
use crate::error::StoreError;

/// Extra fields written together with a status change.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub completed_at: Option<DateTime<Utc>>,
    pub findings: Option<Vec<Finding>>,
    pub degraded: Option<Vec<DegradedProbe>>,
}

impl StatusUpdate {
    pub fn none() -> Self {
        Self::default()
    }

    /// Terminal write stamped with the current time.
    pub fn finished() -> Self {
        Self { completed_at: Some(Utc::now()), ..Self::default() }
    }

    pub fn with_findings(mut self, findings: Vec<Finding>) -> Self {
        self.findings = Some(findings);
        self
    }

    pub fn with_degraded(mut self, degraded: Vec<DegradedProbe>) -> Self {
        self.degraded = Some(degraded);
        self
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: &Job) -> Result<(), StoreError>;

    async fn load_job(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Compare-and-swap on status: applies `new` and `fields` only while the
    /// stored status equals `expected`, otherwise fails with
    /// [`StoreError::StatusConflict`] and leaves the record untouched.
    /// `expected -> new` must be a lifecycle edge, or the call fails with
    /// [`StoreError::InvalidTransition`] before the record is looked at.
    async fn update_job_status(
        &self,
        id: JobId,
        expected: JobStatus,
        new: JobStatus,
        fields: StatusUpdate,
    ) -> Result<Job, StoreError>;

    /// Appends findings to a `completed` job.
    async fn append_findings(&self, id: JobId, findings: &[Finding]) -> Result<Job, StoreError>;

    /// Newest first. `owner = None` lists every principal's jobs.
    async fn list_jobs(&self, owner: Option<&str>, limit: usize) -> Result<Vec<Job>, StoreError>;
}

#[derive(Debug, Clone, Default)]
struct JobTable {
    jobs: HashMap<JobId, Job>,
}

impl JobTable {
    fn create(&mut self, job: &Job) -> Result<(), StoreError> {
        if self.jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(job.id));
        }
        self.jobs.insert(job.id, job.clone());
        Ok(())
    }

    /// Returns the updated job and the previous version for rollback.
    fn update_status(
        &mut self,
        id: JobId,
        expected: JobStatus,
        new: JobStatus,
        fields: StatusUpdate,
    ) -> Result<(Job, Job), StoreError> {
        if !expected.can_transition_to(new) {
            return Err(StoreError::InvalidTransition { id, from: expected, to: new });
        }
        let job = self.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if job.status != expected {
            return Err(StoreError::StatusConflict { id, expected, actual: job.status });
        }
        let previous = job.clone();
        job.status = new;
        if let Some(at) = fields.completed_at {
            job.completed_at.get_or_insert(at);
        }
        if let Some(findings) = fields.findings {
            job.findings = findings;
        }
        if let Some(degraded) = fields.degraded {
            job.degraded = degraded;
        }
        Ok((job.clone(), previous))
    }

    fn append(&mut self, id: JobId, findings: &[Finding]) -> Result<(Job, Job), StoreError> {
        let job = self.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if job.status != JobStatus::Completed {
            return Err(StoreError::StatusConflict {
                id,
                expected: JobStatus::Completed,
                actual: job.status,
            });
        }
        let previous = job.clone();
        job.findings.extend_from_slice(findings);
        Ok((job.clone(), previous))
    }

    fn restore(&mut self, previous: Job) {
        self.jobs.insert(previous.id, previous);
    }

    fn list(&self, owner: Option<&str>, limit: usize) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .values()
            .filter(|j| owner.map_or(true, |o| j.owner == o))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs.truncate(limit);
        jobs
    }
}

/// Volatile store for tests and single-process runs.
#[derive(Default)]
pub struct MemoryJobStore {
    table: RwLock<JobTable>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        self.table.write().await.create(job)
    }

    async fn load_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.table.read().await.jobs.get(&id).cloned())
    }

    async fn update_job_status(
        &self,
        id: JobId,
        expected: JobStatus,
        new: JobStatus,
        fields: StatusUpdate,
    ) -> Result<Job, StoreError> {
        let (job, _) = self.table.write().await.update_status(id, expected, new, fields)?;
        Ok(job)
    }

    async fn append_findings(&self, id: JobId, findings: &[Finding]) -> Result<Job, StoreError> {
        let (job, _) = self.table.write().await.append(id, findings)?;
        Ok(job)
    }

    async fn list_jobs(&self, owner: Option<&str>, limit: usize) -> Result<Vec<Job>, StoreError> {
        Ok(self.table.read().await.list(owner, limit))
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreSnapshot {
    jobs: Vec<Job>,
    last_checkpoint: DateTime<Utc>,
}

/// Durable store backed by a single JSON file.
pub struct FileJobStore {
    path: PathBuf,
    table: Mutex<JobTable>,
}

impl FileJobStore {
    /// Opens the store, loading existing records if the file is present.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut table = JobTable::default();

        match tokio::fs::read_to_string(&path).await {
            Ok(data) => {
                let snapshot: StoreSnapshot = serde_json::from_str(&data)?;
                for job in snapshot.jobs {
                    table.jobs.insert(job.id, job);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Self { path, table: Mutex::new(table) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, table: &JobTable) -> Result<(), StoreError> {
        let mut jobs: Vec<Job> = table.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let snapshot = StoreSnapshot { jobs, last_checkpoint: Utc::now() };

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let json = serde_json::to_string_pretty(&snapshot)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut table = self.table.lock().await;
        table.create(job)?;
        if let Err(e) = self.flush(&table).await {
            table.jobs.remove(&job.id);
            return Err(e);
        }
        Ok(())
    }

    async fn load_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.table.lock().await.jobs.get(&id).cloned())
    }

    async fn update_job_status(
        &self,
        id: JobId,
        expected: JobStatus,
        new: JobStatus,
        fields: StatusUpdate,
    ) -> Result<Job, StoreError> {
        let mut table = self.table.lock().await;
        let (job, previous) = table.update_status(id, expected, new, fields)?;
        if let Err(e) = self.flush(&table).await {
            table.restore(previous);
            return Err(e);
        }
        Ok(job)
    }

    async fn append_findings(&self, id: JobId, findings: &[Finding]) -> Result<Job, StoreError> {
        let mut table = self.table.lock().await;
        let (job, previous) = table.append(id, findings)?;
        if let Err(e) = self.flush(&table).await {
            table.restore(previous);
            return Err(e);
        }
        Ok(job)
    }

    async fn list_jobs(&self, owner: Option<&str>, limit: usize) -> Result<Vec<Job>, StoreError> {
        Ok(self.table.lock().await.list(owner, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::Severity;
    use crate::ScanConfig;

    fn job(owner: &str) -> Job {
        Job::new(owner, "https://example.com", ScanConfig::default())
    }

    #[tokio::test]
    async fn test_cas_applies_only_on_expected_status() {
        let store = MemoryJobStore::new();
        let j = job("alice");
        store.create_job(&j).await.unwrap();

        let running = store
            .update_job_status(j.id, JobStatus::Pending, JobStatus::Running, StatusUpdate::none())
            .await
            .unwrap();
        assert_eq!(running.status, JobStatus::Running);

        let err = store
            .update_job_status(j.id, JobStatus::Pending, JobStatus::Cancelled, StatusUpdate::finished())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::StatusConflict { expected: JobStatus::Pending, actual: JobStatus::Running, .. }
        ));

        let stored = store.load_job(j.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert!(stored.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_and_missing() {
        let store = MemoryJobStore::new();
        let j = job("alice");
        store.create_job(&j).await.unwrap();
        assert!(matches!(store.create_job(&j).await, Err(StoreError::Duplicate(_))));

        let missing = JobId::new();
        assert!(store.load_job(missing).await.unwrap().is_none());
        assert!(matches!(
            store.update_job_status(missing, JobStatus::Pending, JobStatus::Running, StatusUpdate::none()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_terminal_states_are_final() {
        let store = MemoryJobStore::new();
        let j = job("alice");
        store.create_job(&j).await.unwrap();
        store
            .update_job_status(j.id, JobStatus::Pending, JobStatus::Running, StatusUpdate::none())
            .await
            .unwrap();
        let done = store
            .update_job_status(j.id, JobStatus::Running, JobStatus::Completed, StatusUpdate::finished())
            .await
            .unwrap();

        let later = StatusUpdate { completed_at: Some(Utc::now() + chrono::Duration::seconds(60)), ..StatusUpdate::none() };
        assert!(matches!(
            store.update_job_status(j.id, JobStatus::Completed, JobStatus::Completed, later).await,
            Err(StoreError::InvalidTransition { from: JobStatus::Completed, to: JobStatus::Completed, .. })
        ));
        assert!(matches!(
            store.update_job_status(j.id, JobStatus::Completed, JobStatus::Running, StatusUpdate::none()).await,
            Err(StoreError::InvalidTransition { .. })
        ));
        assert_eq!(store.load_job(j.id).await.unwrap().unwrap(), done);
    }

    #[tokio::test]
    async fn test_illegal_edges_are_rejected() {
        let store = MemoryJobStore::new();
        let j = job("alice");
        store.create_job(&j).await.unwrap();
        let cancelled = store
            .update_job_status(j.id, JobStatus::Pending, JobStatus::Cancelled, StatusUpdate::finished())
            .await
            .unwrap();

        // A cancelled job cannot be revived, even with the right expected status.
        assert!(matches!(
            store.update_job_status(j.id, JobStatus::Cancelled, JobStatus::Running, StatusUpdate::none()).await,
            Err(StoreError::InvalidTransition { from: JobStatus::Cancelled, to: JobStatus::Running, .. })
        ));
        let stored = store.load_job(j.id).await.unwrap().unwrap();
        assert_eq!(stored, cancelled);
        assert!(stored.invariants_hold());

        let other = job("alice");
        store.create_job(&other).await.unwrap();
        store
            .update_job_status(other.id, JobStatus::Pending, JobStatus::Running, StatusUpdate::none())
            .await
            .unwrap();
        assert!(matches!(
            store.update_job_status(other.id, JobStatus::Running, JobStatus::Pending, StatusUpdate::none()).await,
            Err(StoreError::InvalidTransition { .. })
        ));
        assert!(matches!(
            store.update_job_status(other.id, JobStatus::Pending, JobStatus::Completed, StatusUpdate::finished()).await,
            Err(StoreError::InvalidTransition { .. })
        ));
        assert_eq!(store.load_job(other.id).await.unwrap().unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_append_requires_completed() {
        let store = MemoryJobStore::new();
        let j = job("alice");
        store.create_job(&j).await.unwrap();
        let finding = Finding::new("XSS", "q", Severity::Medium, "d", "r");

        assert!(store.append_findings(j.id, &[finding.clone()]).await.is_err());

        store.update_job_status(j.id, JobStatus::Pending, JobStatus::Running, StatusUpdate::none()).await.unwrap();
        store
            .update_job_status(j.id, JobStatus::Running, JobStatus::Completed, StatusUpdate::finished().with_findings(vec![finding.clone()]))
            .await
            .unwrap();
        let job = store.append_findings(j.id, &[finding]).await.unwrap();
        assert_eq!(job.findings.len(), 2);
    }

    #[tokio::test]
    async fn test_list_scoped_and_newest_first() {
        let store = MemoryJobStore::new();
        let mut a1 = job("alice");
        let mut a2 = job("alice");
        let b = job("bob");
        a1.created_at = Utc::now() - chrono::Duration::seconds(10);
        a2.created_at = Utc::now();
        for j in [&a1, &a2, &b] {
            store.create_job(j).await.unwrap();
        }

        let mine = store.list_jobs(Some("alice"), 100).await.unwrap();
        assert_eq!(mine.iter().map(|j| j.id).collect::<Vec<_>>(), vec![a2.id, a1.id]);
        assert_eq!(store.list_jobs(None, 100).await.unwrap().len(), 3);
        assert_eq!(store.list_jobs(None, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");

        let j = job("alice");
        {
            let store = FileJobStore::open(&path).await.unwrap();
            store.create_job(&j).await.unwrap();
            store
                .update_job_status(j.id, JobStatus::Pending, JobStatus::Cancelled, StatusUpdate::finished())
                .await
                .unwrap();
        }

        let reopened = FileJobStore::open(&path).await.unwrap();
        let stored = reopened.load_job(j.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert!(stored.completed_at.is_some());
        assert!(!dir.path().join("jobs.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_rolls_back_on_failed_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("jobs.json");
        let store = FileJobStore::open(&path).await.unwrap();

        let j = job("alice");
        assert!(matches!(store.create_job(&j).await, Err(StoreError::Io(_))));
        assert!(store.load_job(j.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_rolls_back_status_on_failed_flush() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir(&data).unwrap();
        let store = FileJobStore::open(data.join("jobs.json")).await.unwrap();

        let j = job("alice");
        store.create_job(&j).await.unwrap();
        std::fs::remove_dir_all(&data).unwrap();

        let res = store
            .update_job_status(j.id, JobStatus::Pending, JobStatus::Running, StatusUpdate::none())
            .await;
        assert!(matches!(res, Err(StoreError::Io(_))));
        let stored = store.load_job(j.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored, j);
    }
}
