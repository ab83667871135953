//! In-memory resource store.
//!
//! Implements both store traits with the semantics the reconciler relies on:
//! version-conditional writes, server-side name generation, status writes
//! that leave the spec untouched, and guarded deletion.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use itertools::Itertools;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::store::{JobStore, ScanRequestStore};
use crate::types::{
    EventSeverity, JOB_KIND, JobRecord, ObjectKey, SCAN_REQUEST_KIND, ScanRequest,
};

const GENERATED_SUFFIX_LEN: usize = 5;

/// Event attached to a resource through [`JobStore::emit_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub key: ObjectKey,
    pub severity: EventSeverity,
    pub reason: String,
    pub message: String,
}

/// In-memory store for testing and local simulation.
#[derive(Default)]
pub struct InMemoryStore {
    requests: RwLock<HashMap<ObjectKey, ScanRequest>>,
    jobs: RwLock<HashMap<ObjectKey, JobRecord>>,
    events: RwLock<Vec<RecordedEvent>>,
    status_writes: AtomicUsize,
    job_writes: AtomicUsize,
    fail_creates: AtomicBool,
}

impl InMemoryStore {
    /// Create a new in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new in-memory store wrapped in an Arc.
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Store a request as if a user created it.
    pub async fn insert_request(&self, mut request: ScanRequest) -> ScanRequest {
        request.metadata.resource_version = 1;
        self.requests
            .write()
            .await
            .insert(request.key(), request.clone());
        request
    }

    /// Current copy of a request.
    pub async fn request(&self, key: &ObjectKey) -> Option<ScanRequest> {
        self.requests.read().await.get(key).cloned()
    }

    /// Store a job as-is, bypassing name generation and failure injection.
    pub async fn insert_job(&self, mut job: JobRecord) -> JobRecord {
        job.metadata.resource_version = 1;
        self.jobs.write().await.insert(job.key(), job.clone());
        job
    }

    /// Current copy of a job.
    pub async fn job(&self, key: &ObjectKey) -> Option<JobRecord> {
        self.jobs.read().await.get(key).cloned()
    }

    /// All jobs, ordered by key.
    pub async fn jobs(&self) -> Vec<JobRecord> {
        self.jobs
            .read()
            .await
            .values()
            .cloned()
            .sorted_by(|a, b| a.key().cmp(&b.key()))
            .collect_vec()
    }

    /// Mark a job finished with the given outputs, as the executor would.
    pub async fn complete_job(
        &self,
        key: &ObjectKey,
        outputs: BTreeMap<String, String>,
    ) -> Result<JobRecord> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(key)
            .ok_or_else(|| Error::not_found(JOB_KIND, key.to_string()))?;
        job.status.completion_time = Some(Utc::now());
        job.status.outputs = outputs;
        job.metadata.resource_version = job.metadata.resource_version.saturating_add(1);
        Ok(job.clone())
    }

    /// Request deletion of a job.
    ///
    /// A guarded job only gets a deletion timestamp; it disappears once an
    /// update leaves it without guards.
    pub async fn delete_job(&self, key: &ObjectKey) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(key)
            .ok_or_else(|| Error::not_found(JOB_KIND, key.to_string()))?;
        if job.metadata.deletion_guards.is_empty() {
            jobs.remove(key);
        } else if job.metadata.deletion_timestamp.is_none() {
            job.metadata.deletion_timestamp = Some(Utc::now());
            job.metadata.resource_version = job.metadata.resource_version.saturating_add(1);
        }
        Ok(())
    }

    /// Events emitted so far.
    pub async fn events(&self) -> Vec<RecordedEvent> {
        self.events.read().await.clone()
    }

    /// Number of successful status writes.
    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    /// Number of successful job updates.
    pub fn job_writes(&self) -> usize {
        self.job_writes.load(Ordering::SeqCst)
    }

    /// Make every subsequent job creation fail.
    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }
}

fn generated_name(prefix: &str) -> String {
    let id = Ulid::new().to_string().to_lowercase();
    let start = id.len().saturating_sub(GENERATED_SUFFIX_LEN);
    format!("{prefix}{}", id.get(start..).unwrap_or_default())
}

#[async_trait]
impl ScanRequestStore for InMemoryStore {
    async fn get_request(&self, key: &ObjectKey) -> Result<Option<ScanRequest>> {
        Ok(self.request(key).await)
    }

    async fn update_status(&self, request: &ScanRequest) -> Result<ScanRequest> {
        let key = request.key();
        let mut requests = self.requests.write().await;
        let stored = requests
            .get_mut(&key)
            .ok_or_else(|| Error::not_found(SCAN_REQUEST_KIND, key.to_string()))?;

        if stored.metadata.resource_version != request.metadata.resource_version {
            return Err(Error::conflict(
                SCAN_REQUEST_KIND,
                key.to_string(),
                request.metadata.resource_version,
                stored.metadata.resource_version,
            ));
        }

        stored.status = request.status.clone();
        stored.metadata.resource_version = stored.metadata.resource_version.saturating_add(1);
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored.clone())
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn get_job(&self, key: &ObjectKey) -> Result<Option<JobRecord>> {
        Ok(self.job(key).await)
    }

    async fn create_job(&self, job: &JobRecord) -> Result<JobRecord> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(Error::store("create job", "injected failure"));
        }

        let mut created = job.clone();
        if created.metadata.name.is_empty() {
            let prefix = created
                .metadata
                .generate_name
                .as_deref()
                .ok_or_else(|| Error::store("create job", "name or generate_name is required"))?;
            created.metadata.name = generated_name(prefix);
        }
        created.metadata.resource_version = 1;

        let key = created.key();
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&key) {
            return Err(Error::already_exists(JOB_KIND, key.to_string()));
        }
        jobs.insert(key, created.clone());
        Ok(created)
    }

    async fn update_job(&self, job: &JobRecord) -> Result<JobRecord> {
        let key = job.key();
        let mut jobs = self.jobs.write().await;
        let stored = jobs
            .get(&key)
            .ok_or_else(|| Error::not_found(JOB_KIND, key.to_string()))?;

        if stored.metadata.resource_version != job.metadata.resource_version {
            return Err(Error::conflict(
                JOB_KIND,
                key.to_string(),
                job.metadata.resource_version,
                stored.metadata.resource_version,
            ));
        }

        let mut updated = job.clone();
        updated.metadata.resource_version = stored.metadata.resource_version.saturating_add(1);
        self.job_writes.fetch_add(1, Ordering::SeqCst);

        if updated.metadata.is_deleting() && updated.metadata.deletion_guards.is_empty() {
            jobs.remove(&key);
        } else {
            jobs.insert(key, updated.clone());
        }
        Ok(updated)
    }

    async fn emit_event(
        &self,
        job: &JobRecord,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        self.events.write().await.push(RecordedEvent {
            key: job.key(),
            severity,
            reason: reason.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }
}
