//! Resource store traits and the tracing decorator.
//!
//! The reconciler never talks to the cluster directly. It goes through these
//! traits, which the watch/cache layer (or [`crate::InMemoryStore`] in tests)
//! implements.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{EventSeverity, JobRecord, ObjectKey, ScanRequest};

/// Access to scan requests.
#[async_trait]
pub trait ScanRequestStore: Send + Sync {
    /// Fetch a request. `Ok(None)` when it does not exist.
    async fn get_request(&self, key: &ObjectKey) -> Result<Option<ScanRequest>>;

    /// Write the status of a request, conditional on its `resource_version`.
    ///
    /// Returns the stored request with its new version.
    async fn update_status(&self, request: &ScanRequest) -> Result<ScanRequest>;
}

/// Access to job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Fetch a job. `Ok(None)` when it does not exist.
    async fn get_job(&self, key: &ObjectKey) -> Result<Option<JobRecord>>;

    /// Create a job; the store completes `generate_name` into a unique name.
    async fn create_job(&self, job: &JobRecord) -> Result<JobRecord>;

    /// Replace a job, conditional on its `resource_version`.
    async fn update_job(&self, job: &JobRecord) -> Result<JobRecord>;

    /// Attach a diagnostic event to a job.
    async fn emit_event(
        &self,
        job: &JobRecord,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    ) -> Result<()>;
}

/// A wrapper that adds tracing to a store.
pub struct TracingStore<S> {
    inner: S,
}

impl<S> TracingStore<S> {
    /// Create a new tracing store.
    pub const fn new(inner: S) -> Self {
        Self { inner }
    }

    /// Get the wrapped store.
    pub const fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: ScanRequestStore> ScanRequestStore for TracingStore<S> {
    async fn get_request(&self, key: &ObjectKey) -> Result<Option<ScanRequest>> {
        tracing::debug!(key = %key, "Getting scan request");
        self.inner.get_request(key).await
    }

    async fn update_status(&self, request: &ScanRequest) -> Result<ScanRequest> {
        tracing::debug!(
            key = %request.key(),
            version = request.metadata.resource_version,
            state = %request.status.state,
            "Updating scan request status"
        );
        let result = self.inner.update_status(request).await;
        if let Err(ref e) = result {
            tracing::debug!(error = %e, "Status update rejected");
        }
        result
    }
}

#[async_trait]
impl<S: JobStore> JobStore for TracingStore<S> {
    async fn get_job(&self, key: &ObjectKey) -> Result<Option<JobRecord>> {
        tracing::debug!(key = %key, "Getting job");
        self.inner.get_job(key).await
    }

    async fn create_job(&self, job: &JobRecord) -> Result<JobRecord> {
        tracing::debug!(
            namespace = %job.metadata.namespace,
            generate_name = ?job.metadata.generate_name,
            "Creating job"
        );
        let result = self.inner.create_job(job).await;
        if let Ok(ref created) = result {
            tracing::trace!(key = %created.key(), "Job created");
        }
        result
    }

    async fn update_job(&self, job: &JobRecord) -> Result<JobRecord> {
        tracing::debug!(
            key = %job.key(),
            version = job.metadata.resource_version,
            guards = job.metadata.deletion_guards.len(),
            "Updating job"
        );
        self.inner.update_job(job).await
    }

    async fn emit_event(
        &self,
        job: &JobRecord,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        tracing::debug!(key = %job.key(), %severity, reason, "Emitting event");
        self.inner.emit_event(job, severity, reason, message).await
    }
}
