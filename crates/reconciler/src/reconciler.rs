//! Reconciler implementation.
//!
//! Every decision is re-derived from the resources as they are stored now;
//! nothing is remembered between invocations. The store redelivers a key
//! after each mutation, which drives the next step.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::ReconcilerConfig;
use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::event::{ReconcileAction, ReconcileEvent, ReconcileResult};
use crate::parser::parse_dependencies;
use crate::pipeline::{IMAGE_DIGEST_OUTPUT, JVM_DEPENDENCIES_OUTPUT, JobSpec, JobSpecBuilder};
use crate::resolver::{EnvImageResolver, ImageNameResolver};
use crate::store::{JobStore, ScanRequestStore};
use crate::types::{
    EventSeverity, JobRecord, JobStatus, ObjectKey, ObjectMeta, OwnerReference,
    SCAN_REQUEST_KIND, ScanRequest, ScanState,
};

/// Guard keeping a job around until its results have been read.
pub const DELETION_GUARD: &str = "jvmbuildservice.io/image-analysis-finalizer";

/// Label marking jobs created by this reconciler.
pub const JOB_LABEL: &str = "jvmbuildservice.io/image-analysis-pipelinerun";

const JOB_NAME_SUFFIX: &str = "-image-discovery-";
const MISSING_OWNER_REASON: &str = "MissingOwner";

/// Reconciler for scan requests and their jobs.
pub struct Reconciler {
    requests: Arc<dyn ScanRequestStore>,
    jobs: Arc<dyn JobStore>,
    resolver: Arc<dyn ImageNameResolver>,
    builder: JobSpecBuilder,
    config: ReconcilerConfig,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(
        requests: Arc<dyn ScanRequestStore>,
        jobs: Arc<dyn JobStore>,
        resolver: Arc<dyn ImageNameResolver>,
        config: ReconcilerConfig,
    ) -> Self {
        let builder = JobSpecBuilder::new(config.pipeline.clone());
        Self {
            requests,
            jobs,
            resolver,
            builder,
            config,
        }
    }

    /// Start building a reconciler.
    pub fn builder() -> ReconcilerBuilder {
        ReconcilerBuilder::new()
    }

    /// Reconcile one delivered key.
    ///
    /// Errors are retryable store failures; the caller should redeliver the
    /// key. Terminal problems are recorded on the request instead.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileResult> {
        let span = info_span!("reconcile", namespace = %key.namespace, name = %key.name);
        self.reconcile_key(key).instrument(span).await
    }

    async fn reconcile_key(&self, key: &ObjectKey) -> Result<ReconcileResult> {
        let deadline = Deadline::after(self.config.call_timeout);

        let request = deadline
            .run("get scan request", self.requests.get_request(key))
            .await?;
        let job = deadline.run("get job", self.jobs.get_job(key)).await?;

        let event = ReconcileEvent::classify(request, job);
        let kind = event.kind();
        debug!(event = %kind, "Classified event");

        let outcome = match event {
            ReconcileEvent::Job(job) => self.handle_job(job, &deadline).await,
            ReconcileEvent::Request(request) => self.handle_request(request, &deadline).await,
            ReconcileEvent::NoEvent => {
                info!("No scan request or job found (probably deleted)");
                Ok(ReconcileAction::Ignored)
            }
        };

        match outcome {
            Ok(action) => {
                info!(event = %kind, action = %action.description(), "Reconciled");
                Ok(ReconcileResult::new(key.clone(), kind, action))
            }
            Err(e) if e.is_retryable() => {
                debug!(event = %kind, error = %e, "Reconcile will be retried");
                Err(e)
            }
            Err(e) => {
                error!(event = %kind, error = %e, "Reconcile failed");
                Err(e)
            }
        }
    }

    async fn handle_job(
        &self,
        mut job: JobRecord,
        deadline: &Deadline,
    ) -> Result<ReconcileAction> {
        // deletion wins over everything else, even while the job runs
        if job.metadata.is_deleting() {
            return self.release_guard(job, deadline).await;
        }

        if !job.is_complete() {
            let changed = job.metadata.add_deletion_guard(DELETION_GUARD);
            if changed {
                deadline.run("update job", self.jobs.update_job(&job)).await?;
            }
            return Ok(ReconcileAction::GuardEnsured {
                job: job.key(),
                changed,
            });
        }

        self.consume_results(job, deadline).await
    }

    async fn release_guard(
        &self,
        mut job: JobRecord,
        deadline: &Deadline,
    ) -> Result<ReconcileAction> {
        let changed = job.metadata.remove_deletion_guard(DELETION_GUARD);
        if changed {
            deadline.run("update job", self.jobs.update_job(&job)).await?;
        }
        Ok(ReconcileAction::GuardReleased {
            job: job.key(),
            changed,
        })
    }

    async fn consume_results(
        &self,
        job: JobRecord,
        deadline: &Deadline,
    ) -> Result<ReconcileAction> {
        let Some(owner) = job.owner_request_name() else {
            let message = format!(
                "job missing {SCAN_REQUEST_KIND} owner reference {}:{}",
                job.metadata.namespace, job.metadata.name
            );
            warn!(job = %job.key(), "{message}");
            let emitted = deadline
                .run(
                    "emit event",
                    self.jobs
                        .emit_event(&job, EventSeverity::Warning, MISSING_OWNER_REASON, &message),
                )
                .await;
            if let Err(e) = emitted {
                debug!(error = %e, "Could not emit event");
            }
            return Ok(ReconcileAction::OwnerMissing { job: job.key() });
        };

        let request_key = ObjectKey::new(job.metadata.namespace.clone(), owner);
        let Some(mut request) = deadline
            .run("get scan request", self.requests.get_request(&request_key))
            .await?
        else {
            info!(request = %request_key, "Owning scan request no longer exists");
            let job_key = job.key();
            // nobody will read the results
            self.release_guard(job, deadline).await?;
            return Ok(ReconcileAction::OwnerGone {
                job: job_key,
                request: request_key,
            });
        };

        if !request.status.state.can_transition_to(ScanState::Complete) {
            debug!(state = %request.status.state, "Scan request already settled");
            return self.release_guard(job, deadline).await;
        }

        let dependencies = apply_job_outputs(&mut request, &job);
        deadline
            .run("update scan request status", self.requests.update_status(&request))
            .await?;

        // results are persisted, the job may go now
        self.release_guard(job, deadline).await?;

        Ok(ReconcileAction::ResultsRecorded {
            request: request_key,
            dependencies,
        })
    }

    async fn handle_request(
        &self,
        request: ScanRequest,
        deadline: &Deadline,
    ) -> Result<ReconcileAction> {
        match request.status.state {
            ScanState::New => self.handle_new(request, deadline).await,
            state => {
                debug!(%state, "Waiting on job events");
                Ok(ReconcileAction::Ignored)
            }
        }
    }

    async fn handle_new(
        &self,
        mut request: ScanRequest,
        deadline: &Deadline,
    ) -> Result<ReconcileAction> {
        let image = request.spec.image.clone();

        // the image ends up inside a quoted shell argument
        if image.contains('"') {
            let message = Error::invalid_image(&image).to_string();
            return self.fail(request, message, deadline).await;
        }

        let spec = match deadline
            .run("build job spec", self.builder.build(&image, self.resolver.as_ref()))
            .await
        {
            Ok(spec) => spec,
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                info!(image = %image, error = %e, "Building job spec failed");
                return self.fail(request, e.to_string(), deadline).await;
            }
        };

        let job = job_for_request(&request, spec);

        request.status.state = ScanState::Discovering;
        deadline
            .run("update scan request status", self.requests.update_status(&request))
            .await?;

        let request_key = request.key();
        match deadline.run("create job", self.jobs.create_job(&job)).await {
            Ok(created) => Ok(ReconcileAction::ScanStarted {
                request: request_key,
                job: Some(created.key()),
            }),
            Err(e) => {
                // TODO: requeue Discovering requests that have no job; nothing
                // redelivers this key, so the request is stuck until recreated
                warn!(error = %e, "Job creation failed after scan request entered Discovering");
                Ok(ReconcileAction::ScanStarted {
                    request: request_key,
                    job: None,
                })
            }
        }
    }

    async fn fail(
        &self,
        mut request: ScanRequest,
        message: String,
        deadline: &Deadline,
    ) -> Result<ReconcileAction> {
        request.status.state = ScanState::Failed;
        request.status.message.clone_from(&message);
        deadline
            .run("update scan request status", self.requests.update_status(&request))
            .await?;
        Ok(ReconcileAction::Rejected {
            request: request.key(),
            message,
        })
    }

    /// Get the configuration.
    pub const fn config(&self) -> &ReconcilerConfig {
        &self.config
    }
}

/// Build the job record that scans `request`'s image.
pub fn job_for_request(request: &ScanRequest, spec: JobSpec) -> JobRecord {
    let mut metadata = ObjectMeta {
        namespace: request.metadata.namespace.clone(),
        generate_name: Some(format!("{}{JOB_NAME_SUFFIX}", request.metadata.name)),
        labels: BTreeMap::from([(JOB_LABEL.to_string(), String::new())]),
        owner_references: vec![OwnerReference::new(
            SCAN_REQUEST_KIND,
            request.metadata.name.clone(),
        )],
        ..ObjectMeta::default()
    };
    metadata.add_deletion_guard(DELETION_GUARD);

    JobRecord {
        metadata,
        spec,
        status: JobStatus::default(),
    }
}

/// Copy a completed job's outputs onto its request and mark it complete.
///
/// A missing dependency output and an empty one both mean no dependencies.
/// Returns the number of recorded dependencies.
pub fn apply_job_outputs(request: &mut ScanRequest, job: &JobRecord) -> usize {
    if let Some(digest) = job.output(IMAGE_DIGEST_OUTPUT) {
        request.status.digest = digest.to_string();
    }
    request.status.results = match job.output(JVM_DEPENDENCIES_OUTPUT) {
        Some(raw) if !raw.is_empty() => parse_dependencies(raw),
        _ => Vec::new(),
    };
    request.status.state = ScanState::Complete;
    request.status.results.len()
}

/// Builder for Reconciler.
pub struct ReconcilerBuilder {
    requests: Option<Arc<dyn ScanRequestStore>>,
    jobs: Option<Arc<dyn JobStore>>,
    resolver: Option<Arc<dyn ImageNameResolver>>,
    config: ReconcilerConfig,
}

impl ReconcilerBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            requests: None,
            jobs: None,
            resolver: None,
            config: ReconcilerConfig::default(),
        }
    }

    /// Use one store for both resource kinds.
    #[must_use]
    pub fn with_store<S>(self, store: Arc<S>) -> Self
    where
        S: ScanRequestStore + JobStore + 'static,
    {
        self.with_request_store(store.clone()).with_job_store(store)
    }

    /// Set the scan request store.
    #[must_use]
    pub fn with_request_store(mut self, store: Arc<dyn ScanRequestStore>) -> Self {
        self.requests = Some(store);
        self
    }

    /// Set the job store.
    #[must_use]
    pub fn with_job_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.jobs = Some(store);
        self
    }

    /// Set a custom image resolver.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn ImageNameResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Set the configuration.
    #[must_use]
    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the per-reconcile deadline.
    #[must_use]
    pub const fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    /// Build the reconciler.
    ///
    /// Without an explicit resolver, images resolve from the environment and
    /// the configured defaults.
    pub fn build(self) -> Result<Reconciler> {
        self.config.validate()?;

        let requests = self
            .requests
            .ok_or_else(|| Error::invalid_config("Scan request store is required"))?;
        let jobs = self
            .jobs
            .ok_or_else(|| Error::invalid_config("Job store is required"))?;
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(EnvImageResolver::new(self.config.images.clone())));

        Ok(Reconciler::new(requests, jobs, resolver, self.config))
    }
}

impl Default for ReconcilerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
