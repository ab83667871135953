//! End-to-end reconcile flows against the in-memory store.
//!
//! Each test drives the reconciler the way the watch layer would: by
//! delivering keys after every mutation and checking the stored resources.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use jvmscan_reconciler::{
    DELETION_GUARD, DependencyRecord, EnvImageResolver, Error, EventKind, EventSeverity,
    InMemoryStore, JobRecord, JobStore, ObjectKey, ObjectMeta, OwnerReference, PullPolicy,
    ReconcileAction, Reconciler, Result, ScanRequest, ScanRequestStore, ScanState,
};

const ANALYZER: &str = "registry/analyzer:1";

fn resolver() -> Arc<EnvImageResolver> {
    Arc::new(EnvImageResolver::with_lookup(
        BTreeMap::from([("build-request-processor".to_string(), ANALYZER.to_string())]),
        |_| None,
    ))
}

fn reconciler_for(store: Arc<InMemoryStore>) -> Reconciler {
    Reconciler::builder()
        .with_store(store)
        .with_resolver(resolver())
        .build()
        .expect("reconciler should build")
}

fn request_in_state(name: &str, image: &str, state: ScanState) -> ScanRequest {
    let mut request = ScanRequest::new("ns", name, image);
    request.status.state = state;
    request
}

fn owned_job(name: &str, owner: &str) -> JobRecord {
    let mut metadata = ObjectMeta::named("ns", name);
    metadata
        .owner_references
        .push(OwnerReference::new("JvmImageScan", owner));
    JobRecord {
        metadata,
        ..JobRecord::default()
    }
}

fn outputs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

#[tokio::test]
async fn test_scan_lifecycle_end_to_end() {
    let store = InMemoryStore::new_arc();
    let reconciler = reconciler_for(store.clone());
    let request_key = store
        .insert_request(ScanRequest::new("ns", "scan", "registry/foo:dev"))
        .await
        .key();

    // new request -> job created, request discovering
    let result = reconciler.reconcile(&request_key).await.unwrap();
    assert_eq!(result.event, EventKind::Request);
    let job_key = match result.action {
        ReconcileAction::ScanStarted { job: Some(job), .. } => job,
        other => panic!("unexpected action: {other:?}"),
    };
    let request = store.request(&request_key).await.unwrap();
    assert_eq!(request.status.state, ScanState::Discovering);

    let job = store.job(&job_key).await.unwrap();
    assert!(job.metadata.name.starts_with("scan-image-discovery-"));
    assert!(job.metadata.has_deletion_guard(DELETION_GUARD));
    assert_eq!(job.owner_request_name(), Some("scan"));
    assert!(
        job.spec
            .steps
            .iter()
            .all(|step| step.image_pull_policy == PullPolicy::Always)
    );

    // job event while running keeps the single guard
    let result = reconciler.reconcile(&job_key).await.unwrap();
    assert_eq!(
        result.action,
        ReconcileAction::GuardEnsured {
            job: job_key.clone(),
            changed: false
        }
    );

    // executor finishes
    store
        .complete_job(
            &job_key,
            outputs(&[
                ("JVM_DEPENDENCIES", "g:a:1;maven"),
                ("IMAGE_DIGEST", "sha256:abc"),
            ]),
        )
        .await
        .unwrap();

    let result = reconciler.reconcile(&job_key).await.unwrap();
    assert_eq!(
        result.action,
        ReconcileAction::ResultsRecorded {
            request: request_key.clone(),
            dependencies: 1
        }
    );

    let request = store.request(&request_key).await.unwrap();
    assert_eq!(request.status.state, ScanState::Complete);
    assert_eq!(request.status.digest, "sha256:abc");
    assert_eq!(
        request.status.results,
        vec![DependencyRecord::new("g:a:1", "maven")]
    );

    // results consumed, guard gone
    let job = store.job(&job_key).await.unwrap();
    assert!(job.metadata.deletion_guards.is_empty());

    // redelivery changes nothing
    let writes = store.status_writes();
    let result = reconciler.reconcile(&job_key).await.unwrap();
    assert_eq!(
        result.action,
        ReconcileAction::GuardReleased {
            job: job_key,
            changed: false
        }
    );
    assert_eq!(store.status_writes(), writes);

    // redelivered request event is a no-op as well
    let result = reconciler.reconcile(&request_key).await.unwrap();
    assert_eq!(result.action, ReconcileAction::Ignored);
    assert_eq!(store.jobs().await.len(), 1);
}

#[tokio::test]
async fn test_request_past_new_is_noop() {
    for state in [ScanState::Discovering, ScanState::Complete, ScanState::Failed] {
        let store = InMemoryStore::new_arc();
        let reconciler = reconciler_for(store.clone());
        let key = store
            .insert_request(request_in_state("scan", "registry/foo:1", state))
            .await
            .key();

        let result = reconciler.reconcile(&key).await.unwrap();
        assert_eq!(result.action, ReconcileAction::Ignored);
        assert_eq!(store.status_writes(), 0, "state {state} must not be written");
        assert!(store.jobs().await.is_empty());
        assert_eq!(store.request(&key).await.unwrap().status.state, state);
    }
}

#[tokio::test]
async fn test_quoted_image_fails_without_job() {
    let store = InMemoryStore::new_arc();
    let reconciler = reconciler_for(store.clone());
    let key = store
        .insert_request(ScanRequest::new("ns", "scan", "foo\"; rm -rf /"))
        .await
        .key();

    let result = reconciler.reconcile(&key).await.unwrap();
    assert!(matches!(result.action, ReconcileAction::Rejected { .. }));

    let request = store.request(&key).await.unwrap();
    assert_eq!(request.status.state, ScanState::Failed);
    assert_eq!(request.status.message, "invalid image name foo\"; rm -rf /");
    assert!(store.jobs().await.is_empty());

    // terminal: redelivery does nothing
    reconciler.reconcile(&key).await.unwrap();
    assert_eq!(store.status_writes(), 1);
    assert!(store.jobs().await.is_empty());
}

#[tokio::test]
async fn test_unresolvable_analyzer_image_fails_request() {
    let store = InMemoryStore::new_arc();
    let reconciler = Reconciler::builder()
        .with_store(store.clone())
        .with_resolver(Arc::new(EnvImageResolver::with_lookup(
            BTreeMap::new(),
            |_| None,
        )))
        .build()
        .unwrap();
    let key = store
        .insert_request(ScanRequest::new("ns", "scan", "registry/foo:1"))
        .await
        .key();

    reconciler.reconcile(&key).await.unwrap();

    let request = store.request(&key).await.unwrap();
    assert_eq!(request.status.state, ScanState::Failed);
    assert!(request.status.message.contains("build-request-processor"));
    assert!(store.jobs().await.is_empty());
}

#[tokio::test]
async fn test_incomplete_job_guard_added_once() {
    let store = InMemoryStore::new_arc();
    let reconciler = reconciler_for(store.clone());
    let key = store.insert_job(owned_job("job", "scan")).await.key();

    for _ in 0..3 {
        let result = reconciler.reconcile(&key).await.unwrap();
        assert_eq!(result.event, EventKind::Job);
    }

    let job = store.job(&key).await.unwrap();
    assert_eq!(job.metadata.deletion_guards.len(), 1);
    assert!(job.metadata.has_deletion_guard(DELETION_GUARD));
    assert_eq!(store.job_writes(), 1);
}

#[tokio::test]
async fn test_deleted_job_releases_guard() {
    let store = InMemoryStore::new_arc();
    let reconciler = reconciler_for(store.clone());
    let mut job = owned_job("job", "scan");
    job.metadata.add_deletion_guard(DELETION_GUARD);
    let key = store.insert_job(job).await.key();

    store.delete_job(&key).await.unwrap();
    assert!(store.job(&key).await.is_some());

    let result = reconciler.reconcile(&key).await.unwrap();
    assert_eq!(
        result.action,
        ReconcileAction::GuardReleased {
            job: key.clone(),
            changed: true
        }
    );
    assert!(store.job(&key).await.is_none());

    let result = reconciler.reconcile(&key).await.unwrap();
    assert_eq!(result.event, EventKind::None);
    assert_eq!(result.action, ReconcileAction::Ignored);
}

#[tokio::test]
async fn test_deletion_takes_precedence_over_completion() {
    let store = InMemoryStore::new_arc();
    let reconciler = reconciler_for(store.clone());
    let request_key = store
        .insert_request(request_in_state("scan", "img", ScanState::Discovering))
        .await
        .key();
    let mut job = owned_job("job", "scan");
    job.metadata.add_deletion_guard(DELETION_GUARD);
    let key = store.insert_job(job).await.key();
    store
        .complete_job(&key, outputs(&[("JVM_DEPENDENCIES", "g:a:1;maven")]))
        .await
        .unwrap();
    store.delete_job(&key).await.unwrap();

    reconciler.reconcile(&key).await.unwrap();

    assert_eq!(store.status_writes(), 0);
    assert_eq!(
        store.request(&request_key).await.unwrap().status.state,
        ScanState::Discovering
    );
}

#[tokio::test]
async fn test_completed_job_without_owner_is_reported_not_applied() {
    let store = InMemoryStore::new_arc();
    let reconciler = reconciler_for(store.clone());
    store
        .insert_request(request_in_state("scan", "img", ScanState::Discovering))
        .await;

    let mut job = JobRecord {
        metadata: ObjectMeta::named("ns", "stray"),
        ..JobRecord::default()
    };
    job.metadata
        .owner_references
        .push(OwnerReference::new("Deployment", "scan"));
    job.metadata.add_deletion_guard(DELETION_GUARD);
    let key = store.insert_job(job).await.key();
    store
        .complete_job(&key, outputs(&[("JVM_DEPENDENCIES", "g:a:1;maven")]))
        .await
        .unwrap();

    let result = reconciler.reconcile(&key).await.unwrap();
    assert_eq!(result.action, ReconcileAction::OwnerMissing { job: key.clone() });

    assert_eq!(store.status_writes(), 0);
    assert_eq!(store.job_writes(), 0);
    let events = store.events().await;
    assert_eq!(events.len(), 1);
    let event = events.first().unwrap();
    assert_eq!(event.key, key);
    assert_eq!(event.severity, EventSeverity::Warning);
    assert_eq!(event.reason, "MissingOwner");
    assert!(event.message.contains("ns:stray"));
}

#[tokio::test]
async fn test_completed_job_with_deleted_owner_releases_guard() {
    let store = InMemoryStore::new_arc();
    let reconciler = reconciler_for(store.clone());
    let mut job = owned_job("job", "gone");
    job.metadata.add_deletion_guard(DELETION_GUARD);
    let key = store.insert_job(job).await.key();
    store.complete_job(&key, BTreeMap::new()).await.unwrap();

    let result = reconciler.reconcile(&key).await.unwrap();
    assert_eq!(
        result.action,
        ReconcileAction::OwnerGone {
            job: key.clone(),
            request: ObjectKey::new("ns", "gone")
        }
    );
    assert_eq!(store.status_writes(), 0);
    assert!(store.job(&key).await.unwrap().metadata.deletion_guards.is_empty());

    // once unguarded, deletion is immediate
    store.delete_job(&key).await.unwrap();
    assert!(store.job(&key).await.is_none());
}

#[tokio::test]
async fn test_completed_job_without_outputs_completes_empty() {
    let store = InMemoryStore::new_arc();
    let reconciler = reconciler_for(store.clone());
    let request_key = store
        .insert_request(request_in_state("scan", "img", ScanState::Discovering))
        .await
        .key();
    let key = store.insert_job(owned_job("job", "scan")).await.key();
    store.complete_job(&key, BTreeMap::new()).await.unwrap();

    reconciler.reconcile(&key).await.unwrap();

    let request = store.request(&request_key).await.unwrap();
    assert_eq!(request.status.state, ScanState::Complete);
    assert!(request.status.results.is_empty());
    assert!(request.status.digest.is_empty());
}

#[tokio::test]
async fn test_settled_request_is_not_rewritten() {
    let store = InMemoryStore::new_arc();
    let reconciler = reconciler_for(store.clone());
    let mut request = request_in_state("scan", "img", ScanState::Failed);
    request.status.message = "earlier failure".to_string();
    let request_key = store.insert_request(request).await.key();

    let mut job = owned_job("job", "scan");
    job.metadata.add_deletion_guard(DELETION_GUARD);
    let key = store.insert_job(job).await.key();
    store
        .complete_job(&key, outputs(&[("JVM_DEPENDENCIES", "g:a:1;maven")]))
        .await
        .unwrap();

    reconciler.reconcile(&key).await.unwrap();

    assert_eq!(store.status_writes(), 0);
    let request = store.request(&request_key).await.unwrap();
    assert_eq!(request.status.state, ScanState::Failed);
    assert!(store.job(&key).await.unwrap().metadata.deletion_guards.is_empty());
}

#[tokio::test]
async fn test_job_creation_failure_is_swallowed() {
    let store = InMemoryStore::new_arc();
    store.fail_creates(true);
    let reconciler = reconciler_for(store.clone());
    let key = store
        .insert_request(ScanRequest::new("ns", "scan", "registry/foo:1"))
        .await
        .key();

    let result = reconciler.reconcile(&key).await.unwrap();
    assert_eq!(
        result.action,
        ReconcileAction::ScanStarted {
            request: key.clone(),
            job: None
        }
    );
    assert_eq!(
        store.request(&key).await.unwrap().status.state,
        ScanState::Discovering
    );
    assert!(store.jobs().await.is_empty());

    // nothing recovers the request once it has left New
    store.fail_creates(false);
    let result = reconciler.reconcile(&key).await.unwrap();
    assert_eq!(result.action, ReconcileAction::Ignored);
    assert!(store.jobs().await.is_empty());
}

#[tokio::test]
async fn test_unknown_key_is_noop() {
    let store = InMemoryStore::new_arc();
    let reconciler = reconciler_for(store.clone());

    let result = reconciler
        .reconcile(&ObjectKey::new("ns", "missing"))
        .await
        .unwrap();
    assert_eq!(result.event, EventKind::None);
    assert_eq!(result.action, ReconcileAction::Ignored);
}

/// Store wrapper that injects a conflict on the first status write or the
/// first job update, and an optional delay on every request read.
struct FlakyStore {
    inner: Arc<InMemoryStore>,
    status_conflict_once: AtomicBool,
    job_conflict_once: AtomicBool,
    read_delay: Duration,
}

impl FlakyStore {
    fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            status_conflict_once: AtomicBool::new(false),
            job_conflict_once: AtomicBool::new(false),
            read_delay: Duration::ZERO,
        }
    }

    fn with_status_conflict(self) -> Self {
        self.status_conflict_once.store(true, Ordering::SeqCst);
        self
    }

    fn with_job_conflict(self) -> Self {
        self.job_conflict_once.store(true, Ordering::SeqCst);
        self
    }

    fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }
}

fn flaky_reconciler(store: FlakyStore) -> Reconciler {
    Reconciler::builder()
        .with_store(Arc::new(store))
        .with_resolver(resolver())
        .build()
        .expect("reconciler should build")
}

#[async_trait]
impl ScanRequestStore for FlakyStore {
    async fn get_request(&self, key: &ObjectKey) -> Result<Option<ScanRequest>> {
        tokio::time::sleep(self.read_delay).await;
        self.inner.get_request(key).await
    }

    async fn update_status(&self, request: &ScanRequest) -> Result<ScanRequest> {
        if self.status_conflict_once.swap(false, Ordering::SeqCst) {
            let version = request.metadata.resource_version;
            return Err(Error::conflict(
                "JvmImageScan",
                request.key().to_string(),
                version,
                version.saturating_add(1),
            ));
        }
        self.inner.update_status(request).await
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn get_job(&self, key: &ObjectKey) -> Result<Option<JobRecord>> {
        self.inner.get_job(key).await
    }

    async fn create_job(&self, job: &JobRecord) -> Result<JobRecord> {
        self.inner.create_job(job).await
    }

    async fn update_job(&self, job: &JobRecord) -> Result<JobRecord> {
        if self.job_conflict_once.swap(false, Ordering::SeqCst) {
            let version = job.metadata.resource_version;
            return Err(Error::conflict(
                "PipelineRun",
                job.key().to_string(),
                version,
                version.saturating_add(1),
            ));
        }
        self.inner.update_job(job).await
    }

    async fn emit_event(
        &self,
        job: &JobRecord,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        self.inner.emit_event(job, severity, reason, message).await
    }
}

#[tokio::test]
async fn test_conflict_is_retried_by_redelivery() {
    let inner = InMemoryStore::new_arc();
    let reconciler = flaky_reconciler(FlakyStore::new(inner.clone()).with_status_conflict());
    let key = inner
        .insert_request(ScanRequest::new("ns", "scan", "registry/foo:1"))
        .await
        .key();

    let err = reconciler.reconcile(&key).await.unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }));
    assert!(err.is_retryable());
    assert!(inner.jobs().await.is_empty(), "no job before the status write lands");

    let result = reconciler.reconcile(&key).await.unwrap();
    assert!(matches!(
        result.action,
        ReconcileAction::ScanStarted { job: Some(_), .. }
    ));
    assert_eq!(inner.jobs().await.len(), 1);
}

#[tokio::test]
async fn test_deadline_bounds_store_calls() {
    let inner = InMemoryStore::new_arc();
    let store = Arc::new(
        FlakyStore::new(inner.clone()).with_read_delay(Duration::from_millis(200)),
    );
    let reconciler = Reconciler::builder()
        .with_store(store)
        .with_resolver(resolver())
        .call_timeout(Duration::from_millis(20))
        .build()
        .unwrap();
    let key = inner
        .insert_request(ScanRequest::new("ns", "scan", "registry/foo:1"))
        .await
        .key();

    let err = reconciler.reconcile(&key).await.unwrap_err();
    assert!(matches!(err, Error::DeadlineExceeded { .. }));
    assert!(err.is_retryable());
    assert_eq!(inner.status_writes(), 0);
    assert!(inner.jobs().await.is_empty());
}

#[tokio::test]
async fn test_guard_insert_conflict_is_retried() {
    let inner = InMemoryStore::new_arc();
    let reconciler = flaky_reconciler(FlakyStore::new(inner.clone()).with_job_conflict());
    let key = inner.insert_job(owned_job("job", "scan")).await.key();

    let err = reconciler.reconcile(&key).await.unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }));
    assert!(err.is_retryable());
    assert!(inner.job(&key).await.unwrap().metadata.deletion_guards.is_empty());

    let result = reconciler.reconcile(&key).await.unwrap();
    assert_eq!(
        result.action,
        ReconcileAction::GuardEnsured {
            job: key.clone(),
            changed: true
        }
    );
    let job = inner.job(&key).await.unwrap();
    assert_eq!(job.metadata.deletion_guards.len(), 1);
    assert_eq!(inner.job_writes(), 1);
}

#[tokio::test]
async fn test_guard_release_conflict_after_results_is_retried() {
    let inner = InMemoryStore::new_arc();
    let reconciler = flaky_reconciler(FlakyStore::new(inner.clone()).with_job_conflict());
    let request_key = inner
        .insert_request(request_in_state("scan", "img", ScanState::Discovering))
        .await
        .key();
    let mut job = owned_job("job", "scan");
    job.metadata.add_deletion_guard(DELETION_GUARD);
    let key = inner.insert_job(job).await.key();
    inner
        .complete_job(
            &key,
            outputs(&[
                ("JVM_DEPENDENCIES", "g:a:1;maven"),
                ("IMAGE_DIGEST", "sha256:abc"),
            ]),
        )
        .await
        .unwrap();

    // results land, guard release loses the race
    let err = reconciler.reconcile(&key).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(inner.status_writes(), 1);
    assert!(inner.job(&key).await.unwrap().metadata.has_deletion_guard(DELETION_GUARD));
    let request = inner.request(&request_key).await.unwrap();
    assert_eq!(request.status.state, ScanState::Complete);

    // redelivery only finishes the release
    let result = reconciler.reconcile(&key).await.unwrap();
    assert_eq!(
        result.action,
        ReconcileAction::GuardReleased {
            job: key.clone(),
            changed: true
        }
    );
    assert_eq!(inner.status_writes(), 1);
    assert!(inner.job(&key).await.unwrap().metadata.deletion_guards.is_empty());
    assert_eq!(inner.request(&request_key).await.unwrap(), request);
}
