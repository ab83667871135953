//! Classification of reconcile triggers and the actions taken for them.

use std::fmt;

use crate::types::{JobRecord, ObjectKey, ScanRequest};

/// What a delivered key turned out to refer to.
///
/// Both resource kinds share one key space, so each reconcile looks up both
/// and classifies the pair.
#[derive(Debug, Clone)]
pub enum ReconcileEvent {
    /// A job exists under the key. Takes precedence over a request.
    Job(JobRecord),
    /// Only a scan request exists under the key.
    Request(ScanRequest),
    /// Neither exists; both were deleted before the event was handled.
    NoEvent,
}

impl ReconcileEvent {
    /// Classify the result of the two lookups.
    pub fn classify(request: Option<ScanRequest>, job: Option<JobRecord>) -> Self {
        match (job, request) {
            (Some(job), _) => Self::Job(job),
            (None, Some(request)) => Self::Request(request),
            (None, None) => Self::NoEvent,
        }
    }

    /// Kind of the event, without its payload.
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Job(_) => EventKind::Job,
            Self::Request(_) => EventKind::Request,
            Self::NoEvent => EventKind::None,
        }
    }
}

/// Payload-free form of [`ReconcileEvent`], used for logging and results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Job,
    Request,
    None,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Job => write!(f, "job"),
            Self::Request => write!(f, "request"),
            Self::None => write!(f, "none"),
        }
    }
}

/// What a reconcile did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Nothing to do.
    Ignored,
    /// The deletion guard was removed from a job (or was already absent).
    GuardReleased { job: ObjectKey, changed: bool },
    /// An incomplete job carries the deletion guard.
    GuardEnsured { job: ObjectKey, changed: bool },
    /// A completed job has no scan request owner reference.
    OwnerMissing { job: ObjectKey },
    /// The owning scan request no longer exists; the job's guard was released.
    OwnerGone { job: ObjectKey, request: ObjectKey },
    /// Job outputs were written to the owning request.
    ResultsRecorded {
        request: ObjectKey,
        dependencies: usize,
    },
    /// The request was marked failed.
    Rejected { request: ObjectKey, message: String },
    /// The request moved to discovering; `job` is `None` when creation failed.
    ScanStarted {
        request: ObjectKey,
        job: Option<ObjectKey>,
    },
}

impl ReconcileAction {
    /// Get a description of the action.
    pub fn description(&self) -> String {
        match self {
            Self::Ignored => "no action".to_string(),
            Self::GuardReleased { job, changed } => {
                format!("release deletion guard on {job} (changed: {changed})")
            }
            Self::GuardEnsured { job, changed } => {
                format!("ensure deletion guard on {job} (changed: {changed})")
            }
            Self::OwnerMissing { job } => format!("job {job} has no scan request owner"),
            Self::OwnerGone { job, request } => {
                format!("owner {request} of job {job} no longer exists")
            }
            Self::ResultsRecorded {
                request,
                dependencies,
            } => format!("record {dependencies} dependencies on {request}"),
            Self::Rejected { request, message } => format!("fail {request}: {message}"),
            Self::ScanStarted { request, job } => match job {
                Some(job) => format!("start scan for {request} with job {job}"),
                None => format!("start scan for {request} without job"),
            },
        }
    }
}

/// Result of one reconcile.
#[derive(Debug, Clone)]
pub struct ReconcileResult {
    /// Key that was delivered.
    pub key: ObjectKey,
    /// How the key was classified.
    pub event: EventKind,
    /// What was done about it.
    pub action: ReconcileAction,
}

impl ReconcileResult {
    /// Create a new reconcile result.
    pub const fn new(key: ObjectKey, event: EventKind, action: ReconcileAction) -> Self {
        Self { key, event, action }
    }
}
