//! Resource types shared between the reconciler and its stores.
//!
//! The shapes mirror the two resource kinds the controller watches: the
//! user-facing [`ScanRequest`] and the [`JobRecord`] that performs the scan.
//! Both carry an [`ObjectMeta`] with a monotonically increasing
//! `resource_version` used for conditional writes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::JobSpec;

/// Kind recorded on owner references that point at scan requests.
pub const SCAN_REQUEST_KIND: &str = "JvmImageScan";

/// Plural form accepted when matching owner references.
pub const SCAN_REQUEST_KIND_PLURAL: &str = "JvmImageScans";

/// Kind of the job records created for scan requests.
pub const JOB_KIND: &str = "PipelineRun";

/// Namespaced name shared by both resource kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    /// Create a key from a namespace and a name.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Weak back-reference from a dependent resource to the resource that created it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
}

impl OwnerReference {
    /// Create an owner reference.
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Whether this reference points at the given kind, ignoring case and
    /// accepting the plural spelling.
    pub fn is_kind(&self, singular: &str, plural: &str) -> bool {
        self.kind.eq_ignore_ascii_case(singular) || self.kind.eq_ignore_ascii_case(plural)
    }
}

/// Metadata common to every stored resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    /// Prefix the store completes into a unique name on create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_name: Option<String>,
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
    /// Named markers that block garbage collection while present.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub deletion_guards: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// Create metadata for a named resource.
    pub fn named(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Key of the resource.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }

    /// Insert a deletion guard. Returns `true` if the set changed.
    pub fn add_deletion_guard(&mut self, guard: &str) -> bool {
        self.deletion_guards.insert(guard.to_string())
    }

    /// Remove a deletion guard. Returns `true` if the set changed.
    pub fn remove_deletion_guard(&mut self, guard: &str) -> bool {
        self.deletion_guards.remove(guard)
    }

    /// Whether the guard is currently present.
    pub fn has_deletion_guard(&self, guard: &str) -> bool {
        self.deletion_guards.contains(guard)
    }

    /// Whether deletion has been requested.
    pub const fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

/// Lifecycle of a scan request.
///
/// Advances `New -> Discovering -> {Complete | Failed}`; the last two are
/// absorbing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanState {
    /// Freshly created, no job yet. An empty state string reads as `New`.
    #[default]
    #[serde(rename = "JvmImageScanNew", alias = "")]
    New,
    /// A job has been requested and results are pending.
    #[serde(rename = "JvmImageScanDiscovering")]
    Discovering,
    /// Results have been recorded.
    #[serde(rename = "JvmImageScanComplete")]
    Complete,
    /// The request could not be processed; see the status message.
    #[serde(rename = "JvmImageScanFailed")]
    Failed,
}

impl ScanState {
    /// Check if this is a terminal state.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Check if transition to target state is valid.
    ///
    /// `New -> Complete` is allowed so that job results are never dropped
    /// when the job is observed before the `Discovering` write.
    pub const fn can_transition_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::New, Self::Discovering | Self::Complete | Self::Failed)
                | (Self::Discovering, Self::Complete | Self::Failed)
        )
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::New => "New",
            Self::Discovering => "Discovering",
            Self::Complete => "Complete",
            Self::Failed => "Failed",
        };
        write!(f, "{label}")
    }
}

/// One JVM dependency found in an image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRecord {
    /// `group:artifact:version` coordinate.
    #[serde(rename = "gav")]
    pub coordinate: String,
    /// Where the analyzer found the coordinate; `unknown` when not reported.
    pub source: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl DependencyRecord {
    /// Create a record without attributes.
    pub fn new(coordinate: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            coordinate: coordinate.into(),
            source: source.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Add an attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// User-supplied part of a scan request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequestSpec {
    pub image: String,
}

/// Controller-owned part of a scan request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequestStatus {
    #[serde(default)]
    pub state: ScanState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub digest: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<DependencyRecord>,
}

/// Declarative request to scan an image for JVM dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub metadata: ObjectMeta,
    pub spec: ScanRequestSpec,
    #[serde(default)]
    pub status: ScanRequestStatus,
}

impl ScanRequest {
    /// Create a new request for an image.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::named(namespace, name),
            spec: ScanRequestSpec {
                image: image.into(),
            },
            status: ScanRequestStatus::default(),
        }
    }

    /// Key of the request.
    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }
}

/// Executor-owned part of a job record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    /// Named string results reported by the final step.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
}

/// Record of an asynchronously executed scan job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub metadata: ObjectMeta,
    pub spec: JobSpec,
    #[serde(default)]
    pub status: JobStatus,
}

impl JobRecord {
    /// Key of the job.
    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }

    /// Whether the executor has finished the job.
    pub const fn is_complete(&self) -> bool {
        self.status.completion_time.is_some()
    }

    /// Name of the owning scan request, if one is referenced.
    pub fn owner_request_name(&self) -> Option<&str> {
        self.metadata
            .owner_references
            .iter()
            .find(|owner| owner.is_kind(SCAN_REQUEST_KIND, SCAN_REQUEST_KIND_PLURAL))
            .map(|owner| owner.name.as_str())
    }

    /// Look up a named output.
    pub fn output(&self, name: &str) -> Option<&str> {
        self.status.outputs.get(name).map(String::as_str)
    }
}

/// Severity of a diagnostic event attached to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSeverity {
    Normal,
    Warning,
}

impl fmt::Display for EventSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "Normal"),
            Self::Warning => write!(f, "Warning"),
        }
    }
}
