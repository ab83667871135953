//! K8s-style reconciler for JVM image scan requests.
//!
//! A scan request asks for the JVM dependencies embedded in a container
//! image. The reconciler turns it into a two-step job, waits for the job to
//! finish, and writes the parsed results back to the request's status.
//!
//! # Key Concepts
//!
//! ## Dual-trigger dispatch
//!
//! Requests and jobs share one key space. Each delivered key is looked up as
//! both kinds and classified as a [`ReconcileEvent`]:
//!
//! - `Request` in state `New` - build the job spec, move the request to
//!   `Discovering`, create the job
//! - `Job` being deleted - release its deletion guard
//! - `Job` still running - make sure the deletion guard is present
//! - `Job` complete - find the owning request through its owner reference,
//!   parse the outputs into the request status, release the guard
//!
//! ## Statelessness
//!
//! Nothing is cached between calls. Every reconcile re-reads both resources
//! under a single [`Deadline`], so redelivered or reordered events converge
//! to the same result.
//!
//! # Example
//!
//! ```ignore
//! use jvmscan_reconciler::{InMemoryStore, ObjectKey, Reconciler, ScanRequest};
//!
//! #[tokio::main]
//! async fn main() -> jvmscan_reconciler::Result<()> {
//!     let store = InMemoryStore::new_arc();
//!     store.insert_request(ScanRequest::new("ns", "scan", "registry/app:1.0")).await;
//!
//!     let reconciler = Reconciler::builder().with_store(store.clone()).build()?;
//!     let result = reconciler.reconcile(&ObjectKey::new("ns", "scan")).await?;
//!     println!("{}", result.action.description());
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod config;
pub mod deadline;
pub mod error;
pub mod event;
pub mod memory;
pub mod parser;
pub mod pipeline;
pub mod reconciler;
pub mod resolver;
pub mod store;
pub mod types;

// Re-export main types
pub use config::{MAX_CALL_TIMEOUT, PipelineConfig, ReconcilerConfig};
pub use deadline::Deadline;
pub use error::{Error, Result};
pub use event::{EventKind, ReconcileAction, ReconcileEvent, ReconcileResult};
pub use memory::{InMemoryStore, RecordedEvent};
pub use parser::parse_dependencies;
pub use pipeline::{
    IMAGE_DIGEST_OUTPUT, JVM_DEPENDENCIES_OUTPUT, JobSpec, JobSpecBuilder, PullPolicy,
};
pub use reconciler::{
    DELETION_GUARD, JOB_LABEL, Reconciler, ReconcilerBuilder, apply_job_outputs, job_for_request,
};
pub use resolver::{EnvImageResolver, ImageNameResolver};
pub use store::{JobStore, ScanRequestStore, TracingStore};
pub use types::{
    DependencyRecord, EventSeverity, JobRecord, JobStatus, ObjectKey, ObjectMeta,
    OwnerReference, ScanRequest, ScanState,
};
