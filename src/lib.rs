//! Sluice - workload-queueing controller core for batch-style Kubernetes jobs
//!
//! Sluice gates batch jobs behind a queue: every queued job is mirrored into a
//! [`crd::Workload`] object, an external scheduler admits (or evicts) the
//! Workload, and the reconciler in this crate keeps the job's suspension state
//! consistent with that admission decision. Admission checks may attach
//! pod-template mutations that are merged and applied when the job resumes.
//!
//! # Architecture
//!
//! - A job is observed through the [`job::QueueableJob`] adapter contract, so
//!   heterogeneous job kinds share one reconciliation loop.
//! - Exactly one non-finished `Workload` exists per standalone job; it carries
//!   a controller-owned finalizer until its `Finished` condition is observed.
//! - Child jobs (spawned by a workload-owning parent) never own a `Workload`;
//!   their suspension follows the parent Workload's admission.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (Workload, WorkloadPriorityClass)
//! - [`podset`] - pod-set mutation values: merge, apply and restore
//! - [`job`] - the job adapter contract and the bundled batch/v1 adapter
//! - [`controller`] - the job↔workload reconciliation state machine
//! - [`events`] - Kubernetes Event publishing
//! - [`error`] - error types for the controller

#![deny(missing_docs)]

pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod job;
pub mod podset;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Well-known keys
// =============================================================================
// Every label, annotation and finalizer the controller reads or writes lives
// under the sluice.dev domain. Centralizing them here keeps the CRDs, the
// reconciler and the test fixtures in agreement.

/// Label (with annotation fallback) naming the queue a job is submitted to.
///
/// A standalone job without this key is ignored unless the controller runs
/// with `manage_jobs_without_queue_name`.
pub const QUEUE_NAME_LABEL: &str = "sluice.dev/queue-name";

/// Label referencing a [`crd::WorkloadPriorityClass`] by name.
///
/// Takes precedence over the pod-level priority class when the Workload's
/// priority is resolved.
pub const WORKLOAD_PRIORITY_CLASS_LABEL: &str = "sluice.dev/priority-class";

/// Label stamped on owned Workloads with the job's UID.
///
/// Omitted (without error) when the UID exceeds [`LABEL_VALUE_MAX_LEN`].
pub const JOB_UID_LABEL: &str = "sluice.dev/job-uid";

/// Annotation marking a job as the child of a named parent Workload.
pub const PARENT_WORKLOAD_ANNOTATION: &str = "sluice.dev/parent-workload";

/// Annotation enabling partial admission with the given minimum parallelism.
pub const JOB_MIN_PARALLELISM_ANNOTATION: &str = "sluice.dev/job-min-parallelism";

/// Finalizer held on every owned Workload from creation until the `Finished`
/// condition is observed.
pub const RESOURCE_IN_USE_FINALIZER: &str = "sluice.dev/resource-in-use";

/// Priority source tag recorded when the priority came from a
/// [`crd::WorkloadPriorityClass`].
pub const WORKLOAD_PRIORITY_CLASS_SOURCE: &str = "sluice.dev/workloadpriorityclass";

/// Priority source tag recorded when the priority came from the pod
/// template's scheduling priority class.
pub const POD_PRIORITY_CLASS_SOURCE: &str = "scheduling.k8s.io/priorityclass";

/// Pod-set name used by single-template job kinds.
pub const DEFAULT_POD_SET_NAME: &str = "main";

/// Maximum length of a Kubernetes label value.
pub const LABEL_VALUE_MAX_LEN: usize = 63;
