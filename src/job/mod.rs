//! Job adapter contract
//!
//! The reconciler interacts with every job kind through the fixed capability
//! set of [`QueueableJob`]. Adapters are resolved per kind at registration
//! time; the crate bundles [`batch::BatchJob`] for `batch/v1` Jobs.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

use crate::crd::PodSet;
use crate::podset::PodSetInfo;
use crate::Result;
use crate::{
    JOB_MIN_PARALLELISM_ANNOTATION, PARENT_WORKLOAD_ANNOTATION, QUEUE_NAME_LABEL,
    WORKLOAD_PRIORITY_CLASS_LABEL,
};

pub mod batch;

/// Terminal outcome reported by a finished job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobOutcome {
    /// True when the job completed successfully, false when it failed
    pub succeeded: bool,

    /// Human-readable message for the Workload's `Finished` condition
    pub message: String,
}

/// Uniform view over heterogeneous job kinds.
///
/// The reconciler mutates a job only through [`suspend`](Self::suspend),
/// [`run_with_pod_set_infos`](Self::run_with_pod_set_infos) (and its inverse
/// [`restore_pod_set_infos`](Self::restore_pod_set_infos)) and
/// [`clear_start_time`](Self::clear_start_time); everything else is read-only
/// observation of the job's current state.
pub trait QueueableJob: Clone + Send + Sync + std::fmt::Debug + 'static {
    /// The underlying Kubernetes object this adapter wraps
    type Object: Clone + Send + Sync;

    /// Wrap a fetched object in the adapter
    fn from_object(object: Self::Object) -> Self;

    /// Borrow the underlying object (for writes back to the API server)
    fn object(&self) -> &Self::Object;

    /// The job's object metadata (identity, labels, annotations, owners)
    fn metadata(&self) -> &ObjectMeta;

    /// Controller owner reference pointing at this job, for owned Workloads
    fn owner_reference(&self) -> OwnerReference;

    /// True while the job is suspended
    fn is_suspended(&self) -> bool;

    /// Suspend the job
    fn suspend(&mut self);

    /// Unsuspend the job, applying one [`PodSetInfo`] per pod set.
    ///
    /// The info list must be parallel to [`pod_sets`](Self::pod_sets); a
    /// length mismatch fails with
    /// [`Error::InvalidPodSetInfoCount`](crate::Error::InvalidPodSetInfoCount).
    /// The count override is honored only when the job declares
    /// partial-admission support.
    fn run_with_pod_set_infos(&mut self, infos: &[PodSetInfo]) -> Result<()>;

    /// Undo a previous resume, re-seating templates and counts from the
    /// given originals. Returns true when anything changed.
    fn restore_pod_set_infos(&mut self, infos: &[PodSetInfo]) -> bool;

    /// Ordered pod sets projected from the job's replica structure
    fn pod_sets(&self) -> Vec<PodSet>;

    /// True when enough pods are ready (or already succeeded) for the job
    /// to be considered started
    fn pods_ready(&self) -> bool;

    /// True while any of the job's pods are active
    fn is_active(&self) -> bool;

    /// The job's terminal outcome, once it has one
    fn finished(&self) -> Option<JobOutcome>;

    /// Pod-level priority class, resolved by a job-kind-specific rule (for
    /// multi-replica-type kinds: scan the canonical replica ordering and
    /// return the first non-empty class)
    fn priority_class(&self) -> Option<String>;

    /// Clear the job's recorded start time. Returns true when it was set,
    /// so the caller can skip the status write otherwise.
    fn clear_start_time(&mut self) -> bool;
}

/// Queue the job was submitted to, from the queue-name label with an
/// annotation fallback.
pub fn queue_name(meta: &ObjectMeta) -> Option<&str> {
    meta.labels
        .as_ref()
        .and_then(|l| l.get(QUEUE_NAME_LABEL))
        .or_else(|| meta.annotations.as_ref().and_then(|a| a.get(QUEUE_NAME_LABEL)))
        .map(String::as_str)
}

/// Parent Workload name for a child job, from the parent-workload annotation.
pub fn parent_workload_name(meta: &ObjectMeta) -> Option<&str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(PARENT_WORKLOAD_ANNOTATION))
        .map(String::as_str)
}

/// Referenced WorkloadPriorityClass name, from the priority-class label.
pub fn workload_priority_class_name(meta: &ObjectMeta) -> Option<&str> {
    meta.labels
        .as_ref()
        .and_then(|l| l.get(WORKLOAD_PRIORITY_CLASS_LABEL))
        .map(String::as_str)
}

/// Partial-admission minimum, from the min-parallelism annotation.
///
/// Presence of a positive integer enables the min-count projection; anything
/// else reads as "partial admission disabled".
pub fn min_parallelism(meta: &ObjectMeta) -> Option<i32> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(JOB_MIN_PARALLELISM_ANNOTATION))
        .and_then(|v| v.parse::<i32>().ok())
        .filter(|v| *v > 0)
}

/// The controller owner reference of an object, if any.
pub fn controller_owner(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_ref()
        .and_then(|refs| refs.iter().find(|r| r.controller == Some(true)))
}
