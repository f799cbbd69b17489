//! Custom Resource Definitions for sluice
//!
//! - [`Workload`] - the queue-system's shadow object for one job's
//!   admission claim
//! - [`WorkloadPriorityClass`] - a named, numeric queueing priority
//! - shared condition and pod-set types in [`types`]

mod types;
mod workload;

pub use types::{
    AdmissionCheckState, CheckState, Condition, ConditionStatus, PodSet, PodSetAssignment,
    PodSetUpdate, QuotaReservation, CONDITION_ADMITTED, CONDITION_EVICTED, CONDITION_FINISHED,
    REASON_FAILED_TO_START, REASON_JOB_FINISHED,
};
pub use workload::{
    Workload, WorkloadPriorityClass, WorkloadPriorityClassSpec, WorkloadSpec, WorkloadStatus,
};
