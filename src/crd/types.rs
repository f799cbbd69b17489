//! Shared status and pod-set types for the sluice CRDs

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type set by the external scheduler when a Workload's quota
/// reservation is complete and all admission checks are Ready.
pub const CONDITION_ADMITTED: &str = "Admitted";

/// Condition type set by the external scheduler when a Workload is preempted.
pub const CONDITION_EVICTED: &str = "Evicted";

/// Condition type set by this controller when a Workload reaches a terminal
/// state.
pub const CONDITION_FINISHED: &str = "Finished";

/// `Finished` reason used when the job ran to a terminal condition.
pub const REASON_JOB_FINISHED: &str = "JobFinished";

/// `Finished` reason used when conflicting admission-check proposals (or a
/// malformed resume) prevented the job from ever starting.
pub const REASON_FAILED_TO_START: &str = "FailedToStart";

/// Status of a condition (True, False, Unknown)
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
///
/// This type follows Kubernetes API conventions and is used for the
/// Workload's `Admitted`, `Evicted` and `Finished` conditions.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g. Admitted, Evicted, Finished)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// One group of identical pods within a job, projected into its Workload.
///
/// The pod-set list of a Workload is immutable once created; a job mutation
/// that would change it forces deletion and recreation of the Workload.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodSet {
    /// Pod-set name (unique within the Workload)
    pub name: String,

    /// Deep copy of the job's pod template at projection time
    pub template: PodTemplateSpec,

    /// Desired replica count
    pub count: i32,

    /// Minimum acceptable replica count when partial admission is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_count: Option<i32>,
}

/// Per-pod-set slice of a quota reservation.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodSetAssignment {
    /// Name of the pod set this assignment is for
    pub name: String,

    /// Number of pods the reservation covers; defaults to the pod set's
    /// declared count when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i32>,
}

/// Quota reservation written by the external scheduler.
///
/// Opaque to this controller apart from the per-pod-set assignment counts,
/// which drive partial admission.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuotaReservation {
    /// Name of the cluster queue the quota was reserved in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_queue: Option<String>,

    /// Per-pod-set assignments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pod_set_assignments: Vec<PodSetAssignment>,
}

/// State of a single admission check's opinion about a Workload.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CheckState {
    /// The check has not decided yet
    #[default]
    Pending,
    /// The check allows the Workload to run
    Ready,
    /// The check asks for the Workload to be retried later
    Retry,
    /// The check permanently rejects the Workload
    Rejected,
}

/// Additive pod-template mutations proposed by one admission check for one
/// pod set.
///
/// All `Ready` checks' updates are merged before the job resumes; any two
/// checks proposing the same key must agree on its value.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodSetUpdate {
    /// Name of the pod set the update applies to
    pub name: String,

    /// Labels to add to the pod template
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Annotations to add to the pod template
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Node-selector entries to add to the pod spec
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
}

/// One admission check's opinion, embedded in the Workload status.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionCheckState {
    /// Admission check name
    pub name: String,

    /// Current state of the check
    #[serde(default)]
    pub state: CheckState,

    /// Pod-template mutations the check demands before the job may start
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pod_set_updates: Vec<PodSetUpdate>,
}
