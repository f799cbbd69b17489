//! Error types for the sluice controller

use thiserror::Error;

/// Pod-template field a `PodSetUpdate` conflict can occur in.
///
/// The `Display` form matches the Kubernetes field names used in the
/// conflict messages surfaced on the Workload's `Finished` condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateField {
    /// Pod template labels
    Labels,
    /// Pod template annotations
    Annotations,
    /// Pod spec node selector
    NodeSelector,
}

impl std::fmt::Display for UpdateField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Labels => write!(f, "labels"),
            Self::Annotations => write!(f, "annotations"),
            Self::NodeSelector => write!(f, "nodeSelector"),
        }
    }
}

/// Main error type for sluice operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An admitted Workload no longer matches its job; it was deleted and
    /// the job suspended so the next tick can recreate a matching one.
    #[error("no matching workloads")]
    NoMatchingWorkloads,

    /// More than one non-finished Workload was owned by a job; the extras
    /// were deleted.
    #[error("extra workloads")]
    ExtraWorkloads,

    /// A child job declares a parent workload but carries no controller
    /// owner reference.
    #[error("owner of the child job is not found")]
    ChildJobOwnerNotFound,

    /// A child job's controller owner is not a recognized workload-owning
    /// kind.
    #[error("unknown workload owner")]
    UnknownWorkloadOwner,

    /// A referenced priority class object does not exist.
    #[error("priority class {0:?} not found")]
    PriorityClassNotFound(String),

    /// A `PodSetUpdate` tried to change a key that already carries a
    /// different value.
    #[error(
        "invalid admission check PodSetUpdate: conflict for {field}: \
         conflict for key={key}, value1={value1}, value2={value2}"
    )]
    InvalidPodSetUpdate {
        /// Field the conflicting key belongs to
        field: UpdateField,
        /// The conflicting key
        key: String,
        /// Value already in place when the conflict was detected
        value1: String,
        /// Value the rejected update proposed
        value2: String,
    },

    /// A `PodSetUpdate` conflict attributed to the admission check whose
    /// proposals were being folded in when it surfaced.
    #[error("in admission check {check:?}: {source}")]
    AdmissionCheckConflict {
        /// Name of the admission check being merged
        check: String,
        /// The underlying conflict
        #[source]
        source: Box<Error>,
    },

    /// A resume was attempted with the wrong number of `PodSetInfo` entries.
    #[error("invalid number of pod set infos: expecting {want}, got {got}")]
    InvalidPodSetInfoCount {
        /// Number of pod sets the job declares
        want: usize,
        /// Number of infos supplied
        got: usize,
    },
}

impl Error {
    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a pod-set update conflict for the given field and key.
    pub fn pod_set_update_conflict(
        field: UpdateField,
        key: impl Into<String>,
        value1: impl Into<String>,
        value2: impl Into<String>,
    ) -> Self {
        Self::InvalidPodSetUpdate {
            field,
            key: key.into(),
            value1: value1.into(),
            value2: value2.into(),
        }
    }

    /// Attribute an error to the named admission check.
    pub fn in_admission_check(check: impl Into<String>, source: Error) -> Self {
        Self::AdmissionCheckConflict {
            check: check.into(),
            source: Box::new(source),
        }
    }

    /// True for a pod-set update conflict, including one attributed to an
    /// admission check.
    pub fn is_invalid_pod_set_update(&self) -> bool {
        match self {
            Self::InvalidPodSetUpdate { .. } => true,
            Self::AdmissionCheckConflict { source, .. } => source.is_invalid_pod_set_update(),
            _ => false,
        }
    }

    /// True when a resume was attempted with a malformed `PodSetInfo` list.
    pub fn is_invalid_pod_set_info(&self) -> bool {
        matches!(self, Self::InvalidPodSetInfoCount { .. })
    }

    /// True for the terminal class of errors that finish a Workload with
    /// reason `FailedToStart` instead of being retried.
    pub fn is_failed_to_start(&self) -> bool {
        self.is_invalid_pod_set_update() || self.is_invalid_pod_set_info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Error Surfaces of the Reconciliation Loop
    // ==========================================================================
    //
    // These tests pin the exact wording of the conflict messages, which are
    // part of the observable surface (they land in the Workload's Finished
    // condition), and the categorization helpers the reconciler relies on.

    /// Story: Two admission checks disagree on a pod label
    ///
    /// The conflict names the check being folded in, the field, the key and
    /// both values, so an operator can tell which check to fix.
    #[test]
    fn story_cross_check_conflict_message_names_the_check() {
        let err = Error::in_admission_check(
            "check2",
            Error::pod_set_update_conflict(UpdateField::Labels, "ac-key", "ac-value1", "ac-value2"),
        );
        assert_eq!(
            err.to_string(),
            "in admission check \"check2\": invalid admission check PodSetUpdate: \
             conflict for labels: conflict for key=ac-key, value1=ac-value1, value2=ac-value2"
        );
        assert!(err.is_invalid_pod_set_update());
        assert!(err.is_failed_to_start());
    }

    /// Story: An admission check collides with the job's own node selector
    ///
    /// The template conflict carries no check prefix: the offending value is
    /// already on the job, not attributable to one check among several.
    #[test]
    fn story_template_conflict_message_has_no_check_prefix() {
        let err = Error::pod_set_update_conflict(
            UpdateField::NodeSelector,
            "provisioning",
            "on-demand",
            "spot",
        );
        assert_eq!(
            err.to_string(),
            "invalid admission check PodSetUpdate: conflict for nodeSelector: \
             conflict for key=provisioning, value1=on-demand, value2=spot"
        );
    }

    /// Story: A resume with the wrong number of infos is terminal
    ///
    /// Length mismatches are a controller bug or a stale Workload, never
    /// something a retry fixes; they finish the Workload as FailedToStart.
    #[test]
    fn story_bad_info_count_is_terminal() {
        let err = Error::InvalidPodSetInfoCount { want: 1, got: 0 };
        assert_eq!(
            err.to_string(),
            "invalid number of pod set infos: expecting 1, got 0"
        );
        assert!(err.is_invalid_pod_set_info());
        assert!(err.is_failed_to_start());
        assert!(!err.is_invalid_pod_set_update());
    }

    /// Story: Semantic errors are sentinels compared by shape
    ///
    /// The caller matches on the variant, never on the message text.
    #[test]
    fn story_semantic_errors_are_matched_by_variant() {
        assert!(matches!(Error::NoMatchingWorkloads, Error::NoMatchingWorkloads));
        assert!(matches!(Error::ExtraWorkloads, Error::ExtraWorkloads));
        assert!(matches!(Error::ChildJobOwnerNotFound, Error::ChildJobOwnerNotFound));
        assert!(matches!(Error::UnknownWorkloadOwner, Error::UnknownWorkloadOwner));
        assert!(!Error::NoMatchingWorkloads.is_failed_to_start());
    }

    /// Story: Field names in conflict messages use the Kubernetes spelling
    #[test]
    fn story_update_fields_display_like_kubernetes_fields() {
        assert_eq!(UpdateField::Labels.to_string(), "labels");
        assert_eq!(UpdateField::Annotations.to_string(), "annotations");
        assert_eq!(UpdateField::NodeSelector.to_string(), "nodeSelector");
    }
}
