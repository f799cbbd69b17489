//! Workload Custom Resource Definition
//!
//! A Workload is the queue system's shadow object for one job's admission
//! claim. The job controller creates it when a job is queued, the external
//! scheduler admits or evicts it, and the job controller finishes it when
//! the job reaches a terminal state.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    AdmissionCheckState, CheckState, Condition, ConditionStatus, PodSet, QuotaReservation,
    CONDITION_ADMITTED, CONDITION_EVICTED, CONDITION_FINISHED,
};
use crate::RESOURCE_IN_USE_FINALIZER;

/// Specification for a Workload
///
/// The pod-set list is a deep-copied projection of the owning job's replica
/// structure and is immutable once created: when the job's pod sets change,
/// the Workload is deleted and recreated instead of updated.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "sluice.dev",
    version = "v1alpha1",
    kind = "Workload",
    plural = "workloads",
    shortname = "wl",
    status = "WorkloadStatus",
    namespaced,
    printcolumn = r#"{"name":"Queue","type":"string","jsonPath":".spec.queueName"}"#,
    printcolumn = r#"{"name":"Admitted","type":"boolean","jsonPath":".status.admitted"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    /// Name of the queue the owning job was submitted to
    pub queue_name: String,

    /// Numeric queueing priority (higher runs first)
    #[serde(default)]
    pub priority: i32,

    /// Name of the priority class the priority was resolved from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,

    /// Where the priority came from: a WorkloadPriorityClass, the pod
    /// template's priority class, or unset when no class was referenced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_source: Option<String>,

    /// Ordered pod sets projected from the owning job
    pub pod_sets: Vec<PodSet>,
}

/// Status for a Workload
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    /// Quota reservation written by the external scheduler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation: Option<QuotaReservation>,

    /// True once the scheduler has admitted the Workload
    #[serde(default)]
    pub admitted: bool,

    /// Admission-check opinions, in registration order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub admission_checks: Vec<AdmissionCheckState>,

    /// Conditions representing the Workload state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl WorkloadStatus {
    /// Set the reservation and return self for chaining
    pub fn reservation(mut self, reservation: QuotaReservation) -> Self {
        self.reservation = Some(reservation);
        self
    }

    /// Set the admitted flag and return self for chaining
    pub fn admitted(mut self, admitted: bool) -> Self {
        self.admitted = admitted;
        self
    }

    /// Add an admission-check state and return self for chaining
    pub fn check(mut self, check: AdmissionCheckState) -> Self {
        self.admission_checks.push(check);
        self
    }

    /// Add a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        // Remove existing condition of the same type
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
        self
    }
}

impl Workload {
    /// Look up a condition by type
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
            .iter()
            .find(|c| c.type_ == type_)
    }

    /// True when the given condition type is present with status True
    pub fn condition_is_true(&self, type_: &str) -> bool {
        self.condition(type_)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    /// True once the external scheduler has admitted this Workload
    pub fn is_admitted(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.admitted) || self.condition_is_true(CONDITION_ADMITTED)
    }

    /// True while the external scheduler holds this Workload evicted
    pub fn is_evicted(&self) -> bool {
        self.condition_is_true(CONDITION_EVICTED)
    }

    /// True once this Workload reached a terminal state
    pub fn is_finished(&self) -> bool {
        self.condition_is_true(CONDITION_FINISHED)
    }

    /// Reserved pod count for the named pod set, if the scheduler wrote one
    pub fn assignment_count(&self, pod_set: &str) -> Option<i32> {
        self.status
            .as_ref()
            .and_then(|s| s.reservation.as_ref())
            .and_then(|r| r.pod_set_assignments.iter().find(|a| a.name == pod_set))
            .and_then(|a| a.count)
    }

    /// Admission checks currently in the `Ready` state, in list order
    pub fn ready_checks(&self) -> impl Iterator<Item = &AdmissionCheckState> {
        self.status
            .as_ref()
            .map(|s| s.admission_checks.as_slice())
            .unwrap_or_default()
            .iter()
            .filter(|c| c.state == CheckState::Ready)
    }

    /// True while this Workload carries the controller's finalizer
    pub fn has_resource_in_use_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|x| x == RESOURCE_IN_USE_FINALIZER))
    }

    /// Set a condition, replacing any existing condition of the same type
    pub fn set_condition(&mut self, condition: Condition) {
        let status = self.status.get_or_insert_with(WorkloadStatus::default);
        status.conditions.retain(|c| c.type_ != condition.type_);
        status.conditions.push(condition);
    }

    /// Drop the controller's finalizer; returns true if it was present
    pub fn remove_resource_in_use_finalizer(&mut self) -> bool {
        let Some(finalizers) = self.metadata.finalizers.as_mut() else {
            return false;
        };
        let before = finalizers.len();
        finalizers.retain(|f| f != RESOURCE_IN_USE_FINALIZER);
        let removed = finalizers.len() != before;
        if finalizers.is_empty() {
            self.metadata.finalizers = None;
        }
        removed
    }
}

/// Specification for a WorkloadPriorityClass
///
/// A cluster-scoped, named queueing priority. Referencing one from a job
/// (via the priority-class label) overrides the pod template's scheduling
/// priority class when the Workload's priority is resolved.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "sluice.dev",
    version = "v1alpha1",
    kind = "WorkloadPriorityClass",
    plural = "workloadpriorityclasses",
    shortname = "wpc",
    printcolumn = r#"{"name":"Value","type":"integer","jsonPath":".spec.value"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadPriorityClassSpec {
    /// The queueing priority granted to Workloads referencing this class
    pub value: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::types::{PodSetAssignment, PodSetUpdate, REASON_JOB_FINISHED};
    use k8s_openapi::api::core::v1::PodTemplateSpec;

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    fn sample_pod_set(count: i32) -> PodSet {
        PodSet {
            name: "main".to_string(),
            template: PodTemplateSpec::default(),
            count,
            min_count: None,
        }
    }

    fn sample_workload() -> Workload {
        Workload::new(
            "a",
            WorkloadSpec {
                queue_name: "foo".to_string(),
                priority: 0,
                priority_class_name: None,
                priority_class_source: None,
                pod_sets: vec![sample_pod_set(10)],
            },
        )
    }

    // =========================================================================
    // Admission and Condition Stories
    // =========================================================================

    /// Story: A freshly created Workload is neither admitted nor finished
    ///
    /// Until the external scheduler writes status, every gate the reconciler
    /// consults must read as "not yet".
    #[test]
    fn story_new_workload_has_no_admission() {
        let wl = sample_workload();
        assert!(!wl.is_admitted());
        assert!(!wl.is_evicted());
        assert!(!wl.is_finished());
        assert_eq!(wl.assignment_count("main"), None);
    }

    /// Story: The scheduler admits a Workload by flag or by condition
    ///
    /// Both spellings must be recognized so the controller tolerates either
    /// scheduler version.
    #[test]
    fn story_admitted_flag_and_condition_both_count() {
        let mut wl = sample_workload();
        wl.status = Some(WorkloadStatus::default().admitted(true));
        assert!(wl.is_admitted());

        let mut wl = sample_workload();
        wl.set_condition(Condition::new(
            CONDITION_ADMITTED,
            ConditionStatus::True,
            "Admitted",
            "quota reserved",
        ));
        assert!(wl.is_admitted());
    }

    /// Story: Setting a condition replaces the previous one of the same type
    ///
    /// When a Workload transitions (e.g. Evicted: True -> False), the new
    /// condition replaces the old one rather than accumulating.
    #[test]
    fn story_set_condition_replaces_same_type() {
        let mut wl = sample_workload();
        wl.set_condition(Condition::new(
            CONDITION_EVICTED,
            ConditionStatus::True,
            "Preempted",
            "preempted by higher priority",
        ));
        wl.set_condition(Condition::new(
            CONDITION_EVICTED,
            ConditionStatus::False,
            "Requeued",
            "requeued",
        ));

        let conditions = &wl.status.as_ref().unwrap().conditions;
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, ConditionStatus::False);
        assert!(!wl.is_evicted());
    }

    /// Story: Only Ready checks contribute pod-set updates
    ///
    /// Pending, Retry and Rejected checks are invisible to the merge that
    /// runs before a job resumes.
    #[test]
    fn story_only_ready_checks_are_merged() {
        let mut wl = sample_workload();
        wl.status = Some(
            WorkloadStatus::default()
                .check(AdmissionCheckState {
                    name: "pending-check".to_string(),
                    state: CheckState::Pending,
                    pod_set_updates: vec![PodSetUpdate {
                        name: "main".to_string(),
                        ..Default::default()
                    }],
                })
                .check(AdmissionCheckState {
                    name: "ready-check".to_string(),
                    state: CheckState::Ready,
                    pod_set_updates: Vec::new(),
                }),
        );

        let ready: Vec<_> = wl.ready_checks().map(|c| c.name.as_str()).collect();
        assert_eq!(ready, vec!["ready-check"]);
    }

    /// Story: The finalizer is held until explicitly removed
    ///
    /// Removal is idempotent; removing an absent finalizer reports false so
    /// the caller can skip the write.
    #[test]
    fn story_finalizer_removal_is_idempotent() {
        let mut wl = sample_workload();
        wl.metadata.finalizers = Some(vec![RESOURCE_IN_USE_FINALIZER.to_string()]);
        assert!(wl.has_resource_in_use_finalizer());

        assert!(wl.remove_resource_in_use_finalizer());
        assert!(!wl.has_resource_in_use_finalizer());
        assert!(!wl.remove_resource_in_use_finalizer());
        assert_eq!(wl.metadata.finalizers, None);
    }

    /// Story: A foreign finalizer survives removal of ours
    #[test]
    fn story_foreign_finalizers_are_preserved() {
        let mut wl = sample_workload();
        wl.metadata.finalizers = Some(vec![
            "someone-else/keep".to_string(),
            RESOURCE_IN_USE_FINALIZER.to_string(),
        ]);

        assert!(wl.remove_resource_in_use_finalizer());
        assert_eq!(
            wl.metadata.finalizers,
            Some(vec!["someone-else/keep".to_string()])
        );
    }

    /// Story: Assignment counts fall back per pod set
    #[test]
    fn story_assignment_count_is_per_pod_set() {
        let mut wl = sample_workload();
        wl.status = Some(WorkloadStatus::default().reservation(QuotaReservation {
            cluster_queue: Some("cq".to_string()),
            pod_set_assignments: vec![PodSetAssignment {
                name: "main".to_string(),
                count: Some(8),
            }],
        }));

        assert_eq!(wl.assignment_count("main"), Some(8));
        assert_eq!(wl.assignment_count("workers"), None);
    }

    // =========================================================================
    // YAML Serialization Stories
    // =========================================================================

    /// Story: The scheduler's status writes deserialize cleanly
    ///
    /// The status subresource is written by an external component; this
    /// pins the wire shape both sides agree on.
    #[test]
    fn story_status_yaml_round_trip() {
        let yaml = r#"
reservation:
  clusterQueue: cq
  podSetAssignments:
    - name: main
      count: 8
admitted: true
admissionChecks:
  - name: check
    state: Ready
    podSetUpdates:
      - name: main
        labels:
          ac-key: ac-value
"#;
        let status: WorkloadStatus = serde_yaml::from_str(yaml).unwrap();
        assert!(status.admitted);
        assert_eq!(status.admission_checks.len(), 1);
        assert_eq!(status.admission_checks[0].state, CheckState::Ready);
        assert_eq!(
            status.admission_checks[0].pod_set_updates[0].labels["ac-key"],
            "ac-value"
        );

        let round = serde_yaml::to_string(&status).unwrap();
        let parsed: WorkloadStatus = serde_yaml::from_str(&round).unwrap();
        assert_eq!(status, parsed);
    }

    /// Story: Finished conditions serialize with the wire field names
    #[test]
    fn story_finished_condition_serializes_with_wire_names() {
        let mut wl = sample_workload();
        wl.set_condition(Condition::new(
            CONDITION_FINISHED,
            ConditionStatus::True,
            REASON_JOB_FINISHED,
            "Job finished successfully",
        ));

        let json = serde_json::to_value(wl.status.as_ref().unwrap()).unwrap();
        let cond = &json["conditions"][0];
        assert_eq!(cond["type"], "Finished");
        assert_eq!(cond["status"], "True");
        assert_eq!(cond["reason"], "JobFinished");
        assert!(cond.get("lastTransitionTime").is_some());
    }
}
