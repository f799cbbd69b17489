//! Pod-set mutation values: merge, apply and restore
//!
//! A [`PodSetInfo`] is the bundle of additive mutations (labels, annotations,
//! node-selector entries, replica count) applied to one pod set when a job
//! resumes. Infos are assembled from the Workload's quota reservation and the
//! `Ready` admission checks' proposals, folded through an explicit merge that
//! produces either a merged value or a typed conflict - nothing is written to
//! the pod template until the whole fold succeeds.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::crd::{PodSet, PodSetUpdate, Workload};
use crate::error::UpdateField;
use crate::{Error, Result};

/// Mutations to apply to one pod set when a job resumes, or the originals to
/// re-seat when it is stopped.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PodSetInfo {
    /// Name of the pod set this info applies to
    pub name: String,

    /// Replica count: the reserved count on resume, the original count on
    /// restore. Applied only when the job declares partial-admission support.
    pub count: i32,

    /// Labels to add to the pod template
    pub labels: BTreeMap<String, String>,

    /// Annotations to add to the pod template
    pub annotations: BTreeMap<String, String>,

    /// Node-selector entries to add to the pod spec
    pub node_selector: BTreeMap<String, String>,
}

impl PodSetInfo {
    /// Capture the originals of a projected pod set, for a later restore.
    pub fn from_pod_set(pod_set: &PodSet) -> Self {
        let meta = pod_set.template.metadata.as_ref();
        let spec = pod_set.template.spec.as_ref();
        Self {
            name: pod_set.name.clone(),
            count: pod_set.count,
            labels: meta.and_then(|m| m.labels.clone()).unwrap_or_default(),
            annotations: meta.and_then(|m| m.annotations.clone()).unwrap_or_default(),
            node_selector: spec.and_then(|s| s.node_selector.clone()).unwrap_or_default(),
        }
    }

    /// Fold an admission check's proposal into this info.
    ///
    /// Every key is additive; a key both sides carry must agree on its value.
    /// The first disagreement aborts the fold, reporting the value already
    /// accumulated as `value1` and the incoming one as `value2`.
    pub fn merge_update(&mut self, update: &PodSetUpdate) -> Result<()> {
        merge_maps(&mut self.labels, &update.labels, UpdateField::Labels)?;
        merge_maps(
            &mut self.annotations,
            &update.annotations,
            UpdateField::Annotations,
        )?;
        merge_maps(
            &mut self.node_selector,
            &update.node_selector,
            UpdateField::NodeSelector,
        )?;
        Ok(())
    }
}

/// Union two accumulated maps; disagreement on a shared key is a conflict
/// with `value1` taken from what is already accumulated.
fn merge_maps(
    dst: &mut BTreeMap<String, String>,
    src: &BTreeMap<String, String>,
    field: UpdateField,
) -> Result<()> {
    for (key, value) in src {
        match dst.get(key) {
            Some(existing) if existing != value => {
                return Err(Error::pod_set_update_conflict(field, key, existing, value));
            }
            _ => {
                dst.insert(key.clone(), value.clone());
            }
        }
    }
    Ok(())
}

/// Assemble the final per-pod-set infos for resuming a job from its admitted
/// Workload.
///
/// Counts are seeded from the quota reservation's assignments (falling back
/// to the pod set's declared count), then every `Ready` admission check's
/// proposals are folded in, in list order. A conflict is attributed to the
/// check being folded when it surfaced.
pub fn merge_admission_checks(workload: &Workload) -> Result<Vec<PodSetInfo>> {
    let mut infos: Vec<PodSetInfo> = workload
        .spec
        .pod_sets
        .iter()
        .map(|ps| PodSetInfo {
            name: ps.name.clone(),
            count: workload.assignment_count(&ps.name).unwrap_or(ps.count),
            ..Default::default()
        })
        .collect();

    for check in workload.ready_checks() {
        for update in &check.pod_set_updates {
            // Updates naming a pod set the Workload does not carry are stale
            // check output; skip them.
            if let Some(info) = infos.iter_mut().find(|i| i.name == update.name) {
                info.merge_update(update)
                    .map_err(|e| Error::in_admission_check(&check.name, e))?;
            }
        }
    }

    Ok(infos)
}

/// Apply an info to a pod template's metadata and spec (run-merge).
///
/// Every key is added; a key already present with a different value fails
/// with the template's value as `value2`, leaving prior additions in place
/// for diagnosis. The replica count is the adapter's concern, not applied
/// here.
pub fn merge(meta: &mut ObjectMeta, spec: &mut PodSpec, info: &PodSetInfo) -> Result<()> {
    merge_into_template(&mut meta.labels, &info.labels, UpdateField::Labels)?;
    merge_into_template(
        &mut meta.annotations,
        &info.annotations,
        UpdateField::Annotations,
    )?;
    merge_into_template(
        &mut spec.node_selector,
        &info.node_selector,
        UpdateField::NodeSelector,
    )?;
    Ok(())
}

/// Add `src` into an optional template map; disagreement reports the
/// incoming value as `value1` and the template's as `value2`.
fn merge_into_template(
    target: &mut Option<BTreeMap<String, String>>,
    src: &BTreeMap<String, String>,
    field: UpdateField,
) -> Result<()> {
    if src.is_empty() {
        return Ok(());
    }
    let map = target.get_or_insert_with(BTreeMap::new);
    for (key, value) in src {
        match map.get(key) {
            Some(existing) if existing != value => {
                return Err(Error::pod_set_update_conflict(field, key, value, existing));
            }
            _ => {
                map.insert(key.clone(), value.clone());
            }
        }
    }
    Ok(())
}

/// Re-seat a pod template's metadata and spec from the originals in `info`.
///
/// Returns true when anything was undone, so the caller can skip the write
/// when the template is already pristine.
pub fn restore(meta: &mut ObjectMeta, spec: &mut PodSpec, info: &PodSetInfo) -> bool {
    let mut changed = false;
    changed |= restore_map(&mut meta.labels, &info.labels);
    changed |= restore_map(&mut meta.annotations, &info.annotations);
    changed |= restore_map(&mut spec.node_selector, &info.node_selector);
    changed
}

fn restore_map(target: &mut Option<BTreeMap<String, String>>, original: &BTreeMap<String, String>) -> bool {
    let current = target.as_ref().cloned().unwrap_or_default();
    if current == *original {
        return false;
    }
    *target = if original.is_empty() {
        None
    } else {
        Some(original.clone())
    };
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        AdmissionCheckState, CheckState, PodSetAssignment, QuotaReservation, WorkloadSpec,
        WorkloadStatus,
    };
    use k8s_openapi::api::core::v1::PodTemplateSpec;

    fn map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn template(node_selector: &[(&str, &str)]) -> (ObjectMeta, PodSpec) {
        let meta = ObjectMeta::default();
        let spec = PodSpec {
            node_selector: if node_selector.is_empty() {
                None
            } else {
                Some(map(node_selector))
            },
            ..Default::default()
        };
        (meta, spec)
    }

    fn workload_with_checks(checks: Vec<AdmissionCheckState>) -> Workload {
        let mut wl = Workload::new(
            "a",
            WorkloadSpec {
                queue_name: "foo".to_string(),
                priority: 0,
                priority_class_name: None,
                priority_class_source: None,
                pod_sets: vec![PodSet {
                    name: "main".to_string(),
                    template: PodTemplateSpec::default(),
                    count: 10,
                    min_count: None,
                }],
            },
        );
        let mut status = WorkloadStatus::default().admitted(true);
        for check in checks {
            status = status.check(check);
        }
        wl.status = Some(status);
        wl
    }

    fn ready_check(name: &str, update: PodSetUpdate) -> AdmissionCheckState {
        AdmissionCheckState {
            name: name.to_string(),
            state: CheckState::Ready,
            pod_set_updates: vec![update],
        }
    }

    #[test]
    fn merge_adds_new_node_selector_entries() {
        let (mut meta, mut spec) = template(&[("orig-key", "orig-val")]);
        let info = PodSetInfo {
            name: "main".to_string(),
            node_selector: map(&[("new-key", "new-val")]),
            ..Default::default()
        };

        merge(&mut meta, &mut spec, &info).unwrap();

        assert_eq!(
            spec.node_selector,
            Some(map(&[("orig-key", "orig-val"), ("new-key", "new-val")]))
        );
    }

    #[test]
    fn merge_rejects_changing_an_existing_value() {
        let (mut meta, mut spec) = template(&[("provisioning", "spot")]);
        let info = PodSetInfo {
            name: "main".to_string(),
            node_selector: map(&[("provisioning", "on-demand")]),
            ..Default::default()
        };

        let err = merge(&mut meta, &mut spec, &info).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid admission check PodSetUpdate: conflict for nodeSelector: \
             conflict for key=provisioning, value1=on-demand, value2=spot"
        );
        // The template keeps its original value.
        assert_eq!(spec.node_selector, Some(map(&[("provisioning", "spot")])));
    }

    #[test]
    fn merge_accepts_an_agreeing_value() {
        let (mut meta, mut spec) = template(&[("provisioning", "spot")]);
        let info = PodSetInfo {
            name: "main".to_string(),
            node_selector: map(&[("provisioning", "spot")]),
            ..Default::default()
        };

        merge(&mut meta, &mut spec, &info).unwrap();
        assert_eq!(spec.node_selector, Some(map(&[("provisioning", "spot")])));
    }

    #[test]
    fn merge_then_restore_round_trips() {
        let (mut meta, mut spec) = template(&[("orig-key", "orig-val")]);
        meta.labels = Some(map(&[("app", "demo")]));
        let original = PodSetInfo {
            name: "main".to_string(),
            count: 10,
            labels: map(&[("app", "demo")]),
            annotations: BTreeMap::new(),
            node_selector: map(&[("orig-key", "orig-val")]),
        };
        let injected = PodSetInfo {
            name: "main".to_string(),
            count: 8,
            labels: map(&[("ac-key", "ac-value")]),
            annotations: map(&[("note", "injected")]),
            node_selector: map(&[("new-key", "new-val")]),
        };

        merge(&mut meta, &mut spec, &injected).unwrap();
        assert_eq!(
            meta.labels,
            Some(map(&[("app", "demo"), ("ac-key", "ac-value")]))
        );

        assert!(restore(&mut meta, &mut spec, &original));

        assert_eq!(meta.labels, Some(map(&[("app", "demo")])));
        assert_eq!(meta.annotations, None);
        assert_eq!(spec.node_selector, Some(map(&[("orig-key", "orig-val")])));
    }

    #[test]
    fn restore_of_a_pristine_template_reports_no_change() {
        let (mut meta, mut spec) = template(&[("orig-key", "orig-val")]);
        let original = PodSetInfo {
            name: "main".to_string(),
            count: 10,
            node_selector: map(&[("orig-key", "orig-val")]),
            ..Default::default()
        };

        assert!(!restore(&mut meta, &mut spec, &original));
    }

    #[test]
    fn agreeing_checks_union_their_updates() {
        let wl = workload_with_checks(vec![
            ready_check(
                "check1",
                PodSetUpdate {
                    name: "main".to_string(),
                    labels: map(&[("label-key1", "common-value")]),
                    annotations: map(&[
                        ("annotation-key1", "common-value"),
                        ("annotation-key2", "only-in-check1"),
                    ]),
                    node_selector: map(&[("node-selector-key1", "common-value")]),
                },
            ),
            ready_check(
                "check2",
                PodSetUpdate {
                    name: "main".to_string(),
                    labels: map(&[("label-key1", "common-value")]),
                    annotations: map(&[("annotation-key1", "common-value")]),
                    node_selector: map(&[
                        ("node-selector-key1", "common-value"),
                        ("node-selector-key2", "only-in-check2"),
                    ]),
                },
            ),
        ]);

        let infos = merge_admission_checks(&wl).unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].labels, map(&[("label-key1", "common-value")]));
        assert_eq!(
            infos[0].annotations,
            map(&[
                ("annotation-key1", "common-value"),
                ("annotation-key2", "only-in-check1"),
            ])
        );
        assert_eq!(
            infos[0].node_selector,
            map(&[
                ("node-selector-key1", "common-value"),
                ("node-selector-key2", "only-in-check2"),
            ])
        );
    }

    #[test]
    fn disagreeing_checks_conflict_naming_the_later_check() {
        let wl = workload_with_checks(vec![
            ready_check(
                "check1",
                PodSetUpdate {
                    name: "main".to_string(),
                    labels: map(&[("ac-key", "ac-value1")]),
                    ..Default::default()
                },
            ),
            ready_check(
                "check2",
                PodSetUpdate {
                    name: "main".to_string(),
                    labels: map(&[("ac-key", "ac-value2")]),
                    ..Default::default()
                },
            ),
        ]);

        let err = merge_admission_checks(&wl).unwrap_err();
        assert_eq!(
            err.to_string(),
            "in admission check \"check2\": invalid admission check PodSetUpdate: \
             conflict for labels: conflict for key=ac-key, value1=ac-value1, value2=ac-value2"
        );
        assert!(err.is_invalid_pod_set_update());
    }

    #[test]
    fn non_ready_checks_do_not_contribute() {
        let wl = workload_with_checks(vec![
            AdmissionCheckState {
                name: "pending".to_string(),
                state: CheckState::Pending,
                pod_set_updates: vec![PodSetUpdate {
                    name: "main".to_string(),
                    labels: map(&[("ac-key", "ac-value1")]),
                    ..Default::default()
                }],
            },
            ready_check(
                "ready",
                PodSetUpdate {
                    name: "main".to_string(),
                    labels: map(&[("ac-key", "ac-value2")]),
                    ..Default::default()
                },
            ),
        ]);

        let infos = merge_admission_checks(&wl).unwrap();
        assert_eq!(infos[0].labels, map(&[("ac-key", "ac-value2")]));
    }

    #[test]
    fn counts_are_seeded_from_the_reservation() {
        let mut wl = workload_with_checks(Vec::new());
        wl.spec.pod_sets[0].min_count = Some(5);
        wl.status = Some(
            WorkloadStatus::default()
                .admitted(true)
                .reservation(QuotaReservation {
                    cluster_queue: Some("cq".to_string()),
                    pod_set_assignments: vec![PodSetAssignment {
                        name: "main".to_string(),
                        count: Some(8),
                    }],
                }),
        );

        let infos = merge_admission_checks(&wl).unwrap();
        assert_eq!(infos[0].count, 8);
    }

    #[test]
    fn counts_fall_back_to_the_pod_set_count() {
        let wl = workload_with_checks(Vec::new());
        let infos = merge_admission_checks(&wl).unwrap();
        assert_eq!(infos[0].count, 10);
    }

    #[test]
    fn from_pod_set_captures_template_originals() {
        let pod_set = PodSet {
            name: "main".to_string(),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(map(&[("app", "demo")])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    node_selector: Some(map(&[("provisioning", "spot")])),
                    ..Default::default()
                }),
            },
            count: 10,
            min_count: Some(5),
        };

        let info = PodSetInfo::from_pod_set(&pod_set);
        assert_eq!(info.name, "main");
        assert_eq!(info.count, 10);
        assert_eq!(info.labels, map(&[("app", "demo")]));
        assert_eq!(info.node_selector, map(&[("provisioning", "spot")]));
    }
}
