//! The job↔workload reconciliation state machine
//!
//! One tick drives a single job through the loop: load, parent linkage,
//! terminal propagation, workload reconciliation (at most one survivor),
//! eviction, and the admission gate. Every branch is safe under retry:
//! re-entering the same state produces no spurious writes, and each
//! external read or write is a cooperative suspension point the runtime
//! may cancel by dropping the future.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use tracing::{debug, error, info, instrument, warn};

use crate::crd::{
    Condition, ConditionStatus, PodSet, Workload, WorkloadSpec, CONDITION_FINISHED,
    REASON_FAILED_TO_START, REASON_JOB_FINISHED,
};
use crate::events::{actions, reasons, EventPublisher};
use crate::job::{self, JobOutcome, QueueableJob};
use crate::podset::{self, PodSetInfo};
use crate::{Error, Result};
use crate::{JOB_UID_LABEL, LABEL_VALUE_MAX_LEN, POD_PRIORITY_CLASS_SOURCE,
    RESOURCE_IN_USE_FINALIZER, WORKLOAD_PRIORITY_CLASS_SOURCE};

use super::JobQueueClient;

/// A parent kind recognized as a workload owner.
///
/// Child jobs must be controller-owned by one of these kinds; anything else
/// fails the tick with [`Error::UnknownWorkloadOwner`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParentKind {
    /// API version of the owning kind (e.g. "kubeflow.org/v1")
    pub api_version: String,
    /// Kind of the owner (e.g. "MPIJob")
    pub kind: String,
}

impl ParentKind {
    /// Create a new parent kind entry
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }

    /// True when the given owner reference is of this kind
    pub fn matches(&self, owner: &OwnerReference) -> bool {
        owner.api_version == self.api_version && owner.kind == self.kind
    }
}

/// Tunables for the job reconciler.
#[derive(Clone, Debug, Default)]
pub struct ReconcilerOptions {
    /// Also manage jobs that carry no queue name
    pub manage_jobs_without_queue_name: bool,

    /// Allowlist of workload-owning parent kinds for child jobs
    pub parent_kinds: Vec<ParentKind>,
}

impl ReconcilerOptions {
    /// Manage jobs even when they carry no queue name
    pub fn manage_jobs_without_queue_name(mut self, enabled: bool) -> Self {
        self.manage_jobs_without_queue_name = enabled;
        self
    }

    /// Recognize an additional workload-owning parent kind
    pub fn recognize_parent_kind(mut self, kind: ParentKind) -> Self {
        self.parent_kinds.push(kind);
        self
    }
}

/// Reconciles one job kind against its owned Workloads.
///
/// The runtime delivers at most one in-flight reconcile per job key;
/// between keys reconciliations proceed in parallel and no cross-key
/// ordering is assumed. Authoritative state is re-read at tick start.
pub struct JobReconciler<A: QueueableJob> {
    client: Arc<dyn JobQueueClient<A>>,
    events: Arc<dyn EventPublisher>,
    options: ReconcilerOptions,
}

impl<A: QueueableJob> JobReconciler<A> {
    /// Create a new reconciler with default options
    pub fn new(client: Arc<dyn JobQueueClient<A>>, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            client,
            events,
            options: ReconcilerOptions::default(),
        }
    }

    /// Create a new reconciler with the given options
    pub fn with_options(
        client: Arc<dyn JobQueueClient<A>>,
        events: Arc<dyn EventPublisher>,
        options: ReconcilerOptions,
    ) -> Self {
        Self {
            client,
            events,
            options,
        }
    }

    /// Run one reconciliation tick for the job with the given key.
    #[instrument(skip(self), fields(namespace = %namespace, job = %name))]
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Action> {
        let Some(mut job) = self.client.get_job(namespace, name).await? else {
            debug!("job not found; nothing to do");
            return Ok(Action::await_change());
        };

        // Child jobs defer to their named parent Workload and never own one.
        if let Some(parent) = job::parent_workload_name(job.metadata()).map(str::to_string) {
            return self.reconcile_child_job(&mut job, namespace, &parent).await;
        }

        // A terminal job only propagates its outcome to the Workload.
        if let Some(outcome) = job.finished() {
            return self.reconcile_finished_job(&job, namespace, outcome).await;
        }

        let owner_uid = job.metadata().uid.clone().unwrap_or_default();
        let workloads = self
            .client
            .list_owned_workloads(namespace, &owner_uid)
            .await?;

        // Lifecycle: a job without a queue name keeps no Workload.
        if job::queue_name(job.metadata()).is_none()
            && !self.options.manage_jobs_without_queue_name
        {
            return self.release_unqueued_job(&mut job, &workloads).await;
        }

        // A finished Workload only waits for its finalizer release; it takes
        // no further part in matching.
        if let Some(finished) = workloads
            .iter()
            .find(|w| w.is_finished() && w.has_resource_in_use_finalizer())
        {
            let mut wl = finished.clone();
            wl.remove_resource_in_use_finalizer();
            self.client.update_workload(&wl).await?;
            info!(workload = wl.metadata.name.as_deref().unwrap_or_default(),
                "released finalizer of finished workload");
            return Ok(Action::await_change());
        }
        let live: Vec<Workload> = workloads
            .into_iter()
            .filter(|w| !w.is_finished())
            .collect();

        // At most one owned Workload may survive. Prefer an admitted
        // equivalent as the survivor.
        let job_pod_sets = job.pod_sets();
        let (matching, extra) = partition_workloads(&job, &job_pod_sets, live);
        let deleted = self.delete_workloads(&job, &extra).await?;

        let Some(workload) = matching else {
            if deleted > 0 {
                // Corrective writes first, then surface the mismatch so the
                // next tick finds a clean state to recreate from.
                if !job.is_suspended() {
                    self.stop_job(&mut job, None, "No matching Workload").await?;
                }
                return Err(Error::NoMatchingWorkloads);
            }
            if !job.is_suspended() {
                self.stop_job(&mut job, None, "No Workload authorizes the job to run")
                    .await?;
                return Ok(Action::await_change());
            }
            let workload = self.build_workload(&job, namespace).await?;
            self.client.create_workload(&workload).await?;
            info!(
                workload = workload.metadata.name.as_deref().unwrap_or_default(),
                "created workload"
            );
            self.publish_job_event(
                &job,
                EventType::Normal,
                reasons::CREATED_WORKLOAD,
                actions::SYNC_WORKLOAD,
                format!(
                    "Created Workload: {}",
                    workload.metadata.name.as_deref().unwrap_or_default()
                ),
            )
            .await;
            return Ok(Action::await_change());
        };

        if deleted > 0 {
            return Err(Error::ExtraWorkloads);
        }

        // Eviction returns the job to suspended state and undoes prior
        // pod-set mutations; restoration is idempotent.
        if workload.is_evicted() {
            self.stop_job(&mut job, Some(&workload), "Workload evicted")
                .await?;
            return Ok(Action::await_change());
        }

        if workload.is_admitted() {
            if job.is_suspended() {
                return self.start_job(&mut job, &workload).await;
            }
            debug!("job already running under an admitted workload");
            return Ok(Action::await_change());
        }

        // Unadmitted Workload: the job must not run.
        if !job.is_suspended() {
            self.stop_job(&mut job, Some(&workload), "Not admitted by the queue")
                .await?;
        }
        Ok(Action::await_change())
    }

    /// Drive a child job purely from its parent Workload's admission.
    async fn reconcile_child_job(
        &self,
        job: &mut A,
        namespace: &str,
        parent_name: &str,
    ) -> Result<Action> {
        if job.finished().is_some() {
            return Ok(Action::await_change());
        }

        {
            let Some(owner) = job::controller_owner(job.metadata()) else {
                return Err(Error::ChildJobOwnerNotFound);
            };
            if !self.options.parent_kinds.iter().any(|k| k.matches(owner)) {
                return Err(Error::UnknownWorkloadOwner);
            }
        }

        match self.client.get_workload(namespace, parent_name).await? {
            Some(parent) if parent.is_admitted() => {
                debug!(parent = parent_name, "parent workload admitted; job may run");
                Ok(Action::await_change())
            }
            parent => {
                info!(
                    parent = parent_name,
                    found = parent.is_some(),
                    "parent workload missing or not admitted; job must stay suspended"
                );
                if !job.is_suspended() {
                    self.stop_job(job, None, "Parent workload is not admitted")
                        .await?;
                }
                Ok(Action::await_change())
            }
        }
    }

    /// Propagate a job's terminal outcome to its Workload, then release the
    /// finalizer on a later tick once the condition is observed.
    async fn reconcile_finished_job(
        &self,
        job: &A,
        namespace: &str,
        outcome: JobOutcome,
    ) -> Result<Action> {
        let owner_uid = job.metadata().uid.clone().unwrap_or_default();
        let workloads = self
            .client
            .list_owned_workloads(namespace, &owner_uid)
            .await?;
        let Some(workload) = workloads.into_iter().next() else {
            return Ok(Action::await_change());
        };

        if !workload.is_finished() {
            let mut wl = workload;
            wl.set_condition(Condition::new(
                CONDITION_FINISHED,
                ConditionStatus::True,
                REASON_JOB_FINISHED,
                outcome.message.clone(),
            ));
            self.client.update_workload_status(&wl).await?;
            self.publish_job_event(
                job,
                EventType::Normal,
                reasons::FINISHED_WORKLOAD,
                actions::RECONCILE,
                outcome.message,
            )
            .await;
        } else if workload.has_resource_in_use_finalizer() {
            let mut wl = workload;
            wl.remove_resource_in_use_finalizer();
            self.client.update_workload(&wl).await?;
        }
        Ok(Action::await_change())
    }

    /// Tear down the Workloads of a job that no longer names a queue.
    async fn release_unqueued_job(&self, job: &mut A, workloads: &[Workload]) -> Result<Action> {
        if workloads.is_empty() {
            debug!("job has no queue name; ignoring");
            return Ok(Action::await_change());
        }
        if !job.is_suspended() {
            self.stop_job(job, workloads.first(), "Queue name removed")
                .await?;
        }
        self.delete_workloads(job, workloads).await?;
        Ok(Action::await_change())
    }

    /// Delete owned Workloads, skipping any that do not carry our finalizer
    /// (those are not ours to delete). Returns how many were deleted.
    async fn delete_workloads(&self, job: &A, workloads: &[Workload]) -> Result<usize> {
        let mut deleted = 0;
        for workload in workloads {
            if !workload.has_resource_in_use_finalizer() {
                warn!(
                    workload = workload.metadata.name.as_deref().unwrap_or_default(),
                    "unmatched workload does not carry our finalizer; leaving it"
                );
                continue;
            }
            let mut wl = workload.clone();
            wl.remove_resource_in_use_finalizer();
            self.client.update_workload(&wl).await?;
            self.client.delete_workload(&wl).await?;
            self.publish_job_event(
                job,
                EventType::Normal,
                reasons::DELETED_WORKLOAD,
                actions::SYNC_WORKLOAD,
                format!(
                    "Deleted not matching Workload: {}",
                    wl.metadata.name.as_deref().unwrap_or_default()
                ),
            )
            .await;
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Resume a suspended job under an admitted Workload.
    async fn start_job(&self, job: &mut A, workload: &Workload) -> Result<Action> {
        let infos = match podset::merge_admission_checks(workload) {
            Ok(infos) => infos,
            Err(e) if e.is_failed_to_start() => {
                self.fail_workload_to_start(job, workload, &e).await?;
                return Ok(Action::await_change());
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = job.run_with_pod_set_infos(&infos) {
            if e.is_failed_to_start() {
                // The in-memory job may carry partial mutations; they are
                // never written, so the observed job stays suspended.
                self.fail_workload_to_start(job, workload, &e).await?;
                return Ok(Action::await_change());
            }
            return Err(e);
        }

        self.client.update_job(job).await?;
        info!("resumed job under admitted workload");
        self.publish_job_event(
            job,
            EventType::Normal,
            reasons::STARTED,
            actions::RESUME,
            "Admitted by the queue; job unsuspended".to_string(),
        )
        .await;
        Ok(Action::await_change())
    }

    /// Suspend a job, restoring pod-set originals from its Workload and
    /// clearing the recorded start time. Idempotent: converged state
    /// produces no writes.
    async fn stop_job(&self, job: &mut A, workload: Option<&Workload>, note: &str) -> Result<()> {
        let mut changed = false;
        if let Some(wl) = workload {
            let infos: Vec<PodSetInfo> =
                wl.spec.pod_sets.iter().map(PodSetInfo::from_pod_set).collect();
            changed |= job.restore_pod_set_infos(&infos);
        }
        if !job.is_suspended() {
            job.suspend();
            changed = true;
        }
        if changed {
            self.client.update_job(job).await?;
            info!(reason = note, "suspended job");
            self.publish_job_event(
                job,
                EventType::Normal,
                reasons::STOPPED,
                actions::SUSPEND,
                note.to_string(),
            )
            .await;
        }
        if job.clear_start_time() {
            self.client.update_job_status(job).await?;
        }
        Ok(())
    }

    /// Finish a Workload as FailedToStart after a terminal merge or resume
    /// failure; the job stays suspended until the check proposals change.
    async fn fail_workload_to_start(
        &self,
        job: &A,
        workload: &Workload,
        err: &Error,
    ) -> Result<()> {
        warn!(error = %err, "workload cannot start; finishing it");
        if workload.is_finished() {
            return Ok(());
        }
        let mut wl = workload.clone();
        wl.set_condition(Condition::new(
            CONDITION_FINISHED,
            ConditionStatus::True,
            REASON_FAILED_TO_START,
            err.to_string(),
        ));
        self.client.update_workload_status(&wl).await?;
        self.publish_job_event(
            job,
            EventType::Warning,
            reasons::FINISHED_WORKLOAD,
            actions::RESUME,
            err.to_string(),
        )
        .await;
        Ok(())
    }

    /// Project a Workload from a queued job.
    async fn build_workload(&self, job: &A, namespace: &str) -> Result<Workload> {
        let meta = job.metadata();
        let (priority, priority_class_name, priority_class_source) =
            self.resolve_priority(job).await?;

        let mut workload = Workload::new(
            &workload_name_for(job),
            WorkloadSpec {
                queue_name: job::queue_name(meta).unwrap_or_default().to_string(),
                priority,
                priority_class_name,
                priority_class_source,
                pod_sets: job.pod_sets(),
            },
        );
        workload.metadata.namespace = Some(namespace.to_string());
        workload.metadata.owner_references = Some(vec![job.owner_reference()]);
        workload.metadata.finalizers = Some(vec![RESOURCE_IN_USE_FINALIZER.to_string()]);

        // The label value bound caps what can be stamped; an oversize UID
        // is simply not recorded.
        if let Some(uid) = meta.uid.as_deref() {
            if uid.len() <= LABEL_VALUE_MAX_LEN {
                workload
                    .metadata
                    .labels
                    .get_or_insert_with(Default::default)
                    .insert(JOB_UID_LABEL.to_string(), uid.to_string());
            }
        }
        Ok(workload)
    }

    /// Resolve the Workload's priority: the referenced WorkloadPriorityClass
    /// wins over the pod-level priority class, which wins over none.
    async fn resolve_priority(&self, job: &A) -> Result<(i32, Option<String>, Option<String>)> {
        if let Some(name) = job::workload_priority_class_name(job.metadata()) {
            let wpc = self
                .client
                .get_workload_priority_class(name)
                .await?
                .ok_or_else(|| Error::PriorityClassNotFound(name.to_string()))?;
            return Ok((
                wpc.spec.value,
                Some(name.to_string()),
                Some(WORKLOAD_PRIORITY_CLASS_SOURCE.to_string()),
            ));
        }
        if let Some(name) = job.priority_class() {
            let pc = self
                .client
                .get_priority_class(&name)
                .await?
                .ok_or_else(|| Error::PriorityClassNotFound(name.clone()))?;
            return Ok((
                pc.value,
                Some(name),
                Some(POD_PRIORITY_CLASS_SOURCE.to_string()),
            ));
        }
        Ok((0, None, None))
    }

    async fn publish_job_event(
        &self,
        job: &A,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) {
        self.events
            .publish(&job_object_ref(job), type_, reason, action, Some(note))
            .await;
    }
}

/// Name of the Workload owned by a job.
///
/// Deterministic, so deletion and recreation converge on the same object.
pub fn workload_name_for<A: QueueableJob>(job: &A) -> String {
    format!(
        "job-{}",
        job.metadata().name.as_deref().unwrap_or_default()
    )
}

/// Split owned Workloads into the surviving match (at most one, preferring
/// an admitted equivalent) and the extras to delete.
fn partition_workloads<A: QueueableJob>(
    job: &A,
    job_pod_sets: &[PodSet],
    workloads: Vec<Workload>,
) -> (Option<Workload>, Vec<Workload>) {
    let mut matching: Option<Workload> = None;
    let mut extra: Vec<Workload> = Vec::new();

    for wl in workloads {
        if matching.is_none() && wl.is_admitted() && equivalent_to_workload(job, job_pod_sets, &wl)
        {
            matching = Some(wl);
        } else {
            extra.push(wl);
        }
    }
    if matching.is_none() {
        let mut rest = Vec::new();
        for wl in extra {
            if matching.is_none() && equivalent_to_workload(job, job_pod_sets, &wl) {
                matching = Some(wl);
            } else {
                rest.push(wl);
            }
        }
        extra = rest;
    }
    (matching, extra)
}

/// Decide whether an existing Workload still matches the current job.
///
/// Pod-set lists must agree pairwise on name. While the job is running
/// under an admitted Workload, its template may carry admission-check
/// mutations and its count the reduced partial-admission assignment, so
/// counts are compared against the quota reservation and templates are not
/// compared. In every other state the projection must be exact: template,
/// count and min-count.
fn equivalent_to_workload<A: QueueableJob>(
    job: &A,
    job_pod_sets: &[PodSet],
    workload: &Workload,
) -> bool {
    let wl_sets = &workload.spec.pod_sets;
    if job_pod_sets.len() != wl_sets.len() {
        return false;
    }
    let running_admitted = !job.is_suspended() && workload.is_admitted();
    for (jps, wps) in job_pod_sets.iter().zip(wl_sets.iter()) {
        if jps.name != wps.name {
            return false;
        }
        if running_admitted {
            let expected = workload.assignment_count(&wps.name).unwrap_or(wps.count);
            if jps.count != expected {
                return false;
            }
        } else if jps.template != wps.template
            || jps.count != wps.count
            || jps.min_count != wps.min_count
        {
            return false;
        }
    }
    true
}

/// Error policy for the controller.
///
/// Called when a reconcile tick fails; semantic errors were surfaced after
/// their corrective writes, so a flat requeue converges.
pub fn error_policy(error: &Error) -> Action {
    error!(?error, "reconciliation failed");
    Action::requeue(Duration::from_secs(5))
}

/// Object reference for Events published on a job.
fn job_object_ref<A: QueueableJob>(job: &A) -> ObjectReference {
    let meta = job.metadata();
    let owner = job.owner_reference();
    ObjectReference {
        api_version: Some(owner.api_version),
        kind: Some(owner.kind),
        name: meta.name.clone(),
        namespace: meta.namespace.clone(),
        uid: meta.uid.clone(),
        ..Default::default()
    }
}
