//! Kubernetes Event publishing for job transitions.
//!
//! Every significant transition the reconciler drives (workload created or
//! deleted, job suspended or resumed, workload finished) surfaces as a
//! standard Kubernetes Event on the job, visible via `kubectl describe`.
//!
//! Publishing is fire-and-forget: a failed Event write is logged and
//! swallowed, never allowed to fail the reconcile tick that produced it.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Event reason strings, as shown in the REASON column of
/// `kubectl get events`.
pub mod reasons {
    /// A Workload was created for a queued job
    pub const CREATED_WORKLOAD: &str = "CreatedWorkload";
    /// An owned Workload no longer matching its job was deleted
    pub const DELETED_WORKLOAD: &str = "DeletedWorkload";
    /// The job was resumed after its Workload was admitted
    pub const STARTED: &str = "Started";
    /// The job was suspended (no authorizing Workload, or evicted)
    pub const STOPPED: &str = "Stopped";
    /// The Workload was transitioned to Finished
    pub const FINISHED_WORKLOAD: &str = "FinishedWorkload";
}

/// Event action strings, as shown in the ACTION column of
/// `kubectl get events`.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Suspending a job
    pub const SUSPEND: &str = "Suspend";
    /// Resuming a job with merged pod-set info
    pub const RESUME: &str = "Resume";
    /// Creating or deleting an owned Workload
    pub const SYNC_WORKLOAD: &str = "SyncWorkload";
    /// Releasing the Workload finalizer
    pub const FINALIZE: &str = "Finalize";
}

/// Sink for job lifecycle Events.
///
/// Implementations must be fire-and-forget; see the module docs.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record one Event against the referenced object.
    ///
    /// `reason` and `action` come from the [`reasons`] and [`actions`]
    /// vocabularies; `note` carries the free-form detail (conflict message,
    /// workload name, suspension cause).
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// [`EventPublisher`] backed by the cluster's Events API.
pub struct KubeEventPublisher {
    client: Client,
    reporter: Reporter,
}

impl KubeEventPublisher {
    /// Build a publisher reporting as `controller_name` (the value that
    /// lands in the Event's `reportingComponent`).
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self { client, reporter }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), resource_ref.clone());
        // A lost Event must not fail the transition that emitted it.
        if let Err(error) = recorder.publish(event).await {
            warn!(reason, action, %error, "failed to publish event");
        }
    }
}

/// [`EventPublisher`] that drops everything; used in tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}
