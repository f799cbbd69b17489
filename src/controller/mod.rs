//! Job↔workload reconciliation
//!
//! This module implements the reconciliation loop that gates batch-style
//! jobs behind the queue system. It follows the Kubernetes controller
//! pattern: observe current state, determine desired state, and make
//! incremental changes to converge on the desired state.
//!
//! The loop itself lives in [`reconciler`]; this module defines the
//! trait-abstracted object-store client the loop talks through, so tests
//! can substitute mocks or an in-memory fake for the real API server.

use std::fmt::Debug;
use std::marker::PhantomData;

use async_trait::async_trait;
use k8s_openapi::api::scheduling::v1::PriorityClass;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

#[cfg(test)]
use mockall::automock;

use crate::crd::{Workload, WorkloadPriorityClass};
use crate::job::{controller_owner, QueueableJob};
use crate::Result;

mod reconciler;

pub use reconciler::{
    error_policy, workload_name_for, JobReconciler, ParentKind, ReconcilerOptions,
};

/// Field manager recorded on writes issued by this controller.
pub const FIELD_MANAGER: &str = "sluice-job-controller";

/// Trait abstracting object-store operations for the job reconciler.
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production. Spec writes and status writes are
/// distinct operations, matching the API server's subresource split; all
/// writes are optimistic (a conflict surfaces as an error and the next
/// tick retries).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JobQueueClient<J: QueueableJob>: Send + Sync {
    /// Fetch a job by namespace and name; `None` when it does not exist
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<J>>;

    /// Write the job's spec (suspension, template, parallelism)
    async fn update_job(&self, job: &J) -> Result<()>;

    /// Write the job's status subresource (start time)
    async fn update_job_status(&self, job: &J) -> Result<()>;

    /// Fetch a Workload by namespace and name; `None` when it does not exist
    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Option<Workload>>;

    /// List the Workloads owned (controller-owned) by the job with the
    /// given UID
    async fn list_owned_workloads(&self, namespace: &str, owner_uid: &str)
        -> Result<Vec<Workload>>;

    /// Create a new Workload
    async fn create_workload(&self, workload: &Workload) -> Result<()>;

    /// Delete a Workload
    async fn delete_workload(&self, workload: &Workload) -> Result<()>;

    /// Write a Workload's metadata and spec (finalizer changes)
    async fn update_workload(&self, workload: &Workload) -> Result<()>;

    /// Write a Workload's status subresource (conditions)
    async fn update_workload_status(&self, workload: &Workload) -> Result<()>;

    /// Fetch a scheduling PriorityClass by name
    async fn get_priority_class(&self, name: &str) -> Result<Option<PriorityClass>>;

    /// Fetch a WorkloadPriorityClass by name
    async fn get_workload_priority_class(&self, name: &str)
        -> Result<Option<WorkloadPriorityClass>>;
}

/// Real Kubernetes client implementation.
pub struct KubeJobQueueClient<A> {
    client: Client,
    _adapter: PhantomData<fn() -> A>,
}

impl<A> KubeJobQueueClient<A> {
    /// Create a new client wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _adapter: PhantomData,
        }
    }
}

#[async_trait]
impl<A> JobQueueClient<A> for KubeJobQueueClient<A>
where
    A: QueueableJob,
    A::Object: Resource<Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync,
    <A::Object as Resource>::DynamicType: Default,
{
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<A>> {
        let api: Api<A::Object> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.map(A::from_object))
    }

    async fn update_job(&self, job: &A) -> Result<()> {
        let meta = job.metadata();
        let namespace = meta.namespace.as_deref().unwrap_or_default();
        let name = meta.name.as_deref().unwrap_or_default();
        let api: Api<A::Object> = Api::namespaced(self.client.clone(), namespace);
        api.replace(name, &PostParams::default(), job.object())
            .await?;
        Ok(())
    }

    async fn update_job_status(&self, job: &A) -> Result<()> {
        let meta = job.metadata();
        let namespace = meta.namespace.as_deref().unwrap_or_default();
        let name = meta.name.as_deref().unwrap_or_default();
        let api: Api<A::Object> = Api::namespaced(self.client.clone(), namespace);
        let data = serde_json::to_vec(job.object())
            .map_err(|e| crate::Error::serialization(e.to_string()))?;
        api.replace_status(name, &PostParams::default(), data)
            .await?;
        Ok(())
    }

    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Option<Workload>> {
        let api: Api<Workload> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_owned_workloads(
        &self,
        namespace: &str,
        owner_uid: &str,
    ) -> Result<Vec<Workload>> {
        // The job-uid label is only advisory (it is omitted for oversize
        // UIDs), so ownership is always established from the controller
        // owner reference.
        let api: Api<Workload> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter(|wl| {
                controller_owner(&wl.metadata).is_some_and(|owner| owner.uid == owner_uid)
            })
            .collect())
    }

    async fn create_workload(&self, workload: &Workload) -> Result<()> {
        let namespace = workload.namespace().unwrap_or_default();
        let api: Api<Workload> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), workload).await?;
        Ok(())
    }

    async fn delete_workload(&self, workload: &Workload) -> Result<()> {
        let namespace = workload.namespace().unwrap_or_default();
        let api: Api<Workload> = Api::namespaced(self.client.clone(), &namespace);
        match api.delete(&workload.name_any(), &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_workload(&self, workload: &Workload) -> Result<()> {
        let namespace = workload.namespace().unwrap_or_default();
        let api: Api<Workload> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&workload.name_any(), &PostParams::default(), workload)
            .await?;
        Ok(())
    }

    async fn update_workload_status(&self, workload: &Workload) -> Result<()> {
        let namespace = workload.namespace().unwrap_or_default();
        let api: Api<Workload> = Api::namespaced(self.client.clone(), &namespace);
        let status_patch = serde_json::json!({ "status": workload.status });
        api.patch_status(
            &workload.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch),
        )
        .await?;
        Ok(())
    }

    async fn get_priority_class(&self, name: &str) -> Result<Option<PriorityClass>> {
        let api: Api<PriorityClass> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn get_workload_priority_class(
        &self,
        name: &str,
    ) -> Result<Option<WorkloadPriorityClass>> {
        let api: Api<WorkloadPriorityClass> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }
}
