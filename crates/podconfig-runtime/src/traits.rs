use crate::error::{Result, RuntimeError};
use crate::types::{AppliedLink, WorkloadOutcome};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use podconfig_core::{AttachmentSpec, PodConfig, PodConfigStatus, VlanSpec};
use std::collections::BTreeMap;

/// Storage of PodConfig objects
///
/// Writes carry the resourceVersion of the object they were computed from and
/// fail with `RuntimeError::Conflict` when someone else wrote in between.
#[async_trait]
pub trait PodConfigStore: Send + Sync {
    /// List PodConfigs in one namespace, or all of them
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<PodConfig>>;

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<PodConfig>>;

    /// Replace the finalizer list, returning the updated object
    async fn set_finalizers(&self, podconfig: &PodConfig, finalizers: Vec<String>)
        -> Result<PodConfig>;

    /// Replace the status, returning the updated object
    async fn update_status(
        &self,
        podconfig: &PodConfig,
        status: &PodConfigStatus,
    ) -> Result<PodConfig>;
}

/// Read access to the cluster's pods
#[async_trait]
pub trait PodInventory: Send + Sync {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;
}

/// Creates the sample Deployment
#[async_trait]
pub trait WorkloadCreator: Send + Sync {
    async fn create_workload(
        &self,
        owner: &OwnerReference,
        name: &str,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<WorkloadOutcome>;
}

/// Maps container ids to the pid of their init process
#[async_trait]
pub trait ProcessResolver: Send + Sync {
    /// Resolve a batch over one runtime connection. The outer error means the
    /// runtime could not be reached at all; inner results are per container.
    async fn resolve_pids(&self, container_ids: &[String]) -> Result<Vec<Result<u32>>>;

    async fn resolve_pid(&self, container_id: &str) -> Result<u32> {
        let mut results = self.resolve_pids(&[container_id.to_string()]).await?;
        results
            .pop()
            .unwrap_or_else(|| Err(RuntimeError::internal_error("resolver returned no result")))
    }
}

/// Applies and removes pod interfaces
#[async_trait]
pub trait NetworkAttacher: Send + Sync {
    /// Apply attachments in order, stopping at the first failure
    async fn apply_attachments(
        &self,
        pid: u32,
        attachments: &[AttachmentSpec],
    ) -> Result<Vec<AppliedLink>>;

    /// Create VLAN sub-interfaces, returning their names
    async fn apply_vlans(&self, pid: u32, vlans: &[VlanSpec]) -> Result<Vec<String>>;

    /// Whether every named link exists in the pod namespace of `pid`
    async fn has_links(&self, pid: u32, names: &[String]) -> Result<bool>;

    /// Remove everything `apply_*` would have created when called with
    /// `link_pid`, working inside the namespace of `pid`
    async fn teardown(
        &self,
        pid: u32,
        link_pid: u32,
        attachments: &[AttachmentSpec],
        vlans: &[VlanSpec],
    ) -> Result<()>;
}
