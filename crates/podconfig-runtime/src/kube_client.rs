use crate::error::{Result, RuntimeError};
use crate::traits::{PodConfigStore, PodInventory, WorkloadCreator};
use crate::types::WorkloadOutcome;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use podconfig_core::{PodConfig, PodConfigStatus};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Replicas of the sample Deployment
pub const SAMPLE_REPLICAS: i32 = 2;

fn map_kube_error(resource: &str, e: kube::Error) -> RuntimeError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => RuntimeError::not_found("object", resource),
        kube::Error::Api(ae) if ae.code == 409 => RuntimeError::conflict(resource),
        other => RuntimeError::api_error(format!("{}: {}", resource, other)),
    }
}

/// Kubernetes-backed store, pod inventory and workload creator
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    sample_image: String,
}

impl KubeClient {
    pub fn new(client: Client, sample_image: impl Into<String>) -> Self {
        Self {
            client,
            sample_image: sample_image.into(),
        }
    }

    /// Connect using in-cluster config or the local kubeconfig
    pub async fn try_default(sample_image: impl Into<String>) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| RuntimeError::api_error(format!("failed to create client: {}", e)))?;
        info!("Connected to Kubernetes API server");
        Ok(Self::new(client, sample_image))
    }

    fn podconfigs(&self, namespace: &str) -> Api<PodConfig> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// The sample Deployment: a sleeping netshoot pod carrying the selector labels
    pub fn sample_deployment(
        &self,
        owner: &OwnerReference,
        name: &str,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(labels.clone()),
                owner_references: Some(vec![owner.clone()]),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(SAMPLE_REPLICAS),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels.clone()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "netshoot".to_string(),
                            image: Some(self.sample_image.clone()),
                            command: Some(vec![
                                "/bin/bash".to_string(),
                                "-c".to_string(),
                                "--".to_string(),
                            ]),
                            args: Some(vec!["while true; do sleep 30; done;".to_string()]),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl PodConfigStore for KubeClient {
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<PodConfig>> {
        let api: Api<PodConfig> = match namespace {
            Some(ns) => self.podconfigs(ns),
            None => Api::all(self.client.clone()),
        };
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| map_kube_error("podconfigs", e))?;
        Ok(list.items)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<PodConfig>> {
        self.podconfigs(namespace)
            .get_opt(name)
            .await
            .map_err(|e| map_kube_error(&format!("{}/{}", namespace, name), e))
    }

    async fn set_finalizers(
        &self,
        podconfig: &PodConfig,
        finalizers: Vec<String>,
    ) -> Result<PodConfig> {
        let name = podconfig.name_checked()?;
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": podconfig.metadata.resource_version,
            }
        });
        debug!("Setting finalizers on {}: {:?}", podconfig.key(), finalizers);
        self.podconfigs(podconfig.namespace_or_default())
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_error(&podconfig.key(), e))
    }

    async fn update_status(
        &self,
        podconfig: &PodConfig,
        status: &PodConfigStatus,
    ) -> Result<PodConfig> {
        let name = podconfig.name_checked()?;
        let patch = json!({
            "metadata": { "resourceVersion": podconfig.metadata.resource_version },
            "status": status,
        });
        self.podconfigs(podconfig.namespace_or_default())
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_error(&podconfig.key(), e))
    }
}

#[async_trait]
impl PodInventory for KubeClient {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| map_kube_error(&format!("pods in {}", namespace), e))?;
        Ok(list.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        pods.get_opt(name)
            .await
            .map_err(|e| map_kube_error(&format!("pod {}/{}", namespace, name), e))
    }
}

#[async_trait]
impl WorkloadCreator for KubeClient {
    async fn create_workload(
        &self,
        owner: &OwnerReference,
        name: &str,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<WorkloadOutcome> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let resource = format!("deployment {}/{}", namespace, name);

        if api
            .get_opt(name)
            .await
            .map_err(|e| map_kube_error(&resource, e))?
            .is_some()
        {
            return Ok(WorkloadOutcome::Exists);
        }

        let deployment = self.sample_deployment(owner, name, namespace, labels);
        match api.create(&PostParams::default(), &deployment).await {
            Ok(_) => {
                info!("Created sample {}", resource);
                Ok(WorkloadOutcome::Created)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(WorkloadOutcome::Exists),
            Err(e) => Err(map_kube_error(&resource, e)),
        }
    }
}
