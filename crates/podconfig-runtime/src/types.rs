use crate::network::AllocatedAddress;
use k8s_openapi::api::core::v1::Pod;
use podconfig_core::AddressRecord;
use std::path::PathBuf;
use std::time::Duration;

/// Default container runtime socket (CRI-O)
pub const DEFAULT_RUNTIME_ENDPOINT: &str = "/var/run/crio/crio.sock";

/// Default sample workload image
pub const DEFAULT_SAMPLE_IMAGE: &str = "nicolaka/netshoot:latest";

/// Configuration for the PodConfig controller and its collaborators
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Only watch PodConfigs in this namespace (all namespaces when `None`)
    pub namespace: Option<String>,
    /// Where the host's /proc is visible (e.g. "/proc", or "/host/proc" in a pod)
    pub proc_root: PathBuf,
    /// Container runtime socket path or `unix://` URL
    pub runtime_endpoint: String,
    /// How often every PodConfig is reconciled
    pub resync_interval: Duration,
    /// Delay before retrying a PodConfig whose pods are not ready
    pub requeue_after: Duration,
    /// Image of the sample Deployment
    pub sample_image: String,
    /// iproute2 binary
    pub ip_binary: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            proc_root: PathBuf::from("/proc"),
            runtime_endpoint: DEFAULT_RUNTIME_ENDPOINT.to_string(),
            resync_interval: Duration::from_secs(10),
            requeue_after: Duration::from_secs(5),
            sample_image: DEFAULT_SAMPLE_IMAGE.to_string(),
            ip_binary: "ip".to_string(),
        }
    }
}

/// What the dispatcher should do after a reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    Done,
    RequeueAfter(Duration),
}

/// A link configured on a pod by one attachment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedLink {
    /// Pod-side link name
    pub name: String,
    pub address: Option<AllocatedAddress>,
}

impl AppliedLink {
    pub fn address_record(&self) -> Option<AddressRecord> {
        self.address.map(|a| AddressRecord {
            link: self.name.clone(),
            cidr: a.block.to_string(),
            address: a.address.to_string(),
        })
    }
}

/// Result of asking for the sample workload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadOutcome {
    Created,
    Exists,
}

/// Pod phase as reported in status, "" when unknown
pub fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("")
}

pub fn is_running(pod: &Pod) -> bool {
    pod_phase(pod) == "Running"
}

/// Container id of the first container that reported one
pub fn primary_container_id(pod: &Pod) -> Option<&str> {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| {
            statuses
                .iter()
                .find_map(|c| c.container_id.as_deref().filter(|id| !id.is_empty()))
        })
}

/// Drop the `<runtime>://` prefix the kubelet puts on container ids
pub fn strip_runtime_scheme(container_id: &str) -> &str {
    container_id
        .split_once("://")
        .map(|(_, id)| id)
        .unwrap_or(container_id)
}
