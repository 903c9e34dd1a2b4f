pub mod selector;
pub mod validation;

pub use selector::{LabelSelector, Requirement};

use crate::error::{PodConfigError, Result};
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Finalizer guarding teardown of pod interfaces
pub const FINALIZER: &str = "podconfig.opdev.io/finalizer";

/// Label key used to select pods when `selectorLabel` is not set
pub const DEFAULT_SELECTOR_KEY: &str = "podconfig";

/// Name of the sample Deployment when `sampleDeployment.name` is not set
pub const DEFAULT_SAMPLE_NAME: &str = "cnf-example";

/// PodConfig declares extra L2 interfaces to attach to running pods.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "podconfig.opdev.io",
    version = "v1alpha1",
    kind = "PodConfig",
    plural = "podconfigs",
    namespaced,
    status = "PodConfigStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct PodConfigSpec {
    /// Label selector for target pods. Defaults to `podconfig=<name>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector_label: Option<String>,

    /// New interfaces to configure on each pod
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_attachments: Vec<AttachmentSpec>,

    /// VLAN sub-interfaces to add inside each pod
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vlans: Vec<VlanSpec>,

    /// Placeholder workload for trying the operator out
    #[serde(default)]
    pub sample_deployment: SampleWorkload,
}

/// Kind of interface an attachment provisions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    /// veth pair: one end in the pod, the other enslaved to a host bridge
    #[default]
    Veth,
    /// Declared but not provisioned
    Placeholder,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Veth => "veth",
            AttachmentKind::Placeholder => "placeholder",
        }
    }
}

impl std::fmt::Display for AttachmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One requested interface to add to a pod
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentSpec {
    /// Base name of the interface; the pod's pid is appended on creation
    pub name: String,
    /// Interface kind
    #[serde(default, rename = "linkType")]
    pub kind: AttachmentKind,
    /// Parent interface, reserved for kinds stacked on an existing link
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Host bridge the host end is enslaved to
    #[serde(default)]
    pub master: String,
    /// Address block the pod end draws its address from (e.g. "192.168.100.0/24")
    #[serde(default)]
    pub cidr: String,
}

/// A VLAN sub-interface request tied to a parent link in the pod
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VlanSpec {
    /// Parent link inside the pod namespace
    pub parent_interface_name: String,
    /// 802.1Q tag (0-4094)
    #[serde(rename = "vlanID")]
    pub vlan_id: u16,
    /// Host bridge carrying the trunk when the parent has to be created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_name: Option<String>,
}

impl VlanSpec {
    /// Name of the sub-interface: `<parent>.<id>`
    pub fn link_name(&self) -> String {
        format!("{}.{}", self.parent_interface_name, self.vlan_id)
    }
}

/// Sample Deployment toggle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleWorkload {
    #[serde(default)]
    pub create: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl SampleWorkload {
    pub fn workload_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_SAMPLE_NAME)
    }
}

/// Configuration progress of a PodConfig
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PodConfigPhase {
    #[default]
    Unset,
    Configuring,
    Configured,
}

impl std::fmt::Display for PodConfigPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PodConfigPhase::Unset => "unset",
            PodConfigPhase::Configuring => "configuring",
            PodConfigPhase::Configured => "configured",
        };
        write!(f, "{}", s)
    }
}

/// An address handed to a pod link, persisted so it survives controller restarts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressRecord {
    /// Pod-side link holding the address
    pub link: String,
    /// Address block the address was drawn from
    pub cidr: String,
    /// The address itself, without prefix length
    pub address: String,
}

/// Configuration applied to one pod
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodConfigurationRecord {
    pub pod_name: String,
    /// Pid the pod's link names were derived from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default)]
    pub config_list: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<AddressRecord>,
}

/// Observed state of a PodConfig
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodConfigStatus {
    #[serde(default)]
    pub phase: PodConfigPhase,
    #[serde(default)]
    pub pod_configurations: Vec<PodConfigurationRecord>,
}

impl PodConfigStatus {
    pub fn record(&self, pod_name: &str) -> Option<&PodConfigurationRecord> {
        self.pod_configurations
            .iter()
            .find(|r| r.pod_name == pod_name)
    }

    pub fn is_recorded(&self, pod_name: &str) -> bool {
        self.record(pod_name).is_some()
    }

    /// Insert a record or replace the pod's existing one. Returns whether
    /// the status changed.
    pub fn upsert_pod(&mut self, record: PodConfigurationRecord) -> bool {
        match self
            .pod_configurations
            .iter_mut()
            .find(|r| r.pod_name == record.pod_name)
        {
            Some(existing) if *existing == record => false,
            Some(existing) => {
                *existing = record;
                true
            }
            None => {
                self.pod_configurations.push(record);
                true
            }
        }
    }

    /// Set the phase, returning whether it changed
    pub fn set_phase(&mut self, phase: PodConfigPhase) -> bool {
        if self.phase == phase {
            return false;
        }
        self.phase = phase;
        true
    }

    /// Drop records whose pod fails `keep`, returning what was dropped
    pub fn prune(&mut self, keep: impl Fn(&str) -> bool) -> Vec<PodConfigurationRecord> {
        let (kept, dropped): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pod_configurations)
            .into_iter()
            .partition(|r| keep(&r.pod_name));
        self.pod_configurations = kept;
        dropped
    }

    /// All addresses persisted across every pod record
    pub fn addresses(&self) -> impl Iterator<Item = &AddressRecord> {
        self.pod_configurations
            .iter()
            .flat_map(|r| r.addresses.iter())
    }
}

impl PodConfig {
    /// `metadata.name`, required for anything read from the API server
    pub fn name_checked(&self) -> Result<&str> {
        self.metadata
            .name
            .as_deref()
            .ok_or_else(|| PodConfigError::missing_field("metadata.name"))
    }

    pub fn namespace_or_default(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("default")
    }

    /// "namespace/name" key used in logs and in-flight tracking
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.namespace_or_default(),
            self.metadata.name.as_deref().unwrap_or("<unnamed>")
        )
    }

    /// Selector string used to list target pods
    pub fn selector(&self) -> Result<String> {
        match self.spec.selector_label.as_deref() {
            Some(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
            _ => Ok(format!("{}={}", DEFAULT_SELECTOR_KEY, self.name_checked()?)),
        }
    }

    /// Labels a sample workload must carry so the selector matches it
    pub fn selector_labels(&self) -> Result<BTreeMap<String, String>> {
        let selector = self.selector()?;
        LabelSelector::parse(&selector)?.equality_labels(&selector)
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|x| x == FINALIZER))
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Finalizer list with ours added, if it was missing
    pub fn finalizers_with_ours(&self) -> Vec<String> {
        let mut finalizers = self.metadata.finalizers.clone().unwrap_or_default();
        if !finalizers.iter().any(|f| f == FINALIZER) {
            finalizers.push(FINALIZER.to_string());
        }
        finalizers
    }

    /// Finalizer list with ours removed
    pub fn finalizers_without_ours(&self) -> Vec<String> {
        self.metadata
            .finalizers
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != FINALIZER)
            .collect()
    }

    pub fn status_or_default(&self) -> PodConfigStatus {
        self.status.clone().unwrap_or_default()
    }
}
