use crate::error::{Result, RuntimeError};
use crate::netns::{NetnsBackend, NetnsTarget};
use crate::network::{LinkInfo, LinkKind, LinkOps};
use crate::traits::{PodConfigStore, PodInventory, ProcessResolver, WorkloadCreator};
use crate::types::{strip_runtime_scheme, WorkloadOutcome};
use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
use podconfig_core::{LabelSelector, PodConfig, PodConfigStatus};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::RwLock;
use tracing::debug;

// --- Kernel model ---

#[derive(Debug, Clone)]
struct MockLink {
    netns: PathBuf,
    info: LinkInfo,
    peer: Option<u64>,
}

#[derive(Debug, Default)]
struct MockKernel {
    namespaces: HashSet<PathBuf>,
    links: BTreeMap<u64, MockLink>,
    next_id: u64,
    mutations: usize,
    failing: HashSet<String>,
}

impl MockKernel {
    fn find(&self, netns: &Path, name: &str) -> Option<u64> {
        self.links
            .iter()
            .find(|(_, l)| l.netns == netns && l.info.name == name)
            .map(|(id, _)| *id)
    }

    fn insert(&mut self, netns: &Path, info: LinkInfo) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.links.insert(
            id,
            MockLink {
                netns: netns.to_path_buf(),
                info,
                peer: None,
            },
        );
        id
    }

    /// Remove a link, its veth peer and any VLANs stacked on it
    fn remove(&mut self, id: u64) {
        let Some(link) = self.links.remove(&id) else {
            return;
        };
        if let Some(peer) = link.peer {
            self.remove(peer);
        }
        let stacked: Vec<u64> = self
            .links
            .iter()
            .filter(|(_, l)| {
                l.netns == link.netns
                    && l.info.kind == LinkKind::Vlan
                    && l.info.parent.as_deref() == Some(link.info.name.as_str())
            })
            .map(|(id, _)| *id)
            .collect();
        for id in stacked {
            self.remove(id);
        }
    }
}

fn new_link(name: &str, kind: LinkKind) -> LinkInfo {
    LinkInfo {
        name: name.to_string(),
        kind,
        up: false,
        master: None,
        parent: None,
        vlan_id: None,
        addresses: Vec::new(),
    }
}

fn lock_kernel(kernel: &Mutex<MockKernel>) -> MutexGuard<'_, MockKernel> {
    kernel.lock().unwrap_or_else(|e| e.into_inner())
}

/// In-memory model of network namespaces and their links
///
/// Namespaces are keyed by their `<proc_root>/<pid>/ns/net` path; pid 1 (the
/// host) always exists. Every mutating `LinkOps` call bumps a counter so tests
/// can assert that a converged pass changed nothing.
#[derive(Debug, Clone)]
pub struct MockNetwork {
    proc_root: PathBuf,
    kernel: Arc<Mutex<MockKernel>>,
}

impl Default for MockNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MockNetwork {
    pub fn new() -> Self {
        let proc_root = PathBuf::from("/mock/proc");
        let mut kernel = MockKernel::default();
        kernel.namespaces.insert(NetnsTarget::Host.path(&proc_root));
        Self {
            proc_root,
            kernel: Arc::new(Mutex::new(kernel)),
        }
    }

    /// Create a namespace for a process
    pub fn add_namespace(&self, pid: u32) {
        let path = self.namespace_path(NetnsTarget::Process(pid));
        lock_kernel(&self.kernel).namespaces.insert(path);
    }

    /// Simulate the process exiting: its namespace and links disappear
    pub fn remove_namespace(&self, pid: u32) {
        let path = self.namespace_path(NetnsTarget::Process(pid));
        let mut kernel = lock_kernel(&self.kernel);
        kernel.namespaces.remove(&path);
        let ids: Vec<u64> = kernel
            .links
            .iter()
            .filter(|(_, l)| l.netns == path)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            kernel.remove(id);
        }
    }

    /// Add a link without counting it as a mutation
    pub fn add_link(&self, target: NetnsTarget, name: &str, kind: LinkKind) {
        let path = self.namespace_path(target);
        lock_kernel(&self.kernel).insert(&path, new_link(name, kind));
    }

    /// Add an address without counting it as a mutation
    pub fn add_address(&self, target: NetnsTarget, name: &str, address: Ipv4Network) {
        let path = self.namespace_path(target);
        let mut kernel = lock_kernel(&self.kernel);
        if let Some(id) = kernel.find(&path, name) {
            if let Some(link) = kernel.links.get_mut(&id) {
                link.info.addresses.push(address);
            }
        }
    }

    pub fn link(&self, target: NetnsTarget, name: &str) -> Option<LinkInfo> {
        let path = self.namespace_path(target);
        let kernel = lock_kernel(&self.kernel);
        kernel
            .find(&path, name)
            .and_then(|id| kernel.links.get(&id))
            .map(|l| l.info.clone())
    }

    /// Links in a namespace, in creation order
    pub fn links(&self, target: NetnsTarget) -> Vec<LinkInfo> {
        let path = self.namespace_path(target);
        lock_kernel(&self.kernel)
            .links
            .values()
            .filter(|l| l.netns == path)
            .map(|l| l.info.clone())
            .collect()
    }

    /// Number of mutating link operations performed so far
    pub fn mutations(&self) -> usize {
        lock_kernel(&self.kernel).mutations
    }

    /// Make every call of a `LinkOps` method (e.g. "delete_link") fail
    pub fn fail_operation(&self, operation: &str) {
        lock_kernel(&self.kernel)
            .failing
            .insert(operation.to_string());
    }

    pub fn clear_failures(&self) {
        lock_kernel(&self.kernel).failing.clear();
    }
}

impl NetnsBackend for MockNetwork {
    type Links = MockLinks;

    fn proc_root(&self) -> &Path {
        &self.proc_root
    }

    fn with_namespace<R, F>(
        &self,
        target: NetnsTarget,
        f: F,
    ) -> impl Future<Output = Result<R>> + Send
    where
        R: Send + 'static,
        F: FnOnce(&Self::Links) -> Result<R> + Send + 'static,
    {
        let path = self.namespace_path(target);
        let kernel = self.kernel.clone();

        async move {
            if !lock_kernel(&kernel).namespaces.contains(&path) {
                return Err(RuntimeError::namespace_open(
                    path.display().to_string(),
                    "No such file or directory",
                ));
            }
            f(&MockLinks {
                netns: path,
                kernel,
            })
        }
    }
}

/// `LinkOps` over one namespace of a `MockNetwork`
pub struct MockLinks {
    netns: PathBuf,
    kernel: Arc<Mutex<MockKernel>>,
}

impl MockLinks {
    /// Lock the kernel for a mutating operation
    fn mutate(&self, operation: &str, link: &str) -> Result<MutexGuard<'_, MockKernel>> {
        let mut kernel = lock_kernel(&self.kernel);
        if kernel.failing.contains(operation) {
            return Err(RuntimeError::kernel_operation(
                operation,
                link,
                "injected failure",
            ));
        }
        kernel.mutations += 1;
        Ok(kernel)
    }

    fn existing(&self, kernel: &MockKernel, operation: &str, name: &str) -> Result<u64> {
        kernel.find(&self.netns, name).ok_or_else(|| {
            RuntimeError::kernel_operation(operation, name, "Cannot find device")
        })
    }

    fn ensure_free(&self, kernel: &MockKernel, operation: &str, name: &str) -> Result<()> {
        if kernel.find(&self.netns, name).is_some() {
            return Err(RuntimeError::kernel_operation(operation, name, "File exists"));
        }
        Ok(())
    }
}

impl LinkOps for MockLinks {
    fn link(&self, name: &str) -> Result<Option<LinkInfo>> {
        let kernel = lock_kernel(&self.kernel);
        if kernel.failing.contains("link") {
            return Err(RuntimeError::kernel_operation("link", name, "injected failure"));
        }
        Ok(kernel
            .find(&self.netns, name)
            .and_then(|id| kernel.links.get(&id))
            .map(|l| l.info.clone()))
    }

    fn add_bridge(&self, name: &str) -> Result<()> {
        let mut kernel = self.mutate("add_bridge", name)?;
        self.ensure_free(&kernel, "add bridge", name)?;
        kernel.insert(&self.netns, new_link(name, LinkKind::Bridge));
        Ok(())
    }

    fn add_veth(&self, name: &str, peer: &str) -> Result<()> {
        let mut kernel = self.mutate("add_veth", name)?;
        self.ensure_free(&kernel, "add veth", name)?;
        self.ensure_free(&kernel, "add veth", peer)?;

        let mut a = new_link(name, LinkKind::Veth);
        a.parent = Some(peer.to_string());
        let mut b = new_link(peer, LinkKind::Veth);
        b.parent = Some(name.to_string());

        let a_id = kernel.insert(&self.netns, a);
        let b_id = kernel.insert(&self.netns, b);
        if let Some(l) = kernel.links.get_mut(&a_id) {
            l.peer = Some(b_id);
        }
        if let Some(l) = kernel.links.get_mut(&b_id) {
            l.peer = Some(a_id);
        }
        Ok(())
    }

    fn add_vlan(&self, name: &str, parent: &str, vlan_id: u16) -> Result<()> {
        let mut kernel = self.mutate("add_vlan", name)?;
        self.ensure_free(&kernel, "add vlan", name)?;
        self.existing(&kernel, "add vlan", parent)?;

        let mut info = new_link(name, LinkKind::Vlan);
        info.parent = Some(parent.to_string());
        info.vlan_id = Some(vlan_id);
        kernel.insert(&self.netns, info);
        Ok(())
    }

    fn add_address(&self, name: &str, address: Ipv4Network) -> Result<()> {
        let mut kernel = self.mutate("add_address", name)?;
        let id = self.existing(&kernel, "add address", name)?;
        if let Some(link) = kernel.links.get_mut(&id) {
            if !link.info.has_address(&address) {
                link.info.addresses.push(address);
            }
        }
        Ok(())
    }

    fn set_up(&self, name: &str) -> Result<()> {
        let mut kernel = self.mutate("set_up", name)?;
        let id = self.existing(&kernel, "set up", name)?;
        if let Some(link) = kernel.links.get_mut(&id) {
            link.info.up = true;
        }
        Ok(())
    }

    fn set_master(&self, name: &str, master: &str) -> Result<()> {
        let mut kernel = self.mutate("set_master", name)?;
        let id = self.existing(&kernel, "set master", name)?;
        let master_id = self.existing(&kernel, "set master", master)?;
        if kernel.links.get(&master_id).map(|l| &l.info.kind) != Some(&LinkKind::Bridge) {
            return Err(RuntimeError::kernel_operation(
                "set master",
                name,
                format!("{} is not a bridge", master),
            ));
        }
        if let Some(link) = kernel.links.get_mut(&id) {
            link.info.master = Some(master.to_string());
        }
        Ok(())
    }

    fn set_namespace(&self, name: &str, netns: &Path) -> Result<()> {
        let mut kernel = self.mutate("set_namespace", name)?;
        let id = self.existing(&kernel, "set namespace", name)?;
        if !kernel.namespaces.contains(netns) {
            return Err(RuntimeError::kernel_operation(
                "set namespace",
                name,
                format!("Invalid netns {}", netns.display()),
            ));
        }
        if kernel.find(netns, name).is_some() {
            return Err(RuntimeError::kernel_operation("set namespace", name, "File exists"));
        }

        let peer = kernel.links.get(&id).and_then(|l| l.peer);
        if let Some(link) = kernel.links.get_mut(&id) {
            link.netns = netns.to_path_buf();
            link.info.master = None;
            link.info.up = false;
            link.info.addresses.clear();
            link.info.parent = None;
        }
        // peers in different namespaces no longer show each other's name
        if let Some(peer) = peer.and_then(|p| kernel.links.get_mut(&p)) {
            peer.info.parent = None;
        }
        Ok(())
    }

    fn delete_link(&self, name: &str) -> Result<()> {
        let mut kernel = self.mutate("delete_link", name)?;
        if let Some(id) = kernel.find(&self.netns, name) {
            kernel.remove(id);
        }
        Ok(())
    }
}

// --- Cluster model ---

#[derive(Debug, Default)]
struct ClusterState {
    podconfigs: BTreeMap<(String, String), PodConfig>,
    pods: BTreeMap<(String, String), Pod>,
    workloads: BTreeMap<(String, String), (OwnerReference, BTreeMap<String, String>)>,
    next_version: u64,
    status_writes: usize,
}

impl ClusterState {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

fn object_key(podconfig: &PodConfig) -> (String, String) {
    (
        podconfig.namespace_or_default().to_string(),
        podconfig.metadata.name.clone().unwrap_or_default(),
    )
}

/// In-memory API server for PodConfigs, pods and sample workloads
///
/// Writes enforce resourceVersion like the real API server, and an object
/// marked for deletion disappears once its last finalizer is removed.
#[derive(Debug, Clone, Default)]
pub struct MockCluster {
    state: Arc<RwLock<ClusterState>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a PodConfig, filling in namespace, uid and resourceVersion
    pub async fn insert_podconfig(&self, mut podconfig: PodConfig) {
        let mut state = self.state.write().await;
        if podconfig.metadata.namespace.is_none() {
            podconfig.metadata.namespace = Some("default".to_string());
        }
        if podconfig.metadata.uid.is_none() {
            podconfig.metadata.uid = Some(format!(
                "uid-{}",
                podconfig.metadata.name.as_deref().unwrap_or_default()
            ));
        }
        podconfig.metadata.resource_version = Some(state.bump());
        state.podconfigs.insert(object_key(&podconfig), podconfig);
    }

    pub async fn podconfig(&self, namespace: &str, name: &str) -> Option<PodConfig> {
        let state = self.state.read().await;
        state
            .podconfigs
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Set the deletion timestamp, deleting outright when there are no finalizers
    pub async fn mark_deleting(&self, namespace: &str, name: &str) {
        let mut state = self.state.write().await;
        let key = (namespace.to_string(), name.to_string());
        let version = state.bump();
        let Some(pc) = state.podconfigs.get_mut(&key) else {
            return;
        };
        if pc.metadata.finalizers.as_ref().is_none_or(|f| f.is_empty()) {
            state.podconfigs.remove(&key);
            return;
        }
        pc.metadata.deletion_timestamp =
            serde_json::from_value::<Time>(serde_json::json!("2026-01-01T00:00:00Z")).ok();
        pc.metadata.resource_version = Some(version);
    }

    /// Store a pod with the given labels, phase and container id
    pub async fn insert_pod(
        &self,
        namespace: &str,
        name: &str,
        labels: &[(&str, &str)],
        phase: &str,
        container_id: Option<&str>,
    ) {
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_string());
        pod.metadata.namespace = Some(namespace.to_string());
        pod.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        pod.status = Some(PodStatus {
            phase: Some(phase.to_string()),
            container_statuses: container_id.map(|id| {
                vec![k8s_openapi::api::core::v1::ContainerStatus {
                    name: "main".to_string(),
                    container_id: Some(id.to_string()),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        });

        let mut state = self.state.write().await;
        state
            .pods
            .insert((namespace.to_string(), name.to_string()), pod);
    }

    pub async fn set_pod_phase(&self, namespace: &str, name: &str, phase: &str) {
        let mut state = self.state.write().await;
        if let Some(status) = state
            .pods
            .get_mut(&(namespace.to_string(), name.to_string()))
            .and_then(|p| p.status.as_mut())
        {
            status.phase = Some(phase.to_string());
        }
    }

    pub async fn remove_pod(&self, namespace: &str, name: &str) {
        let mut state = self.state.write().await;
        state
            .pods
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Names of created sample workloads with their labels and owner
    pub async fn workloads(&self) -> Vec<(String, OwnerReference, BTreeMap<String, String>)> {
        let state = self.state.read().await;
        state
            .workloads
            .iter()
            .map(|((_, name), (owner, labels))| (name.clone(), owner.clone(), labels.clone()))
            .collect()
    }

    pub async fn status_writes(&self) -> usize {
        self.state.read().await.status_writes
    }

    fn check_version(stored: &PodConfig, given: &PodConfig) -> Result<()> {
        if stored.metadata.resource_version != given.metadata.resource_version {
            return Err(RuntimeError::conflict(given.key()));
        }
        Ok(())
    }
}

#[async_trait]
impl PodConfigStore for MockCluster {
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<PodConfig>> {
        let state = self.state.read().await;
        Ok(state
            .podconfigs
            .iter()
            .filter(|((ns, _), _)| namespace.is_none_or(|want| want == ns))
            .map(|(_, pc)| pc.clone())
            .collect())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<PodConfig>> {
        Ok(self.podconfig(namespace, name).await)
    }

    async fn set_finalizers(
        &self,
        podconfig: &PodConfig,
        finalizers: Vec<String>,
    ) -> Result<PodConfig> {
        let mut state = self.state.write().await;
        let key = object_key(podconfig);
        let version = state.bump();
        let stored = state
            .podconfigs
            .get_mut(&key)
            .ok_or_else(|| RuntimeError::not_found("PodConfig", podconfig.key()))?;
        Self::check_version(stored, podconfig)?;

        stored.metadata.finalizers = Some(finalizers);
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();

        if updated.is_deleting() && updated.metadata.finalizers.as_ref().is_some_and(|f| f.is_empty()) {
            debug!("Mock: {} deleted after last finalizer", updated.key());
            state.podconfigs.remove(&key);
        }
        Ok(updated)
    }

    async fn update_status(
        &self,
        podconfig: &PodConfig,
        status: &PodConfigStatus,
    ) -> Result<PodConfig> {
        let mut state = self.state.write().await;
        let key = object_key(podconfig);
        let version = state.bump();
        let stored = state
            .podconfigs
            .get_mut(&key)
            .ok_or_else(|| RuntimeError::not_found("PodConfig", podconfig.key()))?;
        Self::check_version(stored, podconfig)?;

        stored.status = Some(status.clone());
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();
        state.status_writes += 1;
        Ok(updated)
    }
}

#[async_trait]
impl PodInventory for MockCluster {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let selector = LabelSelector::parse(selector)?;
        let state = self.state.read().await;
        Ok(state
            .pods
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .filter(|(_, pod)| {
                selector.matches(pod.metadata.labels.as_ref().unwrap_or(&BTreeMap::new()))
            })
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let state = self.state.read().await;
        Ok(state
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}

#[async_trait]
impl WorkloadCreator for MockCluster {
    async fn create_workload(
        &self,
        owner: &OwnerReference,
        name: &str,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<WorkloadOutcome> {
        let mut state = self.state.write().await;
        let key = (namespace.to_string(), name.to_string());
        if state.workloads.contains_key(&key) {
            return Ok(WorkloadOutcome::Exists);
        }
        state
            .workloads
            .insert(key, (owner.clone(), labels.clone()));
        debug!("Mock: workload created: {}/{}", namespace, name);
        Ok(WorkloadOutcome::Created)
    }
}

// --- Container runtime model ---

/// Container id to pid table standing in for the container runtime
#[derive(Debug, Default)]
pub struct MockProcessResolver {
    pids: RwLock<HashMap<String, u32>>,
    unreachable: AtomicBool,
}

impl MockProcessResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a container; the id may carry a runtime scheme
    pub async fn set_pid(&self, container_id: &str, pid: u32) {
        self.pids
            .write()
            .await
            .insert(strip_runtime_scheme(container_id).to_string(), pid);
    }

    pub async fn remove(&self, container_id: &str) {
        self.pids
            .write()
            .await
            .remove(strip_runtime_scheme(container_id));
    }

    /// Make every call fail as if the socket were gone
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProcessResolver for MockProcessResolver {
    async fn resolve_pids(&self, container_ids: &[String]) -> Result<Vec<Result<u32>>> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RuntimeError::transport("mock", "connection refused"));
        }
        let pids = self.pids.read().await;
        Ok(container_ids
            .iter()
            .map(|id| {
                let id = strip_runtime_scheme(id);
                pids.get(id)
                    .copied()
                    .ok_or_else(|| RuntimeError::not_found("container", id))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podconfig_core::{PodConfigSpec, FINALIZER};

    #[tokio::test]
    async fn test_kernel_veth_peer_deleted_with_pod_end() {
        let net = MockNetwork::new();
        net.add_namespace(10);
        let host_path = net.namespace_path(NetnsTarget::Host);

        net.with_namespace(NetnsTarget::Process(10), move |links| {
            links.add_veth("a", "b")?;
            links.set_namespace("b", &host_path)
        })
        .await
        .unwrap();
        assert!(net.link(NetnsTarget::Host, "b").is_some());

        net.with_namespace(NetnsTarget::Process(10), |links| links.delete_link("a"))
            .await
            .unwrap();
        assert!(net.link(NetnsTarget::Host, "b").is_none());
        assert_eq!(net.mutations(), 3);
    }

    #[tokio::test]
    async fn test_kernel_injected_failure() {
        let net = MockNetwork::new();
        net.fail_operation("add_bridge");
        let err = net
            .with_namespace(NetnsTarget::Host, |links| links.add_bridge("br0"))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::KernelOperation { .. }));

        net.clear_failures();
        net.with_namespace(NetnsTarget::Host, |links| links.add_bridge("br0"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cluster_rejects_stale_writes() {
        let cluster = MockCluster::new();
        cluster
            .insert_podconfig(PodConfig::new("pc", PodConfigSpec::default()))
            .await;

        let stale = cluster.podconfig("default", "pc").await.unwrap();
        cluster
            .set_finalizers(&stale, vec![FINALIZER.to_string()])
            .await
            .unwrap();

        let err = cluster
            .update_status(&stale, &PodConfigStatus::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_cluster_deletes_after_last_finalizer() {
        let cluster = MockCluster::new();
        let mut pc = PodConfig::new("pc", PodConfigSpec::default());
        pc.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        cluster.insert_podconfig(pc).await;

        cluster.mark_deleting("default", "pc").await;
        let pc = cluster.podconfig("default", "pc").await.unwrap();
        assert!(pc.is_deleting());

        cluster.set_finalizers(&pc, vec![]).await.unwrap();
        assert!(cluster.podconfig("default", "pc").await.is_none());
    }

    #[tokio::test]
    async fn test_pod_selection_by_label() {
        let cluster = MockCluster::new();
        cluster
            .insert_pod("ns", "p1", &[("podconfig", "pc")], "Running", None)
            .await;
        cluster
            .insert_pod("ns", "p2", &[("app", "other")], "Running", None)
            .await;

        let pods = cluster.list_pods("ns", "podconfig=pc").await.unwrap();
        assert_eq!(pods.len(), 1);
        assert!(cluster.get_pod("ns", "p2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_resolver_strips_scheme() {
        let resolver = MockProcessResolver::new();
        resolver.set_pid("cri-o://abc", 4242).await;

        assert_eq!(resolver.resolve_pid("abc").await.unwrap(), 4242);
        assert_eq!(resolver.resolve_pid("cri-o://abc").await.unwrap(), 4242);
        assert!(resolver.resolve_pid("def").await.unwrap_err().is_not_found());

        resolver.set_unreachable(true);
        assert!(matches!(
            resolver.resolve_pid("abc").await.unwrap_err(),
            RuntimeError::Transport { .. }
        ));
    }
}
