use crate::error::{Result, RuntimeError};
use crate::network::{AddressAllocator, AddressBlock};
use crate::traits::{
    NetworkAttacher, PodConfigStore, PodInventory, ProcessResolver, WorkloadCreator,
};
use crate::types::*;
use k8s_openapi::api::core::v1::Pod;
use kube::Resource;
use podconfig_core::{
    AddressRecord, LabelSelector, PodConfig, PodConfigPhase, PodConfigStatus,
    PodConfigurationRecord,
};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or_default()
}

/// Parse a persisted address record, warning on anything unusable
fn parse_record(record: &AddressRecord) -> Option<(AddressBlock, Ipv4Addr)> {
    let block = AddressBlock::parse(&record.cidr);
    let ip = record.address.parse::<Ipv4Addr>();
    match (block, ip) {
        (Ok(block), Ok(ip)) => Some((block, ip)),
        _ => {
            warn!(
                "Ignoring malformed address record {} in {} for {}",
                record.address, record.cidr, record.link
            );
            None
        }
    }
}

/// Removes its key from the in-flight set on drop
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

/// Drives every PodConfig towards its declared pod interfaces
///
/// A pass lists the selected pods, attaches the requested interfaces to the
/// ones not yet recorded in status, and records what it did. Deletion is
/// gated by a finalizer that is only removed once the interfaces are gone.
pub struct PodConfigController {
    store: Arc<dyn PodConfigStore>,
    pods: Arc<dyn PodInventory>,
    workloads: Arc<dyn WorkloadCreator>,
    resolver: Arc<dyn ProcessResolver>,
    attacher: Arc<dyn NetworkAttacher>,
    allocator: Arc<AddressAllocator>,
    config: ControllerConfig,
    in_flight: Mutex<HashSet<String>>,
    primed: OnceCell<()>,
}

impl PodConfigController {
    pub fn new(
        store: Arc<dyn PodConfigStore>,
        pods: Arc<dyn PodInventory>,
        workloads: Arc<dyn WorkloadCreator>,
        resolver: Arc<dyn ProcessResolver>,
        attacher: Arc<dyn NetworkAttacher>,
        allocator: Arc<AddressAllocator>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            pods,
            workloads,
            resolver,
            attacher,
            allocator,
            config,
            in_flight: Mutex::new(HashSet::new()),
            primed: OnceCell::new(),
        }
    }

    /// Resync every PodConfig until the token is cancelled
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!(
            "Starting PodConfig controller (namespace: {}, resync every {:?})",
            self.config.namespace.as_deref().unwrap_or("all"),
            self.config.resync_interval
        );

        loop {
            let requeue = self.reconcile_all().await;
            let wait = requeue.map_or(self.config.resync_interval, |d| {
                d.min(self.config.resync_interval)
            });

            tokio::select! {
                _ = token.cancelled() => {
                    info!("PodConfig controller shutting down");
                    break;
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        Ok(())
    }

    /// Reconcile every PodConfig once, returning the soonest requested requeue
    pub async fn reconcile_all(&self) -> Option<Duration> {
        let podconfigs = match self.store.list(self.config.namespace.as_deref()).await {
            Ok(list) => list,
            Err(e) => {
                error!("Failed to list PodConfigs: {}", e);
                return None;
            }
        };

        if podconfigs.is_empty() {
            debug!("No PodConfigs to reconcile");
            return None;
        }

        let mut soonest: Option<Duration> = None;
        for podconfig in podconfigs {
            let Some(name) = podconfig.metadata.name.as_deref() else {
                continue;
            };
            match self.reconcile(podconfig.namespace_or_default(), name).await {
                Ok(ReconcileAction::Done) => {}
                Ok(ReconcileAction::RequeueAfter(after)) => {
                    soonest = Some(soonest.map_or(after, |s| s.min(after)));
                }
                Err(e) => error!("Failed to reconcile PodConfig {}: {}", podconfig.key(), e),
            }
        }

        soonest
    }

    /// Reconcile a single PodConfig
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<ReconcileAction> {
        let key = format!("{}/{}", namespace, name);
        let Some(_guard) = self.begin(&key) else {
            debug!("PodConfig {} is already being reconciled", key);
            return Ok(self.requeue());
        };

        self.primed.get_or_try_init(|| self.prime_allocator()).await?;

        let Some(podconfig) = self.store.get(namespace, name).await? else {
            debug!("PodConfig {} no longer exists", key);
            return Ok(ReconcileAction::Done);
        };

        if podconfig.is_deleting() {
            if podconfig.has_finalizer() {
                self.finalize(podconfig).await?;
            }
            return Ok(ReconcileAction::Done);
        }

        match self.converge(podconfig).await {
            Err(e) if e.is_permanent() => {
                warn!("PodConfig {} is invalid, waiting for a fix: {}", key, e);
                Ok(ReconcileAction::Done)
            }
            other => other,
        }
    }

    fn begin(&self, key: &str) -> Option<InFlight<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(key.to_string()) {
            return None;
        }
        Some(InFlight {
            set: &self.in_flight,
            key: key.to_string(),
        })
    }

    /// Reserve the addresses recorded by every PodConfig before the first
    /// pass hands any out
    async fn prime_allocator(&self) -> Result<()> {
        let podconfigs = self.store.list(self.config.namespace.as_deref()).await?;
        let mut reserved = 0;
        for podconfig in &podconfigs {
            reserved += self.reserve_addresses(podconfig.status_or_default().addresses());
        }
        info!(
            "Reserved {} recorded address(es) from {} PodConfig(s)",
            reserved,
            podconfigs.len()
        );
        Ok(())
    }

    /// Mark recorded addresses in use, returning how many were newly reserved
    fn reserve_addresses<'a>(
        &self,
        records: impl IntoIterator<Item = &'a AddressRecord>,
    ) -> usize {
        let mut reserved = 0;
        for record in records {
            let Some((block, ip)) = parse_record(record) else {
                continue;
            };
            match self.allocator.reserve(&block, ip) {
                Ok(true) => reserved += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    "Cannot reserve {} in {} for {}: {}",
                    record.address, record.cidr, record.link, e
                ),
            }
        }
        reserved
    }

    fn requeue(&self) -> ReconcileAction {
        ReconcileAction::RequeueAfter(self.config.requeue_after)
    }

    /// Validate the spec and return its pod selector
    fn checked_selector(podconfig: &PodConfig) -> Result<String> {
        podconfig.spec.validate()?;
        let selector = podconfig.selector()?;
        LabelSelector::parse(&selector)?;
        Ok(selector)
    }

    async fn converge(&self, podconfig: PodConfig) -> Result<ReconcileAction> {
        let selector = Self::checked_selector(&podconfig)?;
        let namespace = podconfig.namespace_or_default().to_string();
        let name = podconfig.name_checked()?.to_string();
        let key = podconfig.key();

        let podconfig = if podconfig.has_finalizer() {
            podconfig
        } else {
            info!("Adding finalizer to PodConfig {}", key);
            self.store
                .set_finalizers(&podconfig, podconfig.finalizers_with_ours())
                .await?
        };

        if podconfig.spec.sample_deployment.create {
            self.ensure_sample_workload(&podconfig).await?;
        }

        let pods = self.pods.list_pods(&namespace, &selector).await?;
        if pods.is_empty() {
            info!("No pods match {} for PodConfig {}, requeueing", selector, key);
            return Ok(self.requeue());
        }
        if let Some(pod) = pods.iter().find(|p| !is_running(p)) {
            info!(
                "Pod {} is {}, deferring PodConfig {}",
                pod_name(pod),
                pod_phase(pod),
                key
            );
            return Ok(self.requeue());
        }

        let live: HashSet<String> = pods.iter().map(|p| pod_name(p).to_string()).collect();
        let status = podconfig.status_or_default();
        self.prune_records(&namespace, &name, &status, &live).await?;

        self.reserve_addresses(
            status
                .pod_configurations
                .iter()
                .filter(|r| live.contains(&r.pod_name))
                .flat_map(|r| r.addresses.iter()),
        );

        let mut targets: Vec<(&str, String)> = Vec::with_capacity(pods.len());
        for pod in &pods {
            match primary_container_id(pod) {
                Some(id) => targets.push((pod_name(pod), id.to_string())),
                None if status.is_recorded(pod_name(pod)) => {
                    debug!("Pod {} has no container id, keeping its record", pod_name(pod));
                }
                None => {
                    info!("Pod {} has no container id yet, deferring", pod_name(pod));
                    return Ok(self.requeue());
                }
            }
        }

        let pending = self.pending_pods(&status, &targets).await?;
        if pending.is_empty() {
            self.mutate_status(&namespace, &name, |s| {
                s.set_phase(PodConfigPhase::Configured)
            })
            .await?;
            debug!("PodConfig {} is converged", key);
            return Ok(ReconcileAction::Done);
        }

        self.mutate_status(&namespace, &name, |s| {
            s.set_phase(PodConfigPhase::Configuring)
        })
        .await?;

        for &(pod, pid) in &pending {
            if let Some(previous) = status.record(pod) {
                info!(
                    "Pod {} came back as pid {} without its links, reconfiguring",
                    pod, pid
                );
                self.release_addresses(&previous.addresses)?;
            }
            let record = self.configure_pod(&podconfig, pod, pid).await?;
            self.mutate_status(&namespace, &name, move |s| s.upsert_pod(record))
                .await?;
        }

        self.mutate_status(&namespace, &name, |s| {
            s.set_phase(PodConfigPhase::Configured)
        })
        .await?;
        info!(
            "PodConfig {} configured on {} pod(s)",
            key,
            pending.len()
        );

        Ok(ReconcileAction::Done)
    }

    /// Resolve pids and pick the pods that need configuring
    ///
    /// A recorded pod is configured again only when its container runs under
    /// a new pid and the recorded links are missing from its namespace.
    async fn pending_pods<'a>(
        &self,
        status: &PodConfigStatus,
        targets: &[(&'a str, String)],
    ) -> Result<Vec<(&'a str, u32)>> {
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = targets.iter().map(|(_, id)| id.clone()).collect();
        let pids = self.resolver.resolve_pids(&ids).await?;
        if pids.len() != targets.len() {
            return Err(RuntimeError::internal_error(format!(
                "asked for {} pids, got {}",
                targets.len(),
                pids.len()
            )));
        }

        let mut pending = Vec::new();
        for (&(pod, _), pid) in targets.iter().zip(pids) {
            let Some(record) = status.record(pod) else {
                pending.push((pod, pid?));
                continue;
            };
            let pid = match pid {
                Ok(pid) => pid,
                Err(e) => {
                    warn!("Cannot check configured pod {}: {}", pod, e);
                    continue;
                }
            };
            match record.pid {
                Some(recorded) if recorded != pid => {
                    if self.attacher.has_links(pid, &record.config_list).await? {
                        debug!("Pod {} runs as pid {} with its links intact", pod, pid);
                    } else {
                        pending.push((pod, pid));
                    }
                }
                _ => {}
            }
        }
        Ok(pending)
    }

    async fn configure_pod(
        &self,
        podconfig: &PodConfig,
        pod: &str,
        pid: u32,
    ) -> Result<PodConfigurationRecord> {
        let links = self
            .attacher
            .apply_attachments(pid, &podconfig.spec.network_attachments)
            .await?;
        let vlans = self.attacher.apply_vlans(pid, &podconfig.spec.vlans).await?;

        let addresses = links.iter().filter_map(AppliedLink::address_record).collect();
        let mut config_list: Vec<String> = links.into_iter().map(|l| l.name).collect();
        config_list.extend(vlans);

        info!("Configured pod {} (pid {}): {:?}", pod, pid, config_list);
        Ok(PodConfigurationRecord {
            pod_name: pod.to_string(),
            pid: Some(pid),
            config_list,
            addresses,
        })
    }

    async fn ensure_sample_workload(&self, podconfig: &PodConfig) -> Result<()> {
        let owner = podconfig.controller_owner_ref(&()).ok_or_else(|| {
            RuntimeError::internal_error(format!("PodConfig {} has no uid", podconfig.key()))
        })?;
        let labels = podconfig.selector_labels()?;
        let name = podconfig.spec.sample_deployment.workload_name();

        match self
            .workloads
            .create_workload(&owner, name, podconfig.namespace_or_default(), &labels)
            .await?
        {
            WorkloadOutcome::Created => info!(
                "Created sample workload {} for PodConfig {}",
                name,
                podconfig.key()
            ),
            WorkloadOutcome::Exists => debug!("Sample workload {} already exists", name),
        }
        Ok(())
    }

    /// Drop records of pods that are no longer selected and free their addresses
    async fn prune_records(
        &self,
        namespace: &str,
        name: &str,
        status: &PodConfigStatus,
        live: &HashSet<String>,
    ) -> Result<()> {
        let stale: Vec<&PodConfigurationRecord> = status
            .pod_configurations
            .iter()
            .filter(|r| !live.contains(&r.pod_name))
            .collect();
        if stale.is_empty() {
            return Ok(());
        }

        self.mutate_status(namespace, name, |s| {
            !s.prune(|pod| live.contains(pod)).is_empty()
        })
        .await?;

        for record in stale {
            info!(
                "Pod {} is no longer selected by {}/{}, dropping its record",
                record.pod_name, namespace, name
            );
            self.release_addresses(&record.addresses)?;
        }
        Ok(())
    }

    fn release_addresses(&self, records: &[AddressRecord]) -> Result<()> {
        for (block, ip) in records.iter().filter_map(parse_record) {
            self.allocator.release(&block, ip)?;
        }
        Ok(())
    }

    /// Re-read the object, apply `f` to its status and write only on change
    async fn mutate_status<F>(&self, namespace: &str, name: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut PodConfigStatus) -> bool + Send,
    {
        let current = self.store.get(namespace, name).await?.ok_or_else(|| {
            RuntimeError::not_found("PodConfig", format!("{}/{}", namespace, name))
        })?;

        let mut status = current.status_or_default();
        if f(&mut status) {
            self.store.update_status(&current, &status).await?;
        }
        Ok(())
    }

    /// Tear down pod interfaces, free addresses and drop the finalizer
    async fn finalize(&self, podconfig: PodConfig) -> Result<()> {
        let key = podconfig.key();
        info!("PodConfig {} is being deleted, tearing down", key);

        match Self::checked_selector(&podconfig) {
            Ok(selector) => self.teardown_pods(&podconfig, &selector).await?,
            Err(e) => warn!(
                "PodConfig {} is invalid, skipping interface teardown: {}",
                key, e
            ),
        }

        for record in &podconfig.status_or_default().pod_configurations {
            self.release_addresses(&record.addresses)?;
        }

        self.store
            .set_finalizers(&podconfig, podconfig.finalizers_without_ours())
            .await?;
        info!("Removed finalizer from PodConfig {}", key);
        Ok(())
    }

    async fn teardown_pods(&self, podconfig: &PodConfig, selector: &str) -> Result<()> {
        let pods = self
            .pods
            .list_pods(podconfig.namespace_or_default(), selector)
            .await?;

        let status = podconfig.status_or_default();
        let mut targets: Vec<(&str, String)> = Vec::new();
        for pod in pods.iter().filter(|p| is_running(p)) {
            match primary_container_id(pod) {
                Some(id) => targets.push((pod_name(pod), id.to_string())),
                None => debug!("Pod {} has no container, nothing to tear down", pod_name(pod)),
            }
        }
        if targets.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = targets.iter().map(|(_, id)| id.clone()).collect();
        let pids = self.resolver.resolve_pids(&ids).await?;

        for ((pod, _), pid) in targets.iter().zip(pids) {
            let pid = match pid {
                Ok(pid) => pid,
                Err(e) if e.is_not_found() => {
                    warn!("Container of pod {} is gone, skipping teardown: {}", pod, e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let link_pid = status.record(pod).and_then(|r| r.pid).unwrap_or(pid);

            match self
                .attacher
                .teardown(
                    pid,
                    link_pid,
                    &podconfig.spec.network_attachments,
                    &podconfig.spec.vlans,
                )
                .await
            {
                Ok(()) => debug!("Tore down pod {} (pid {})", pod, pid),
                Err(RuntimeError::NamespaceOpen { .. }) => {
                    warn!("Pod {} exited before teardown", pod);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::AttachmentEngine;
    use crate::mock::{MockCluster, MockNetwork, MockProcessResolver};
    use crate::netns::NetnsTarget;
    use crate::network::LinkKind;
    use ipnetwork::Ipv4Network;
    use podconfig_core::{AttachmentKind, AttachmentSpec, PodConfigSpec, VlanSpec};

    const PID: u32 = 4242;

    struct Harness {
        cluster: MockCluster,
        resolver: Arc<MockProcessResolver>,
        net: MockNetwork,
        allocator: Arc<AddressAllocator>,
        controller: PodConfigController,
    }

    fn controller_for(
        cluster: &MockCluster,
        resolver: &Arc<MockProcessResolver>,
        net: &MockNetwork,
        allocator: &Arc<AddressAllocator>,
    ) -> PodConfigController {
        let engine = AttachmentEngine::new(Arc::new(net.clone()), allocator.clone());
        PodConfigController::new(
            Arc::new(cluster.clone()),
            Arc::new(cluster.clone()),
            Arc::new(cluster.clone()),
            resolver.clone(),
            Arc::new(engine),
            allocator.clone(),
            ControllerConfig::default(),
        )
    }

    fn harness() -> Harness {
        let cluster = MockCluster::new();
        let resolver = Arc::new(MockProcessResolver::new());
        let net = MockNetwork::new();
        let allocator = Arc::new(AddressAllocator::new());
        let controller = controller_for(&cluster, &resolver, &net, &allocator);
        Harness {
            cluster,
            resolver,
            net,
            allocator,
            controller,
        }
    }

    fn net0_spec() -> PodConfigSpec {
        PodConfigSpec {
            network_attachments: vec![AttachmentSpec {
                name: "net0".to_string(),
                kind: AttachmentKind::Veth,
                parent: None,
                master: "br0".to_string(),
                cidr: "192.168.100.0/24".to_string(),
            }],
            ..Default::default()
        }
    }

    fn block() -> AddressBlock {
        AddressBlock::parse("192.168.100.0/24").unwrap()
    }

    impl Harness {
        async fn add_podconfig(&self, spec: PodConfigSpec) {
            self.cluster
                .insert_podconfig(PodConfig::new("pc", spec))
                .await;
        }

        /// A running pod selected by "podconfig=pc" whose namespace has eth0
        async fn add_pod(&self, name: &str, container: &str, pid: u32) {
            self.add_pod_for("pc", name, container, pid).await;
        }

        async fn add_pod_for(&self, podconfig: &str, name: &str, container: &str, pid: u32) {
            self.cluster
                .insert_pod(
                    "default",
                    name,
                    &[("podconfig", podconfig)],
                    "Running",
                    Some(&format!("cri-o://{}", container)),
                )
                .await;
            self.resolver.set_pid(container, pid).await;
            self.net.add_namespace(pid);
            self.net
                .add_link(NetnsTarget::Process(pid), "eth0", LinkKind::Veth);
        }

        async fn reconcile(&self) -> Result<ReconcileAction> {
            self.controller.reconcile("default", "pc").await
        }

        async fn status(&self) -> PodConfigStatus {
            self.cluster
                .podconfig("default", "pc")
                .await
                .unwrap()
                .status_or_default()
        }
    }

    #[tokio::test]
    async fn test_configures_running_pod_end_to_end() {
        let h = harness();
        h.add_podconfig(net0_spec()).await;
        h.add_pod("p1", "c1", PID).await;

        assert_eq!(h.reconcile().await.unwrap(), ReconcileAction::Done);

        let pc = h.cluster.podconfig("default", "pc").await.unwrap();
        assert!(pc.has_finalizer());
        let status = pc.status_or_default();
        assert_eq!(status.phase, PodConfigPhase::Configured);
        assert_eq!(status.pod_configurations.len(), 1);
        assert_eq!(status.pod_configurations[0].pod_name, "p1");
        assert_eq!(status.pod_configurations[0].pid, Some(PID));
        assert_eq!(status.pod_configurations[0].config_list, vec!["net0_4242"]);
        assert_eq!(
            status.pod_configurations[0].addresses,
            vec![AddressRecord {
                link: "net0_4242".to_string(),
                cidr: "192.168.100.0/24".to_string(),
                address: "192.168.100.2".to_string(),
            }]
        );

        let bridge = h.net.link(NetnsTarget::Host, "br0").unwrap();
        assert_eq!(bridge.kind, LinkKind::Bridge);
        assert!(bridge.up);
        assert!(bridge.has_address(&"192.168.100.1/24".parse::<Ipv4Network>().unwrap()));

        let pod_link = h.net.link(NetnsTarget::Process(PID), "net0_4242").unwrap();
        assert_eq!(pod_link.addresses.len(), 1);
        let address = pod_link.addresses[0];
        assert!(block().network.contains(address.ip()));
        assert_ne!(address.ip(), block().gateway);

        let host_end = h.net.link(NetnsTarget::Host, "hnet0_4242").unwrap();
        assert_eq!(host_end.master.as_deref(), Some("br0"));
    }

    #[tokio::test]
    async fn test_second_pass_changes_nothing() {
        let h = harness();
        h.add_podconfig(net0_spec()).await;
        h.add_pod("p1", "c1", PID).await;
        h.reconcile().await.unwrap();

        let writes = h.cluster.status_writes().await;
        let mutations = h.net.mutations();

        assert_eq!(h.reconcile().await.unwrap(), ReconcileAction::Done);
        assert_eq!(h.cluster.status_writes().await, writes);
        assert_eq!(h.net.mutations(), mutations);
        assert_eq!(h.status().await.pod_configurations.len(), 1);
    }

    #[tokio::test]
    async fn test_vlan_subinterface() {
        let h = harness();
        h.add_podconfig(PodConfigSpec {
            vlans: vec![VlanSpec {
                parent_interface_name: "eth0".to_string(),
                vlan_id: 8,
                bridge_name: Some("br0".to_string()),
            }],
            ..Default::default()
        })
        .await;
        h.add_pod("p1", "c1", PID).await;

        assert_eq!(h.reconcile().await.unwrap(), ReconcileAction::Done);

        let vlan = h.net.link(NetnsTarget::Process(PID), "eth0.8").unwrap();
        assert_eq!(vlan.kind, LinkKind::Vlan);
        assert_eq!(vlan.parent.as_deref(), Some("eth0"));
        assert_eq!(vlan.vlan_id, Some(8));
        assert_eq!(h.status().await.pod_configurations[0].config_list, vec!["eth0.8"]);
    }

    #[tokio::test]
    async fn test_defers_until_pods_run() {
        let h = harness();
        h.add_podconfig(net0_spec()).await;

        // nothing selected yet
        assert!(matches!(
            h.reconcile().await.unwrap(),
            ReconcileAction::RequeueAfter(_)
        ));

        h.add_pod("p1", "c1", PID).await;
        h.cluster.set_pod_phase("default", "p1", "Pending").await;
        assert_eq!(
            h.reconcile().await.unwrap(),
            ReconcileAction::RequeueAfter(Duration::from_secs(5))
        );
        assert!(h.status().await.pod_configurations.is_empty());
        assert!(h.net.link(NetnsTarget::Host, "br0").is_none());

        h.cluster.set_pod_phase("default", "p1", "Running").await;
        assert_eq!(h.reconcile().await.unwrap(), ReconcileAction::Done);
        assert_eq!(h.status().await.phase, PodConfigPhase::Configured);
    }

    #[tokio::test]
    async fn test_finalizer_kept_while_teardown_fails() {
        let h = harness();
        h.add_podconfig(net0_spec()).await;
        h.add_pod("p1", "c1", PID).await;
        h.reconcile().await.unwrap();

        h.cluster.mark_deleting("default", "pc").await;
        h.net.fail_operation("delete_link");
        assert!(h.reconcile().await.is_err());

        let pc = h.cluster.podconfig("default", "pc").await.unwrap();
        assert!(pc.has_finalizer());
        assert!(h.net.link(NetnsTarget::Process(PID), "net0_4242").is_some());

        h.net.clear_failures();
        assert_eq!(h.reconcile().await.unwrap(), ReconcileAction::Done);
        assert!(h.cluster.podconfig("default", "pc").await.is_none());
        assert!(h.net.link(NetnsTarget::Process(PID), "net0_4242").is_none());
        assert!(h.net.link(NetnsTarget::Host, "hnet0_4242").is_none());
        assert!(h.allocator.in_use(&block()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_skips_vanished_container() {
        let h = harness();
        h.add_podconfig(net0_spec()).await;
        h.add_pod("p1", "c1", PID).await;
        h.reconcile().await.unwrap();

        h.resolver.remove("c1").await;
        h.cluster.mark_deleting("default", "pc").await;

        assert_eq!(h.reconcile().await.unwrap(), ReconcileAction::Done);
        assert!(h.cluster.podconfig("default", "pc").await.is_none());
        assert!(h.allocator.in_use(&block()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_spec_is_not_retried() {
        let h = harness();
        let mut spec = net0_spec();
        spec.network_attachments[0].name = "much-too-long".to_string();
        h.add_podconfig(spec).await;
        h.add_pod("p1", "c1", PID).await;

        assert_eq!(h.reconcile().await.unwrap(), ReconcileAction::Done);
        let pc = h.cluster.podconfig("default", "pc").await.unwrap();
        assert!(!pc.has_finalizer());
        assert!(pc.status.is_none());
        assert_eq!(h.net.mutations(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_reconcile_of_same_object_requeues() {
        let h = harness();
        h.add_podconfig(net0_spec()).await;
        h.add_pod("p1", "c1", PID).await;

        let guard = h.controller.begin("default/pc").unwrap();
        assert!(matches!(
            h.reconcile().await.unwrap(),
            ReconcileAction::RequeueAfter(_)
        ));
        assert!(!h.cluster.podconfig("default", "pc").await.unwrap().has_finalizer());

        drop(guard);
        assert_eq!(h.reconcile().await.unwrap(), ReconcileAction::Done);
    }

    #[tokio::test]
    async fn test_creates_sample_workload() {
        let h = harness();
        let mut spec = net0_spec();
        spec.sample_deployment.create = true;
        h.add_podconfig(spec).await;

        // pods of the new workload are not there yet
        assert!(matches!(
            h.reconcile().await.unwrap(),
            ReconcileAction::RequeueAfter(_)
        ));
        h.reconcile().await.unwrap();

        let workloads = h.cluster.workloads().await;
        assert_eq!(workloads.len(), 1);
        let (name, owner, labels) = &workloads[0];
        assert_eq!(name, "cnf-example");
        assert_eq!(owner.uid, "uid-pc");
        assert_eq!(owner.kind, "PodConfig");
        assert_eq!(labels.get("podconfig").map(String::as_str), Some("pc"));
    }

    #[tokio::test]
    async fn test_recorded_addresses_survive_restart() {
        let h = harness();
        h.add_podconfig(net0_spec()).await;
        h.add_pod("p1", "c1", PID).await;
        h.reconcile().await.unwrap();

        // a fresh process with an empty allocator
        let allocator = Arc::new(AddressAllocator::new());
        let restarted = controller_for(&h.cluster, &h.resolver, &h.net, &allocator);
        h.add_pod("p2", "c2", 4343).await;
        restarted.reconcile("default", "pc").await.unwrap();

        let status = h.status().await;
        let p2 = status
            .pod_configurations
            .iter()
            .find(|r| r.pod_name == "p2")
            .unwrap();
        assert_eq!(p2.addresses[0].address, "192.168.100.3");
    }

    #[tokio::test]
    async fn test_restart_reserves_addresses_of_every_podconfig() {
        let h = harness();
        h.cluster
            .insert_podconfig(PodConfig::new("b", net0_spec()))
            .await;
        h.add_pod_for("b", "pb", "cb", 4343).await;
        h.controller.reconcile("default", "b").await.unwrap();

        // after a restart, "a" is reconciled before "b" on the shared block
        let allocator = Arc::new(AddressAllocator::new());
        let restarted = controller_for(&h.cluster, &h.resolver, &h.net, &allocator);
        h.cluster
            .insert_podconfig(PodConfig::new("a", net0_spec()))
            .await;
        h.add_pod_for("a", "pa", "ca", PID).await;
        restarted.reconcile("default", "a").await.unwrap();
        restarted.reconcile_all().await;

        let address_of = |pc: PodConfig| {
            pc.status_or_default().pod_configurations[0].addresses[0]
                .address
                .clone()
        };
        let a = h.cluster.podconfig("default", "a").await.unwrap();
        let b = h.cluster.podconfig("default", "b").await.unwrap();
        assert_eq!(address_of(a), "192.168.100.3");
        assert_eq!(address_of(b), "192.168.100.2");

        let pa = h.net.link(NetnsTarget::Process(PID), "net0_4242").unwrap();
        let pb = h.net.link(NetnsTarget::Process(4343), "net0_4343").unwrap();
        assert_ne!(pa.addresses[0].ip(), pb.addresses[0].ip());
        assert_eq!(allocator.in_use(&block()).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_vlan_trunk_finished_after_failed_pass() {
        let h = harness();
        h.add_podconfig(PodConfigSpec {
            vlans: vec![VlanSpec {
                parent_interface_name: "trk".to_string(),
                vlan_id: 100,
                bridge_name: Some("br1".to_string()),
            }],
            ..Default::default()
        })
        .await;
        h.add_pod("p1", "c1", PID).await;

        h.net.fail_operation("set_master");
        assert!(h.reconcile().await.is_err());
        assert!(h.status().await.pod_configurations.is_empty());

        h.net.clear_failures();
        assert_eq!(h.reconcile().await.unwrap(), ReconcileAction::Done);

        let status = h.status().await;
        assert_eq!(status.phase, PodConfigPhase::Configured);
        assert_eq!(status.pod_configurations[0].config_list, vec!["trk.100"]);
        let host_end = h.net.link(NetnsTarget::Host, "htrk_4242").unwrap();
        assert_eq!(host_end.master.as_deref(), Some("br1"));
    }

    #[tokio::test]
    async fn test_deleting_with_overlong_trunk_parent_completes() {
        let h = harness();
        let mut pc = PodConfig::new(
            "pc",
            PodConfigSpec {
                vlans: vec![VlanSpec {
                    parent_interface_name: "enp0s31f6x".to_string(),
                    vlan_id: 10,
                    bridge_name: Some("br1".to_string()),
                }],
                ..Default::default()
            },
        );
        pc.metadata.finalizers = Some(pc.finalizers_with_ours());
        h.cluster.insert_podconfig(pc).await;
        h.add_pod("p1", "c1", PID).await;

        h.cluster.mark_deleting("default", "pc").await;
        assert_eq!(h.reconcile().await.unwrap(), ReconcileAction::Done);
        assert!(h.cluster.podconfig("default", "pc").await.is_none());
    }

    #[tokio::test]
    async fn test_restarted_container_in_fresh_namespace_is_reconfigured() {
        let h = harness();
        h.add_podconfig(net0_spec()).await;
        h.add_pod("p1", "c1", PID).await;
        h.reconcile().await.unwrap();

        // the sandbox was recreated: old links are gone, the pid is new
        h.net.remove_namespace(PID);
        h.resolver.set_pid("c1", 5151).await;
        h.net.add_namespace(5151);
        h.net
            .add_link(NetnsTarget::Process(5151), "eth0", LinkKind::Veth);

        assert_eq!(h.reconcile().await.unwrap(), ReconcileAction::Done);

        let status = h.status().await;
        assert_eq!(status.pod_configurations.len(), 1);
        let record = &status.pod_configurations[0];
        assert_eq!(record.pid, Some(5151));
        assert_eq!(record.config_list, vec!["net0_5151"]);
        assert_eq!(record.addresses[0].address, "192.168.100.2");
        assert!(h.net.link(NetnsTarget::Process(5151), "net0_5151").is_some());
        assert_eq!(h.allocator.in_use(&block()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_restarted_container_keeping_links_is_left_alone() {
        let h = harness();
        h.add_podconfig(net0_spec()).await;
        h.add_pod("p1", "c1", PID).await;
        h.reconcile().await.unwrap();

        // same namespace, new pid: the links still carry the old pid
        h.resolver.set_pid("c1", 5151).await;
        h.net.add_namespace(5151);
        h.net
            .add_link(NetnsTarget::Process(5151), "net0_4242", LinkKind::Veth);
        let mutations = h.net.mutations();

        assert_eq!(h.reconcile().await.unwrap(), ReconcileAction::Done);
        assert_eq!(h.net.mutations(), mutations);
        assert_eq!(h.status().await.pod_configurations[0].pid, Some(PID));

        // teardown finds the links by their recorded names
        h.cluster.mark_deleting("default", "pc").await;
        assert_eq!(h.reconcile().await.unwrap(), ReconcileAction::Done);
        assert!(h.cluster.podconfig("default", "pc").await.is_none());
        assert!(h.net.link(NetnsTarget::Process(5151), "net0_4242").is_none());
    }

    #[tokio::test]
    async fn test_records_of_deleted_pods_are_pruned() {
        let h = harness();
        h.add_podconfig(net0_spec()).await;
        h.add_pod("p1", "c1", PID).await;
        h.reconcile().await.unwrap();

        h.cluster.remove_pod("default", "p1").await;
        h.net.remove_namespace(PID);
        h.add_pod("p2", "c2", 4343).await;
        h.reconcile().await.unwrap();

        let status = h.status().await;
        assert_eq!(status.pod_configurations.len(), 1);
        assert_eq!(status.pod_configurations[0].pod_name, "p2");
        assert_eq!(status.pod_configurations[0].addresses[0].address, "192.168.100.2");
    }

    #[tokio::test]
    async fn test_unreachable_runtime_defers_pod() {
        let h = harness();
        h.add_podconfig(net0_spec()).await;
        h.add_pod("p1", "c1", PID).await;
        h.resolver.set_unreachable(true);

        let err = h.reconcile().await.unwrap_err();
        assert!(matches!(err, RuntimeError::Transport { .. }));
        assert!(h.status().await.pod_configurations.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let h = harness();
        h.add_podconfig(net0_spec()).await;
        h.add_pod("p1", "c1", PID).await;

        let token = CancellationToken::new();
        token.cancel();
        h.controller.run(token).await.unwrap();

        // one pass ran before the token was observed
        assert_eq!(h.status().await.phase, PodConfigPhase::Configured);
    }
}
