use crate::error::Result;
use crate::netns::{NetnsBackend, NetnsTarget};
use crate::network::{
    host_link_name, pod_link_name, vlan_link_name, AddressAllocator, AddressBlock,
    LinkProvisioner,
};
use crate::traits::NetworkAttacher;
use crate::types::AppliedLink;
use async_trait::async_trait;
use podconfig_core::{AttachmentKind, AttachmentSpec, VlanSpec};
use std::sync::Arc;
use tracing::{debug, info};

/// Drives the link provisioner for each requested attachment and VLAN
pub struct AttachmentEngine<B: NetnsBackend> {
    provisioner: LinkProvisioner<B>,
    allocator: Arc<AddressAllocator>,
}

impl<B: NetnsBackend> AttachmentEngine<B> {
    pub fn new(netns: Arc<B>, allocator: Arc<AddressAllocator>) -> Self {
        Self {
            provisioner: LinkProvisioner::new(netns, allocator.clone()),
            allocator,
        }
    }

    /// bridge -> veth pair -> enslave host end
    async fn apply_veth(&self, pid: u32, attachment: &AttachmentSpec) -> Result<AppliedLink> {
        let block = AddressBlock::parse(&attachment.cidr)?;
        let pod_side = pod_link_name(&attachment.name, pid)?;
        let host_side = host_link_name(&attachment.name, pid)?;

        self.provisioner
            .ensure_bridge(&attachment.master, Some(&block))
            .await?;
        let address = self
            .provisioner
            .create_veth_pair(pid, &pod_side, &host_side, Some(&block))
            .await?;
        self.provisioner
            .attach_to_bridge(&host_side, &attachment.master)
            .await?;

        info!(
            "Attachment {} ready for pid {}: {} via {} ({})",
            attachment.name,
            pid,
            pod_side,
            attachment.master,
            address
                .map(|a| a.to_string())
                .unwrap_or_else(|| "no address".to_string())
        );

        Ok(AppliedLink {
            name: pod_side,
            address,
        })
    }

    /// Address-less veth pair that carries tagged traffic from the pod to a bridge
    async fn ensure_trunk(&self, pid: u32, parent: &str, bridge: &str) -> Result<()> {
        let host_side = host_link_name(parent, pid)?;

        self.provisioner.ensure_bridge(bridge, None).await?;
        self.provisioner
            .create_veth_pair(pid, parent, &host_side, None)
            .await?;
        self.provisioner.attach_to_bridge(&host_side, bridge).await?;

        debug!("Trunk {} for pid {} attached to {}", parent, pid, bridge);
        Ok(())
    }
}

fn trunk_bridge(vlan: &VlanSpec) -> Option<&str> {
    vlan.bridge_name.as_deref().filter(|b| !b.is_empty())
}

#[async_trait]
impl<B: NetnsBackend> NetworkAttacher for AttachmentEngine<B> {
    async fn apply_attachments(
        &self,
        pid: u32,
        attachments: &[AttachmentSpec],
    ) -> Result<Vec<AppliedLink>> {
        let mut applied = Vec::with_capacity(attachments.len());

        for attachment in attachments {
            match attachment.kind {
                AttachmentKind::Veth => applied.push(self.apply_veth(pid, attachment).await?),
                AttachmentKind::Placeholder => {
                    debug!("Skipping placeholder attachment {}", attachment.name);
                }
            }
        }

        Ok(applied)
    }

    async fn apply_vlans(&self, pid: u32, vlans: &[VlanSpec]) -> Result<Vec<String>> {
        let mut names = Vec::with_capacity(vlans.len());

        for vlan in vlans {
            let parent = vlan.parent_interface_name.as_str();
            let name = vlan_link_name(parent, vlan.vlan_id)?;

            // A missing parent is built as a trunk. So is one whose host end
            // an earlier pass created but did not finish wiring.
            if let Some(bridge) = trunk_bridge(vlan) {
                let host_side = host_link_name(parent, pid)?;
                let target = NetnsTarget::Process(pid);
                if !self.provisioner.link_exists(target, parent).await?
                    || self.provisioner.link_exists(NetnsTarget::Host, &host_side).await?
                    || self.provisioner.link_exists(target, &host_side).await?
                {
                    self.ensure_trunk(pid, parent, bridge).await?;
                }
            }

            self.provisioner
                .create_vlan_subinterface(pid, &name, parent, vlan.vlan_id)
                .await?;
            info!("VLAN {} ready for pid {}", name, pid);
            names.push(name);
        }

        Ok(names)
    }

    async fn has_links(&self, pid: u32, names: &[String]) -> Result<bool> {
        for name in names {
            if !self
                .provisioner
                .link_exists(NetnsTarget::Process(pid), name)
                .await?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn teardown(
        &self,
        pid: u32,
        link_pid: u32,
        attachments: &[AttachmentSpec],
        vlans: &[VlanSpec],
    ) -> Result<()> {
        for vlan in vlans {
            let parent = vlan.parent_interface_name.as_str();
            self.provisioner
                .delete_vlan(pid, &vlan_link_name(parent, vlan.vlan_id)?)
                .await?;

            // Only a parent whose host end we named was created as a trunk
            if trunk_bridge(vlan).is_none() {
                continue;
            }
            let Ok(host_side) = host_link_name(parent, link_pid) else {
                debug!("No trunk could have been built for {}", parent);
                continue;
            };
            if self
                .provisioner
                .link_exists(NetnsTarget::Host, &host_side)
                .await?
            {
                self.provisioner
                    .teardown_veth(pid, parent, &host_side)
                    .await?;
            }
        }

        for attachment in attachments
            .iter()
            .filter(|a| a.kind == AttachmentKind::Veth)
        {
            let pod_side = pod_link_name(&attachment.name, link_pid)?;
            let host_side = host_link_name(&attachment.name, link_pid)?;
            let removed = self
                .provisioner
                .teardown_veth(pid, &pod_side, &host_side)
                .await?;

            if let Ok(block) = AddressBlock::parse(&attachment.cidr) {
                for address in removed {
                    self.allocator.release(&block, address.ip())?;
                }
            }
            debug!("Removed {} from pid {}", pod_side, pid);
        }

        info!("Tore down pod interfaces for pid {}", pid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;
    use crate::mock::MockNetwork;
    use crate::network::LinkKind;
    use std::net::Ipv4Addr;

    const PID: u32 = 4242;

    fn setup() -> (MockNetwork, AttachmentEngine<MockNetwork>, Arc<AddressAllocator>) {
        let net = MockNetwork::new();
        net.add_namespace(PID);
        net.add_link(NetnsTarget::Process(PID), "eth0", LinkKind::Veth);
        let allocator = Arc::new(AddressAllocator::new());
        let engine = AttachmentEngine::new(Arc::new(net.clone()), allocator.clone());
        (net, engine, allocator)
    }

    fn veth(name: &str, master: &str, cidr: &str) -> AttachmentSpec {
        AttachmentSpec {
            name: name.to_string(),
            kind: AttachmentKind::Veth,
            parent: None,
            master: master.to_string(),
            cidr: cidr.to_string(),
        }
    }

    fn vlan(parent: &str, id: u16, bridge: Option<&str>) -> VlanSpec {
        VlanSpec {
            parent_interface_name: parent.to_string(),
            vlan_id: id,
            bridge_name: bridge.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_apply_single_attachment() {
        let (net, engine, _) = setup();
        let applied = engine
            .apply_attachments(PID, &[veth("net0", "br0", "192.168.100.0/24")])
            .await
            .unwrap();

        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].name, "net0_4242");

        let br0 = net.link(NetnsTarget::Host, "br0").unwrap();
        assert_eq!(br0.kind, LinkKind::Bridge);
        assert!(br0.up);
        assert_eq!(br0.addresses[0].to_string(), "192.168.100.1/24");

        let pod_end = net.link(NetnsTarget::Process(PID), "net0_4242").unwrap();
        let ip = pod_end.addresses[0].ip();
        assert!(ip != Ipv4Addr::new(192, 168, 100, 1));
        assert!("192.168.100.0/24"
            .parse::<ipnetwork::Ipv4Network>()
            .unwrap()
            .contains(ip));

        let host_end = net.link(NetnsTarget::Host, "hnet0_4242").unwrap();
        assert_eq!(host_end.master.as_deref(), Some("br0"));
        assert!(host_end.up);
    }

    #[tokio::test]
    async fn test_reapply_makes_no_mutations() {
        let (net, engine, allocator) = setup();
        let attachments = [veth("net0", "br0", "192.168.100.0/24")];

        let first = engine.apply_attachments(PID, &attachments).await.unwrap();
        let mutations = net.mutations();

        let second = engine.apply_attachments(PID, &attachments).await.unwrap();
        assert_eq!(net.mutations(), mutations);
        assert_eq!(first, second);

        let block = AddressBlock::parse("192.168.100.0/24").unwrap();
        assert_eq!(allocator.in_use(&block).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_placeholder_is_skipped() {
        let (net, engine, _) = setup();
        let placeholder = AttachmentSpec {
            name: "spare".to_string(),
            kind: AttachmentKind::Placeholder,
            ..Default::default()
        };

        let applied = engine.apply_attachments(PID, &[placeholder]).await.unwrap();
        assert!(applied.is_empty());
        assert_eq!(net.mutations(), 0);
    }

    #[tokio::test]
    async fn test_failure_aborts_remaining_attachments() {
        let (net, engine, _) = setup();
        net.add_link(NetnsTarget::Host, "eth9", LinkKind::Veth);

        let err = engine
            .apply_attachments(
                PID,
                &[
                    veth("net0", "br0", "192.168.100.0/24"),
                    veth("net1", "eth9", "192.168.101.0/24"),
                    veth("net2", "br2", "192.168.102.0/24"),
                ],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RuntimeError::KernelOperation { .. }));
        assert!(net.link(NetnsTarget::Process(PID), "net0_4242").is_some());
        assert!(net.link(NetnsTarget::Process(PID), "net1_4242").is_none());
        assert!(net.link(NetnsTarget::Host, "br2").is_none());
    }

    #[tokio::test]
    async fn test_vlan_on_existing_parent() {
        let (net, engine, _) = setup();
        let names = engine
            .apply_vlans(PID, &[vlan("eth0", 8, Some("br0"))])
            .await
            .unwrap();

        assert_eq!(names, vec!["eth0.8".to_string()]);
        let sub = net.link(NetnsTarget::Process(PID), "eth0.8").unwrap();
        assert_eq!(sub.kind, LinkKind::Vlan);
        assert_eq!(sub.parent.as_deref(), Some("eth0"));
        assert_eq!(sub.vlan_id, Some(8));
        // parent existed, so no trunk was built
        assert!(net.link(NetnsTarget::Host, "br0").is_none());
    }

    #[tokio::test]
    async fn test_vlan_builds_trunk_for_missing_parent() {
        let (net, engine, _) = setup();
        engine
            .apply_vlans(PID, &[vlan("trk", 100, Some("br1"))])
            .await
            .unwrap();

        let trunk = net.link(NetnsTarget::Process(PID), "trk").unwrap();
        assert_eq!(trunk.kind, LinkKind::Veth);
        assert!(trunk.addresses.is_empty());
        let host_end = net.link(NetnsTarget::Host, "htrk_4242").unwrap();
        assert_eq!(host_end.master.as_deref(), Some("br1"));
        assert!(net.link(NetnsTarget::Process(PID), "trk.100").is_some());
    }

    #[tokio::test]
    async fn test_vlan_repairs_half_built_trunk() {
        let (net, engine, _) = setup();
        let vlans = [vlan("trk", 100, Some("br1"))];

        net.fail_operation("set_master");
        assert!(engine.apply_vlans(PID, &vlans).await.is_err());
        assert!(net.link(NetnsTarget::Process(PID), "trk").is_some());
        let host_end = net.link(NetnsTarget::Host, "htrk_4242").unwrap();
        assert!(host_end.master.is_none());

        net.clear_failures();
        engine.apply_vlans(PID, &vlans).await.unwrap();

        let host_end = net.link(NetnsTarget::Host, "htrk_4242").unwrap();
        assert_eq!(host_end.master.as_deref(), Some("br1"));
        assert!(net.link(NetnsTarget::Process(PID), "trk.100").is_some());
    }

    #[tokio::test]
    async fn test_has_links() {
        let (_, engine, _) = setup();
        engine
            .apply_attachments(PID, &[veth("net0", "br0", "192.168.100.0/24")])
            .await
            .unwrap();

        assert!(engine
            .has_links(PID, &["net0_4242".to_string(), "eth0".to_string()])
            .await
            .unwrap());
        assert!(!engine
            .has_links(PID, &["net0_5151".to_string()])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_vlan_missing_parent_without_bridge() {
        let (_, engine, _) = setup();
        let err = engine
            .apply_vlans(PID, &[vlan("eth5", 8, None)])
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_teardown_removes_links_and_releases() {
        let (net, engine, allocator) = setup();
        let attachments = [veth("net0", "br0", "192.168.100.0/24")];
        let vlans = [vlan("eth0", 8, None), vlan("trk", 9, Some("br1"))];

        engine.apply_attachments(PID, &attachments).await.unwrap();
        engine.apply_vlans(PID, &vlans).await.unwrap();

        engine.teardown(PID, PID, &attachments, &vlans).await.unwrap();

        let pod_links: Vec<String> = net
            .links(NetnsTarget::Process(PID))
            .into_iter()
            .map(|l| l.name)
            .collect();
        assert_eq!(pod_links, vec!["eth0".to_string()]);
        assert!(net.link(NetnsTarget::Host, "hnet0_4242").is_none());
        assert!(net.link(NetnsTarget::Host, "htrk_4242").is_none());
        // bridges are shared and stay
        assert!(net.link(NetnsTarget::Host, "br0").is_some());

        let block = AddressBlock::parse("192.168.100.0/24").unwrap();
        assert!(allocator.in_use(&block).unwrap().is_empty());

        // a second teardown finds nothing to do
        engine.teardown(PID, PID, &attachments, &vlans).await.unwrap();
    }

    #[tokio::test]
    async fn test_teardown_uses_link_pid_for_names() {
        let (net, engine, _) = setup();
        let attachments = [veth("net0", "br0", "192.168.100.0/24")];

        // links named after an earlier pid of the same pod
        net.add_namespace(5151);
        net.add_link(NetnsTarget::Process(5151), "net0_4242", LinkKind::Veth);
        net.add_link(NetnsTarget::Host, "hnet0_4242", LinkKind::Veth);

        engine.teardown(5151, 5151, &attachments, &[]).await.unwrap();
        assert!(net.link(NetnsTarget::Process(5151), "net0_4242").is_some());

        engine.teardown(5151, PID, &attachments, &[]).await.unwrap();
        assert!(net.link(NetnsTarget::Process(5151), "net0_4242").is_none());
        assert!(net.link(NetnsTarget::Host, "hnet0_4242").is_none());
    }

    #[tokio::test]
    async fn test_teardown_tolerates_unnameable_trunk() {
        let (net, engine, _) = setup();
        net.add_link(NetnsTarget::Process(PID), "enp0s31f6x", LinkKind::Veth);

        engine
            .teardown(PID, PID, &[], &[vlan("enp0s31f6x", 10, Some("br1"))])
            .await
            .unwrap();
        assert!(net.link(NetnsTarget::Process(PID), "enp0s31f6x").is_some());
    }
}
