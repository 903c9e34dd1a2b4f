use crate::error::{Result, RuntimeError};
use crate::netns::{NetnsBackend, NetnsTarget};
use crate::network::ipam::{AddressAllocator, AddressBlock, AllocatedAddress};
use crate::network::link::{LinkKind, LinkOps};
use ipnetwork::Ipv4Network;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of ensuring a host bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeOutcome {
    Created,
    AlreadyExists,
    /// Bridge existed but lacked its gateway address or was down
    Repaired,
}

/// Creates and verifies bridges, veth pairs and VLAN sub-interfaces
///
/// Every operation checks the kernel first and only mutates what differs
/// from the requested state, so a pass that failed halfway can be re-run.
pub struct LinkProvisioner<B: NetnsBackend> {
    netns: Arc<B>,
    allocator: Arc<AddressAllocator>,
}

impl<B: NetnsBackend> Clone for LinkProvisioner<B> {
    fn clone(&self) -> Self {
        Self {
            netns: self.netns.clone(),
            allocator: self.allocator.clone(),
        }
    }
}

impl<B: NetnsBackend> LinkProvisioner<B> {
    pub fn new(netns: Arc<B>, allocator: Arc<AddressAllocator>) -> Self {
        Self { netns, allocator }
    }

    /// Make sure a bridge exists on the host, up, carrying the block's gateway
    pub async fn ensure_bridge(
        &self,
        name: &str,
        block: Option<&AddressBlock>,
    ) -> Result<BridgeOutcome> {
        let bridge = name.to_string();
        let gateway = block.map(|b| b.gateway_network());

        let outcome = self
            .netns
            .with_namespace(NetnsTarget::Host, move |links| {
                let name = bridge;
                let Some(existing) = links.link(&name)? else {
                    links.add_bridge(&name)?;
                    if let Some(gw) = gateway {
                        links.add_address(&name, gw)?;
                    }
                    links.set_up(&name)?;
                    return Ok(BridgeOutcome::Created);
                };

                if existing.kind != LinkKind::Bridge {
                    return Err(RuntimeError::kernel_operation(
                        "ensure bridge",
                        &name,
                        format!("existing link is a {}, not a bridge", existing.kind),
                    ));
                }

                let mut repaired = false;
                if let Some(gw) = gateway {
                    if !existing.has_address(&gw) {
                        links.add_address(&name, gw)?;
                        repaired = true;
                    }
                }
                if !existing.up {
                    links.set_up(&name)?;
                    repaired = true;
                }

                Ok(if repaired {
                    BridgeOutcome::Repaired
                } else {
                    BridgeOutcome::AlreadyExists
                })
            })
            .await?;

        match outcome {
            BridgeOutcome::AlreadyExists => debug!("Bridge {} already in place", name),
            other => info!("Bridge {} ensured: {:?}", name, other),
        }
        Ok(outcome)
    }

    /// Create a veth pair in the pod namespace and move the host end out
    ///
    /// With a block, the pod end gets an address from it. A pod end left by an
    /// earlier pass keeps the in-block address it already carries.
    pub async fn create_veth_pair(
        &self,
        pid: u32,
        pod_side: &str,
        host_side: &str,
        block: Option<&AddressBlock>,
    ) -> Result<Option<AllocatedAddress>> {
        let pod_side = pod_side.to_string();
        let host_side = host_side.to_string();
        let block = block.copied();
        let allocator = self.allocator.clone();
        let host_netns = self.netns.namespace_path(NetnsTarget::Host);

        self.netns
            .with_namespace(NetnsTarget::Process(pid), move |links| {
                let existing = links.link(&pod_side)?;
                if let Some(info) = &existing {
                    if info.kind != LinkKind::Veth {
                        return Err(RuntimeError::kernel_operation(
                            "create veth",
                            &pod_side,
                            format!("existing link is a {}, not a veth", info.kind),
                        ));
                    }
                } else {
                    links.add_veth(&pod_side, &host_side)?;
                    debug!("Created veth pair {} <-> {}", pod_side, host_side);
                }

                let address = match block {
                    Some(block) => Some(assign_address(
                        links,
                        &allocator,
                        &block,
                        &pod_side,
                        existing.as_ref().map(|i| i.addresses.as_slice()).unwrap_or(&[]),
                    )?),
                    None => None,
                };

                if !existing.as_ref().is_some_and(|i| i.up) {
                    links.set_up(&pod_side)?;
                }

                if links.link(&host_side)?.is_some() {
                    links.set_namespace(&host_side, &host_netns)?;
                    debug!("Moved {} to the host namespace", host_side);
                }

                Ok(address)
            })
            .await
    }

    /// Bring a host-side link up and enslave it to a bridge
    pub async fn attach_to_bridge(&self, host_side: &str, bridge: &str) -> Result<()> {
        let host_side = host_side.to_string();
        let bridge = bridge.to_string();

        self.netns
            .with_namespace(NetnsTarget::Host, move |links| {
                let info = links
                    .link(&host_side)?
                    .ok_or_else(|| RuntimeError::not_found("host link", &host_side))?;

                if !info.up {
                    links.set_up(&host_side)?;
                }
                if info.master.as_deref() != Some(bridge.as_str()) {
                    links.set_master(&host_side, &bridge)?;
                    debug!("Attached {} to {}", host_side, bridge);
                }
                Ok(())
            })
            .await
    }

    /// Create `<parent>.<id>` on top of `parent` in the pod namespace
    pub async fn create_vlan_subinterface(
        &self,
        pid: u32,
        name: &str,
        parent: &str,
        vlan_id: u16,
    ) -> Result<()> {
        let name = name.to_string();
        let parent = parent.to_string();

        self.netns
            .with_namespace(NetnsTarget::Process(pid), move |links| {
                if let Some(info) = links.link(&name)? {
                    let matches = info.kind == LinkKind::Vlan
                        && info.vlan_id == Some(vlan_id)
                        && info.parent.as_deref() == Some(parent.as_str());
                    if !matches {
                        return Err(RuntimeError::kernel_operation(
                            "create vlan",
                            &name,
                            format!(
                                "link exists as {} and is not VLAN {} on {}",
                                info.kind, vlan_id, parent
                            ),
                        ));
                    }
                    if !info.up {
                        links.set_up(&name)?;
                    }
                    return Ok(());
                }

                if links.link(&parent)?.is_none() {
                    return Err(RuntimeError::not_found("parent link", &parent));
                }
                links.add_vlan(&name, &parent, vlan_id)?;
                links.set_up(&name)?;
                debug!("Created VLAN {} on {} with id {}", name, parent, vlan_id);
                Ok(())
            })
            .await
    }

    /// Whether a link exists in a namespace
    pub async fn link_exists(&self, target: NetnsTarget, name: &str) -> Result<bool> {
        let name = name.to_string();
        self.netns
            .with_namespace(target, move |links| Ok(links.link(&name)?.is_some()))
            .await
    }

    /// Remove a veth pair wherever its ends are. Returns the pod end's addresses.
    pub async fn teardown_veth(
        &self,
        pid: u32,
        pod_side: &str,
        host_side: &str,
    ) -> Result<Vec<Ipv4Network>> {
        let pod = pod_side.to_string();
        let addresses = self
            .netns
            .with_namespace(NetnsTarget::Process(pid), move |links| {
                let Some(info) = links.link(&pod)? else {
                    return Ok(Vec::new());
                };
                links.delete_link(&pod)?;
                debug!("Deleted {}", pod);
                Ok(info.addresses)
            })
            .await?;

        // The peer goes with the pod end; this catches a host end orphaned by
        // a pass that failed between creation and the move
        let host = host_side.to_string();
        self.netns
            .with_namespace(NetnsTarget::Host, move |links| {
                if links.link(&host)?.is_some() {
                    links.delete_link(&host)?;
                    debug!("Deleted {}", host);
                }
                Ok(())
            })
            .await?;

        Ok(addresses)
    }

    /// Remove a VLAN sub-interface from the pod namespace
    pub async fn delete_vlan(&self, pid: u32, name: &str) -> Result<()> {
        let name = name.to_string();
        self.netns
            .with_namespace(NetnsTarget::Process(pid), move |links| {
                if links.link(&name)?.is_some() {
                    links.delete_link(&name)?;
                    debug!("Deleted VLAN {}", name);
                }
                Ok(())
            })
            .await
    }
}

/// Give the pod end an address from `block`, reusing one it already has
fn assign_address<L: LinkOps>(
    links: &L,
    allocator: &AddressAllocator,
    block: &AddressBlock,
    link: &str,
    current: &[Ipv4Network],
) -> Result<AllocatedAddress> {
    let reusable = current
        .iter()
        .find(|a| a.prefix() == block.prefix_len() && block.is_usable(a.ip()));

    if let Some(existing) = reusable {
        allocator.reserve(block, existing.ip())?;
        return Ok(AllocatedAddress {
            block: *block,
            address: existing.ip(),
        });
    }

    let address = allocator.allocate(block)?;
    if let Err(e) = links.add_address(link, address.as_network()) {
        allocator.release(block, address.address)?;
        return Err(e);
    }
    debug!("Assigned {} to {}", address, link);
    Ok(address)
}
