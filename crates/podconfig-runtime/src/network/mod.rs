pub mod ipam;
pub mod link;
pub mod provisioner;

pub use ipam::{AddressAllocator, AddressBlock, AllocatedAddress};
pub use link::{IpLinks, LinkInfo, LinkKind, LinkOps};
pub use provisioner::{BridgeOutcome, LinkProvisioner};

use crate::error::{Result, RuntimeError};
use podconfig_core::MAX_IFNAME_LEN;

fn checked_ifname(name: String) -> Result<String> {
    if name.is_empty() || name.len() > MAX_IFNAME_LEN {
        return Err(RuntimeError::invalid_config(
            format!(
                "interface name '{}' must be 1-{} bytes long",
                name, MAX_IFNAME_LEN
            ),
            "Shorten the attachment or parent interface name",
        ));
    }
    Ok(name)
}

/// Pod-side link name for an attachment: `<attachment>_<pid>`
pub fn pod_link_name(attachment: &str, pid: u32) -> Result<String> {
    checked_ifname(format!("{}_{}", attachment, pid))
}

/// Host-side peer name for an attachment: `h<attachment>_<pid>`
pub fn host_link_name(attachment: &str, pid: u32) -> Result<String> {
    checked_ifname(format!("h{}_{}", attachment, pid))
}

/// VLAN sub-interface name: `<parent>.<id>`
pub fn vlan_link_name(parent: &str, vlan_id: u16) -> Result<String> {
    checked_ifname(format!("{}.{}", parent, vlan_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_names() {
        assert_eq!(pod_link_name("net0", 4242).unwrap(), "net0_4242");
        assert_eq!(host_link_name("net0", 4242).unwrap(), "hnet0_4242");
        assert_eq!(vlan_link_name("eth0", 8).unwrap(), "eth0.8");
    }

    #[test]
    fn test_link_name_too_long() {
        let err = host_link_name("backhaul", 4194304).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidConfig { .. }));
        assert!(vlan_link_name("enp0s31f6abc", 4094).is_err());
    }
}
