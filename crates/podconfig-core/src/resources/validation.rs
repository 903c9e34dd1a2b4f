use super::{AttachmentKind, PodConfigSpec};
use crate::error::{PodConfigError, Result};
use ipnetwork::Ipv4Network;
use std::collections::HashSet;

/// Kernel limit on interface names (IFNAMSIZ minus the trailing NUL)
pub const MAX_IFNAME_LEN: usize = 15;

/// Digits of the largest pid the kernel hands out (pid_max = 4194304)
pub const MAX_PID_DIGITS: usize = 7;

/// Longest attachment name that still fits `h<name>_<pid>` for any pid
pub const MAX_ATTACHMENT_NAME_LEN: usize = MAX_IFNAME_LEN - 2 - MAX_PID_DIGITS;

/// Largest 802.1Q VLAN id
pub const MAX_VLAN_ID: u16 = 4094;

/// Smallest block that leaves room for a gateway and one host
pub const MAX_PREFIX_LEN: u8 = 30;

fn is_valid_ifname(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_IFNAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// Parse an attachment's address block
pub fn parse_block(cidr: &str) -> std::result::Result<Ipv4Network, String> {
    let net: Ipv4Network = cidr.parse().map_err(|e| format!("{}", e))?;
    if net.prefix() > MAX_PREFIX_LEN {
        return Err(format!(
            "prefix /{} leaves no usable host addresses",
            net.prefix()
        ));
    }
    if net.network() != net.ip() {
        return Err(format!("{} is not the network address of the block", net.ip()));
    }
    Ok(net)
}

impl PodConfigSpec {
    /// Check the spec before anything touches a pod
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();

        for (i, att) in self.network_attachments.iter().enumerate() {
            let field = format!("spec.networkAttachments[{}]", i);

            if att.name.is_empty() || att.name.len() > MAX_ATTACHMENT_NAME_LEN {
                return Err(PodConfigError::validation_failed(
                    format!("{}.name", field),
                    format!("'{}' must be 1-{} characters", att.name, MAX_ATTACHMENT_NAME_LEN),
                    "Interface names get the pod's pid appended and must stay within 15 bytes",
                ));
            }
            if !is_valid_ifname(&att.name) {
                return Err(PodConfigError::validation_failed(
                    format!("{}.name", field),
                    format!("'{}' contains invalid characters", att.name),
                    "Use letters, digits, '-', '_' or '.'",
                ));
            }
            if !names.insert(att.name.as_str()) {
                return Err(PodConfigError::validation_failed(
                    format!("{}.name", field),
                    format!("duplicate attachment name '{}'", att.name),
                    "Each attachment needs a unique name",
                ));
            }

            if att.kind == AttachmentKind::Placeholder {
                continue;
            }

            if !is_valid_ifname(&att.master) {
                return Err(PodConfigError::validation_failed(
                    format!("{}.master", field),
                    format!("'{}' is not a valid bridge name", att.master),
                    "Set master to the host bridge name (at most 15 bytes)",
                ));
            }
            if let Err(reason) = parse_block(&att.cidr) {
                return Err(PodConfigError::validation_failed(
                    format!("{}.cidr", field),
                    format!("'{}': {}", att.cidr, reason),
                    "Use an IPv4 network such as '192.168.100.0/24' with a prefix of at most /30",
                ));
            }
        }

        let mut vlan_links = HashSet::new();
        for (i, vlan) in self.vlans.iter().enumerate() {
            let field = format!("spec.vlans[{}]", i);

            if vlan.vlan_id > MAX_VLAN_ID {
                return Err(PodConfigError::validation_failed(
                    format!("{}.vlanID", field),
                    format!("{} is out of range", vlan.vlan_id),
                    "VLAN ids range from 0 to 4094",
                ));
            }
            if !is_valid_ifname(&vlan.parent_interface_name) {
                return Err(PodConfigError::validation_failed(
                    format!("{}.parentInterfaceName", field),
                    format!("'{}' is not a valid interface name", vlan.parent_interface_name),
                    "Name an existing link inside the pod, e.g. 'eth0'",
                ));
            }
            let link = vlan.link_name();
            if link.len() > MAX_IFNAME_LEN {
                return Err(PodConfigError::validation_failed(
                    field,
                    format!("sub-interface name '{}' exceeds {} bytes", link, MAX_IFNAME_LEN),
                    "Shorten the parent interface name",
                ));
            }
            if let Some(bridge) = vlan.bridge_name.as_deref().filter(|b| !b.is_empty()) {
                if !is_valid_ifname(bridge) {
                    return Err(PodConfigError::validation_failed(
                        format!("{}.bridgeName", field),
                        format!("'{}' is not a valid bridge name", bridge),
                        "Bridge names are at most 15 bytes",
                    ));
                }
                // The trunk's host end is named h<parent>_<pid>
                if vlan.parent_interface_name.len() > MAX_ATTACHMENT_NAME_LEN {
                    return Err(PodConfigError::validation_failed(
                        format!("{}.parentInterfaceName", field),
                        format!(
                            "'{}' is too long to name a trunk on bridge '{}'",
                            vlan.parent_interface_name, bridge
                        ),
                        format!(
                            "Parents carried over a bridge are at most {} characters",
                            MAX_ATTACHMENT_NAME_LEN
                        ),
                    ));
                }
            }
            if !vlan_links.insert(link.clone()) {
                return Err(PodConfigError::validation_failed(
                    field,
                    format!("duplicate VLAN sub-interface '{}'", link),
                    "Each parent/id pair may appear once",
                ));
            }
        }

        Ok(())
    }
}
