use crate::command::{exec_unchecked, CommandOutput};
use crate::error::{Result, RuntimeError};
use ipnetwork::Ipv4Network;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::debug;

/// Kind of a kernel link, as far as provisioning cares
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    Bridge,
    Veth,
    Vlan,
    Other(String),
}

impl std::fmt::Display for LinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkKind::Bridge => write!(f, "bridge"),
            LinkKind::Veth => write!(f, "veth"),
            LinkKind::Vlan => write!(f, "vlan"),
            LinkKind::Other(kind) => write!(f, "{}", kind),
        }
    }
}

/// Observed state of one link in the current namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub name: String,
    pub kind: LinkKind,
    pub up: bool,
    pub master: Option<String>,
    /// Lower link for VLANs, peer for veths whose peer shares the namespace
    pub parent: Option<String>,
    pub vlan_id: Option<u16>,
    pub addresses: Vec<Ipv4Network>,
}

impl LinkInfo {
    pub fn has_address(&self, address: &Ipv4Network) -> bool {
        self.addresses
            .iter()
            .any(|a| a.ip() == address.ip() && a.prefix() == address.prefix())
    }
}

/// Link operations inside whatever network namespace the calling thread is in
///
/// Implementations are synchronous: they run on the thread that entered the
/// namespace and must not hop to another one.
pub trait LinkOps {
    /// Look a link up by name. `None` when it does not exist.
    fn link(&self, name: &str) -> Result<Option<LinkInfo>>;

    fn add_bridge(&self, name: &str) -> Result<()>;

    /// Create a veth pair; both ends start in the current namespace
    fn add_veth(&self, name: &str, peer: &str) -> Result<()>;

    fn add_vlan(&self, name: &str, parent: &str, vlan_id: u16) -> Result<()>;

    /// Assign an address. Assigning one the link already has is not an error.
    fn add_address(&self, name: &str, address: Ipv4Network) -> Result<()>;

    fn set_up(&self, name: &str) -> Result<()>;

    fn set_master(&self, name: &str, master: &str) -> Result<()>;

    /// Move a link into the namespace behind `netns` (a `<proc>/<pid>/ns/net` path)
    fn set_namespace(&self, name: &str, netns: &Path) -> Result<()>;

    /// Delete a link. Deleting a missing link is not an error.
    fn delete_link(&self, name: &str) -> Result<()>;
}

/// iproute2-backed link operations
#[derive(Debug, Clone)]
pub struct IpLinks {
    binary: String,
}

impl Default for IpLinks {
    fn default() -> Self {
        Self::new("ip")
    }
}

fn is_missing_link(stderr: &str) -> bool {
    stderr.contains("does not exist") || stderr.contains("Cannot find device")
}

impl IpLinks {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn run(&self, operation: &str, link: &str, args: &[&str]) -> Result<CommandOutput> {
        let output = exec_unchecked(&self.binary, args)?;
        if output.exit_code != 0 {
            return Err(RuntimeError::kernel_operation(
                operation,
                link,
                output.stderr.trim(),
            ));
        }
        Ok(output)
    }
}

impl LinkOps for IpLinks {
    fn link(&self, name: &str) -> Result<Option<LinkInfo>> {
        let output = exec_unchecked(&self.binary, &["-d", "-j", "addr", "show", "dev", name])?;
        if output.exit_code != 0 {
            if is_missing_link(&output.stderr) {
                return Ok(None);
            }
            return Err(RuntimeError::kernel_operation(
                "show link",
                name,
                output.stderr.trim(),
            ));
        }
        parse_link_json(name, &output.stdout)
    }

    fn add_bridge(&self, name: &str) -> Result<()> {
        self.run(
            "add bridge",
            name,
            &["link", "add", "name", name, "type", "bridge"],
        )?;
        Ok(())
    }

    fn add_veth(&self, name: &str, peer: &str) -> Result<()> {
        self.run(
            "add veth",
            name,
            &["link", "add", name, "type", "veth", "peer", "name", peer],
        )?;
        Ok(())
    }

    fn add_vlan(&self, name: &str, parent: &str, vlan_id: u16) -> Result<()> {
        let id = vlan_id.to_string();
        self.run(
            "add vlan",
            name,
            &[
                "link", "add", "link", parent, "name", name, "type", "vlan", "id", &id,
            ],
        )?;
        Ok(())
    }

    fn add_address(&self, name: &str, address: Ipv4Network) -> Result<()> {
        let cidr = address.to_string();
        let output = exec_unchecked(&self.binary, &["addr", "add", &cidr, "dev", name])?;
        if output.exit_code != 0 {
            if output.stderr.contains("File exists") {
                debug!("{} already carries {}", name, cidr);
                return Ok(());
            }
            return Err(RuntimeError::kernel_operation(
                format!("add address {}", cidr),
                name,
                output.stderr.trim(),
            ));
        }
        Ok(())
    }

    fn set_up(&self, name: &str) -> Result<()> {
        self.run("set up", name, &["link", "set", "dev", name, "up"])?;
        Ok(())
    }

    fn set_master(&self, name: &str, master: &str) -> Result<()> {
        self.run(
            &format!("set master {}", master),
            name,
            &["link", "set", "dev", name, "master", master],
        )?;
        Ok(())
    }

    fn set_namespace(&self, name: &str, netns: &Path) -> Result<()> {
        // iproute2 opens a netns argument containing '/' as a file
        let target = netns.to_string_lossy();
        self.run(
            &format!("move to {}", target),
            name,
            &["link", "set", "dev", name, "netns", &target],
        )?;
        Ok(())
    }

    fn delete_link(&self, name: &str) -> Result<()> {
        let output = exec_unchecked(&self.binary, &["link", "del", "dev", name])?;
        if output.exit_code != 0 && !is_missing_link(&output.stderr) {
            return Err(RuntimeError::kernel_operation(
                "delete link",
                name,
                output.stderr.trim(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct IpLinkJson {
    ifname: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    master: Option<String>,
    #[serde(default)]
    link: Option<String>,
    #[serde(default)]
    linkinfo: Option<IpLinkInfoJson>,
    #[serde(default)]
    addr_info: Vec<IpAddrJson>,
}

#[derive(Debug, Deserialize)]
struct IpLinkInfoJson {
    #[serde(default)]
    info_kind: Option<String>,
    #[serde(default)]
    info_data: Option<IpInfoDataJson>,
}

#[derive(Debug, Deserialize)]
struct IpInfoDataJson {
    #[serde(default)]
    id: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct IpAddrJson {
    family: String,
    local: String,
    prefixlen: u8,
}

/// Parse the output of `ip -d -j addr show dev <name>`
pub fn parse_link_json(name: &str, stdout: &str) -> Result<Option<LinkInfo>> {
    let entries: Vec<IpLinkJson> = serde_json::from_str(stdout).map_err(|e| {
        RuntimeError::kernel_operation("show link", name, format!("unparseable ip output: {}", e))
    })?;

    let Some(entry) = entries.into_iter().find(|e| e.ifname == name) else {
        return Ok(None);
    };

    let kind = match entry
        .linkinfo
        .as_ref()
        .and_then(|i| i.info_kind.as_deref())
    {
        Some("bridge") => LinkKind::Bridge,
        Some("veth") => LinkKind::Veth,
        Some("vlan") => LinkKind::Vlan,
        Some(other) => LinkKind::Other(other.to_string()),
        None => LinkKind::Other("device".to_string()),
    };

    let vlan_id = entry
        .linkinfo
        .as_ref()
        .and_then(|i| i.info_data.as_ref())
        .and_then(|d| d.id)
        .filter(|_| kind == LinkKind::Vlan);

    let mut addresses = Vec::new();
    for addr in entry.addr_info.iter().filter(|a| a.family == "inet") {
        let ip: Ipv4Addr = addr.local.parse().map_err(|_| {
            RuntimeError::kernel_operation(
                "show link",
                name,
                format!("invalid address '{}'", addr.local),
            )
        })?;
        let net = Ipv4Network::new(ip, addr.prefixlen).map_err(|e| {
            RuntimeError::kernel_operation("show link", name, e.to_string())
        })?;
        addresses.push(net);
    }

    Ok(Some(LinkInfo {
        up: entry.flags.iter().any(|f| f == "UP"),
        name: entry.ifname,
        kind,
        master: entry.master,
        parent: entry.link,
        vlan_id,
        addresses,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BRIDGE: &str = r#"[{"ifindex":7,"ifname":"br0","flags":["BROADCAST","MULTICAST","UP","LOWER_UP"],"mtu":1500,"qdisc":"noqueue","operstate":"UP","group":"default","txqlen":1000,"link_type":"ether","address":"6e:1a:55:0c:3b:01","broadcast":"ff:ff:ff:ff:ff:ff","promiscuity":0,"linkinfo":{"info_kind":"bridge","info_data":{"forward_delay":1500,"stp_state":0}},"addr_info":[{"family":"inet","local":"192.168.100.1","prefixlen":24,"scope":"global","label":"br0","valid_life_time":4294967295,"preferred_life_time":4294967295},{"family":"inet6","local":"fe80::6c1a:55ff:fe0c:3b01","prefixlen":64,"scope":"link"}]}]"#;

    const VLAN: &str = r#"[{"ifindex":9,"link":"eth0","ifname":"eth0.8","flags":["BROADCAST","MULTICAST"],"mtu":1500,"qdisc":"noop","operstate":"DOWN","linkinfo":{"info_kind":"vlan","info_data":{"protocol":"802.1Q","id":8,"flags":["REORDER_HDR"]}},"addr_info":[]}]"#;

    const VETH: &str = r#"[{"ifindex":12,"link_index":11,"ifname":"hnet0_4242","flags":["BROADCAST","MULTICAST","UP","LOWER_UP"],"mtu":1500,"master":"br0","operstate":"UP","link_netnsid":1,"linkinfo":{"info_kind":"veth","info_slave_kind":"bridge"},"addr_info":[]}]"#;

    #[test]
    fn test_parse_bridge() {
        let info = parse_link_json("br0", BRIDGE).unwrap().unwrap();
        assert_eq!(info.kind, LinkKind::Bridge);
        assert!(info.up);
        assert_eq!(info.addresses.len(), 1);
        assert!(info.has_address(&"192.168.100.1/24".parse().unwrap()));
        assert_eq!(info.vlan_id, None);
    }

    #[test]
    fn test_parse_vlan() {
        let info = parse_link_json("eth0.8", VLAN).unwrap().unwrap();
        assert_eq!(info.kind, LinkKind::Vlan);
        assert_eq!(info.vlan_id, Some(8));
        assert_eq!(info.parent.as_deref(), Some("eth0"));
        assert!(!info.up);
    }

    #[test]
    fn test_parse_enslaved_veth() {
        let info = parse_link_json("hnet0_4242", VETH).unwrap().unwrap();
        assert_eq!(info.kind, LinkKind::Veth);
        assert_eq!(info.master.as_deref(), Some("br0"));
        assert!(info.addresses.is_empty());
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_link_json("br0", "not json").is_err());
        assert_eq!(parse_link_json("br0", "[]").unwrap(), None);
    }

    #[test]
    fn test_missing_link_detection() {
        assert!(is_missing_link("Device \"net0_1\" does not exist.\n"));
        assert!(is_missing_link("Cannot find device \"net0_1\"\n"));
        assert!(!is_missing_link("RTNETLINK answers: Operation not permitted\n"));
    }

    #[test]
    fn test_missing_binary_surfaces_error() {
        let links = IpLinks::new("/nonexistent/ip");
        assert!(links.link("lo").is_err());
    }
}
