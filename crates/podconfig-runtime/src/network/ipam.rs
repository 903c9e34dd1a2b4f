use crate::error::{Result, RuntimeError};
use ipnetwork::Ipv4Network;
use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::Mutex;
use tracing::debug;

/// Parsed address block an attachment draws from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressBlock {
    /// Base network
    pub network: Ipv4Network,
    /// Gateway address (network + 1), assigned to the bridge
    pub gateway: Ipv4Addr,
    /// First allocatable host address (network + 2)
    pub first_host: Ipv4Addr,
    /// Broadcast address (last in range)
    pub broadcast: Ipv4Addr,
}

impl AddressBlock {
    /// Parse a block like "192.168.100.0/24"
    pub fn parse(cidr: &str) -> Result<Self> {
        let network = podconfig_core::parse_block(cidr).map_err(|reason| {
            RuntimeError::invalid_config(
                format!("Invalid address block '{}': {}", cidr, reason),
                "Use an IPv4 network address with a prefix of at most /30, like '192.168.100.0/24'",
            )
        })?;

        let base = u32::from(network.network());
        let block = Self {
            network,
            gateway: Ipv4Addr::from(base + 1),
            first_host: Ipv4Addr::from(base + 2),
            broadcast: network.broadcast(),
        };

        debug!(
            "Address block {}: gateway={}, first_host={}, broadcast={}",
            block.network, block.gateway, block.first_host, block.broadcast
        );

        Ok(block)
    }

    pub fn prefix_len(&self) -> u8 {
        self.network.prefix()
    }

    /// Gateway with the block's prefix, as assigned to the bridge
    pub fn gateway_network(&self) -> Ipv4Network {
        self.with_prefix(self.gateway)
    }

    /// Whether `ip` may be handed to a pod
    pub fn is_usable(&self, ip: Ipv4Addr) -> bool {
        ip >= self.first_host && ip < self.broadcast
    }

    fn with_prefix(&self, ip: Ipv4Addr) -> Ipv4Network {
        // prefix was validated on parse
        Ipv4Network::new(ip, self.prefix_len()).unwrap_or(self.network)
    }
}

impl std::fmt::Display for AddressBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.network)
    }
}

/// An address handed out for a pod link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatedAddress {
    pub block: AddressBlock,
    pub address: Ipv4Addr,
}

impl AllocatedAddress {
    /// The address with the block's prefix, as assigned to the link
    pub fn as_network(&self) -> Ipv4Network {
        self.block.with_prefix(self.address)
    }
}

impl std::fmt::Display for AllocatedAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.block.prefix_len())
    }
}

/// In-memory address allocator, one in-use set per block
///
/// Lives as long as the controller. Addresses found on existing links or
/// recorded in PodConfig status are fed back in through `reserve`.
#[derive(Debug, Default)]
pub struct AddressAllocator {
    in_use: Mutex<HashMap<Ipv4Network, BTreeSet<Ipv4Addr>>>,
}

impl AddressAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Ipv4Network, BTreeSet<Ipv4Addr>>>> {
        self.in_use
            .lock()
            .map_err(|_| RuntimeError::internal_error("address allocator lock poisoned"))
    }

    /// Hand out the lowest free address in the block
    pub fn allocate(&self, block: &AddressBlock) -> Result<AllocatedAddress> {
        let mut in_use = self.lock()?;
        let taken = in_use.entry(block.network).or_default();

        let mut candidate = u32::from(block.first_host);
        let end = u32::from(block.broadcast);
        while candidate < end {
            let ip = Ipv4Addr::from(candidate);
            if taken.insert(ip) {
                debug!("Allocated {} from {}", ip, block);
                return Ok(AllocatedAddress {
                    block: *block,
                    address: ip,
                });
            }
            candidate += 1;
        }

        Err(RuntimeError::exhausted(block.to_string()))
    }

    /// Mark an address as taken. Returns false if it already was.
    pub fn reserve(&self, block: &AddressBlock, ip: Ipv4Addr) -> Result<bool> {
        if !block.is_usable(ip) {
            return Err(RuntimeError::invalid_config(
                format!("{} is not a usable host address in {}", ip, block),
                "Only network+2 up to broadcast-1 can be assigned to pods",
            ));
        }
        let mut in_use = self.lock()?;
        let fresh = in_use.entry(block.network).or_default().insert(ip);
        if fresh {
            debug!("Reserved {} in {}", ip, block);
        }
        Ok(fresh)
    }

    /// Return an address to the pool. Returns false if it was not taken.
    pub fn release(&self, block: &AddressBlock, ip: Ipv4Addr) -> Result<bool> {
        let mut in_use = self.lock()?;
        let released = in_use
            .get_mut(&block.network)
            .is_some_and(|taken| taken.remove(&ip));
        if released {
            debug!("Released {} in {}", ip, block);
        }
        Ok(released)
    }

    /// Addresses currently taken in a block, ascending
    pub fn in_use(&self, block: &AddressBlock) -> Result<Vec<Ipv4Addr>> {
        let in_use = self.lock()?;
        Ok(in_use
            .get(&block.network)
            .map(|taken| taken.iter().copied().collect())
            .unwrap_or_default())
    }
}
