// Allow unused assignments for diagnostic fields - they're used by the thiserror/miette macros
#![allow(unused_assignments)]

pub mod command;
pub mod controller;
pub mod cri;
pub mod engine;
pub mod error;
pub mod kube_client;
pub mod mock;
pub mod netns;
pub mod network;
pub mod traits;
pub mod types;

// Re-export primary types
pub use error::{Result, RuntimeError};
pub use mock::{MockCluster, MockNetwork, MockProcessResolver};
pub use netns::{HostNetns, NetnsBackend, NetnsTarget};
pub use network::{
    AddressAllocator, AddressBlock, AllocatedAddress, BridgeOutcome, IpLinks, LinkInfo,
    LinkKind, LinkOps, LinkProvisioner,
};
pub use traits::{NetworkAttacher, PodConfigStore, PodInventory, ProcessResolver, WorkloadCreator};
pub use types::{
    AppliedLink, ControllerConfig, ReconcileAction, WorkloadOutcome, DEFAULT_RUNTIME_ENDPOINT,
    DEFAULT_SAMPLE_IMAGE,
};

// Re-export controller and collaborators
pub use controller::PodConfigController;
pub use cri::CriClient;
pub use engine::AttachmentEngine;
pub use kube_client::KubeClient;
