//! PodConfig Core - the declarative API object driving pod interface attachment
//!
//! This crate provides:
//! - The `PodConfig` custom resource (spec, status, phases)
//! - Label selector evaluation
//! - Spec validation
//! - Error types with miette diagnostics
//! - Manifest loading

pub mod error;
pub mod resources;

// Re-export commonly used types
pub use error::{PodConfigError, Result};
pub use resources::validation::{parse_block, MAX_IFNAME_LEN};
pub use resources::{
    AddressRecord, AttachmentKind, AttachmentSpec, LabelSelector, PodConfig, PodConfigPhase,
    PodConfigSpec, PodConfigStatus, PodConfigurationRecord, Requirement, SampleWorkload, VlanSpec,
    DEFAULT_SAMPLE_NAME, DEFAULT_SELECTOR_KEY, FINALIZER,
};

// Re-export k8s-openapi types for convenience
pub use k8s_openapi;
pub use k8s_openapi::api::core::v1::Pod;
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Deserialize a resource from YAML
pub fn from_yaml<T: for<'de> serde::Deserialize<'de>>(data: &str) -> Result<T> {
    serde_yaml::from_str(data).map_err(|e| {
        PodConfigError::serialization_error(
            format!("Failed to deserialize from YAML: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Read a PodConfig manifest from disk and validate its spec
pub fn load_manifest(path: &std::path::Path) -> Result<PodConfig> {
    let data = std::fs::read_to_string(path).map_err(|e| {
        PodConfigError::serialization_error(
            format!("Failed to read {}: {}", path.display(), e),
            Some(Box::new(e)),
        )
    })?;
    let podconfig: PodConfig = from_yaml(&data)?;
    podconfig.spec.validate()?;
    Ok(podconfig)
}
