// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Core error type for PodConfig resource handling
#[derive(Error, Debug, Diagnostic)]
pub enum PodConfigError {
    /// Spec validation failed
    #[error("Validation failed for {field}: {details}")]
    #[diagnostic(code(podconfig::validation_failed), help("{help_text}"))]
    ValidationFailed {
        #[allow(unused)]
        field: String,
        #[allow(unused)]
        details: String,
        #[allow(unused)]
        help_text: String,
    },

    /// Invalid label selector
    #[error("Invalid label selector '{selector}': {reason}")]
    #[diagnostic(
        code(podconfig::invalid_selector),
        help("Use comma-separated requirements such as 'app=cnf', 'tier!=db' or 'podconfig'")
    )]
    InvalidSelector {
        #[allow(unused)]
        selector: String,
        #[allow(unused)]
        reason: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(
        code(podconfig::serialization_error),
        help("Ensure the manifest is valid JSON or YAML for kind PodConfig")
    )]
    SerializationError {
        #[allow(unused)]
        message: String,
        #[source]
        #[allow(unused)]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Resource is missing a required metadata field
    #[error("PodConfig is missing required field: {field}")]
    #[diagnostic(
        code(podconfig::missing_field),
        help("Objects read from the API server always carry metadata.name and metadata.namespace")
    )]
    MissingField {
        #[allow(unused)]
        field: String,
    },
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, PodConfigError>;

impl PodConfigError {
    pub fn validation_failed(
        field: impl Into<String>,
        details: impl Into<String>,
        help_text: impl Into<String>,
    ) -> Self {
        Self::ValidationFailed {
            field: field.into(),
            details: details.into(),
            help_text: help_text.into(),
        }
    }

    pub fn invalid_selector(selector: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSelector {
            selector: selector.into(),
            reason: reason.into(),
        }
    }

    pub fn serialization_error(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::SerializationError {
            message: message.into(),
            source,
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }
}
