use miette::Diagnostic;
use thiserror::Error;

/// Runtime error type for pod interface attachment
#[derive(Error, Debug, Diagnostic)]
pub enum RuntimeError {
    /// Container runtime socket unreachable or the call failed
    #[error("Container runtime call to {endpoint} failed: {message}")]
    #[diagnostic(
        code(podconfig::runtime::transport),
        help("Check that the container runtime is running and its socket is mounted into the controller pod")
    )]
    Transport {
        #[allow(unused)]
        endpoint: String,
        #[allow(unused)]
        message: String,
    },

    /// Something expected to exist does not
    #[error("{kind} not found: {name}")]
    #[diagnostic(
        code(podconfig::runtime::not_found),
        help("The object may have been deleted between listing and use. The next pass will retry")
    )]
    NotFound {
        #[allow(unused)]
        kind: String,
        #[allow(unused)]
        name: String,
    },

    /// Runtime status payload lacks the fields we need
    #[error("Malformed status info for container {container_id}: {message}")]
    #[diagnostic(
        code(podconfig::runtime::malformed_info),
        help("The runtime must answer verbose ContainerStatus with an `info` JSON blob carrying `pid`")
    )]
    MalformedInfo {
        #[allow(unused)]
        container_id: String,
        #[allow(unused)]
        message: String,
    },

    /// Address block has no free addresses
    #[error("Address block exhausted: no free addresses in {cidr}")]
    #[diagnostic(
        code(podconfig::runtime::exhausted),
        help("Use a larger block for the attachment or remove pods that hold addresses from it")
    )]
    Exhausted {
        #[allow(unused)]
        cidr: String,
    },

    /// Network namespace could not be entered
    #[error("Cannot open network namespace {path}: {message}")]
    #[diagnostic(
        code(podconfig::runtime::namespace_open),
        help("The process may have exited. Check that the host /proc is mounted at the configured proc root and the controller runs privileged")
    )]
    NamespaceOpen {
        #[allow(unused)]
        path: String,
        #[allow(unused)]
        message: String,
    },

    /// Kernel rejected a link operation
    #[error("Kernel rejected {operation} on '{link}': {message}")]
    #[diagnostic(
        code(podconfig::runtime::kernel_operation),
        help("Inspect the link with `ip -d link show {link}` in the affected namespace")
    )]
    KernelOperation {
        #[allow(unused)]
        operation: String,
        #[allow(unused)]
        link: String,
        #[allow(unused)]
        message: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(podconfig::runtime::invalid_config), help("{suggestion}"))]
    InvalidConfig {
        #[allow(unused)]
        message: String,
        #[allow(unused)]
        suggestion: String,
    },

    /// Kubernetes API request failed
    #[error("Kubernetes API error: {message}")]
    #[diagnostic(
        code(podconfig::runtime::api_error),
        help("Check the controller's service account permissions and API server reachability")
    )]
    ApiError {
        #[allow(unused)]
        message: String,
    },

    /// Write lost a race against another writer
    #[error("Conflict writing {resource}: the object changed since it was read")]
    #[diagnostic(
        code(podconfig::runtime::conflict),
        help("Re-read the object and apply the change again")
    )]
    Conflict {
        #[allow(unused)]
        resource: String,
    },

    /// Command execution failed
    #[error("Command '{command}' failed with exit code {exit_code}")]
    #[diagnostic(code(podconfig::runtime::command_failed), help("stderr: {stderr}"))]
    CommandFailed {
        #[allow(unused)]
        command: String,
        #[allow(unused)]
        exit_code: i32,
        #[allow(unused)]
        stderr: String,
    },

    /// Core library error
    #[error(transparent)]
    #[diagnostic(transparent)]
    CoreError(#[from] podconfig_core::PodConfigError),

    /// Internal error
    #[error("Internal runtime error: {message}")]
    #[diagnostic(
        code(podconfig::runtime::internal_error),
        help("This is likely a bug in podconfig-runtime. Please report it with the full error details")
    )]
    InternalError {
        #[allow(unused)]
        message: String,
    },
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

impl RuntimeError {
    pub fn transport(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn malformed_info(container_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedInfo {
            container_id: container_id.into(),
            message: message.into(),
        }
    }

    pub fn exhausted(cidr: impl Into<String>) -> Self {
        Self::Exhausted { cidr: cidr.into() }
    }

    pub fn namespace_open(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NamespaceOpen {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn kernel_operation(
        operation: impl Into<String>,
        link: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::KernelOperation {
            operation: operation.into(),
            link: link.into(),
            message: message.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn api_error(message: impl Into<String>) -> Self {
        Self::ApiError {
            message: message.into(),
        }
    }

    pub fn conflict(resource: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
        }
    }

    pub fn command_failed(
        command: impl Into<String>,
        exit_code: i32,
        stderr: impl Into<String>,
    ) -> Self {
        Self::CommandFailed {
            command: command.into(),
            exit_code,
            stderr: stderr.into(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Errors that retrying cannot fix until the PodConfig itself changes
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig { .. }
                | Self::CoreError(podconfig_core::PodConfigError::ValidationFailed { .. })
                | Self::CoreError(podconfig_core::PodConfigError::InvalidSelector { .. })
        )
    }
}
