//! Error types for efivm.
//!
//! Every failure in this tool is fatal. Errors are propagated as values up
//! to `main`, which is the only place that terminates the process.

use std::path::PathBuf;

/// Result type alias for efivm operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for all efivm operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid user configuration.
    #[error("invalid configuration ({operation}): {reason}")]
    Config {
        /// What was being validated.
        operation: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Configuration JSON could not be decoded.
    #[error("failed to parse configuration {}: {}", .path.display(), .source)]
    ConfigParse {
        /// File being decoded.
        path: PathBuf,
        /// Decoder error.
        #[source]
        source: serde_json::Error,
    },

    /// Requested CPU count exceeds what the host provides.
    #[error("cpu count {requested} exceeds host processor count {available}")]
    CpuLimit {
        /// Requested vCPUs.
        requested: u64,
        /// Host logical processors.
        available: u64,
    },

    /// Requested memory lies outside the engine bounds.
    #[error("memory size {requested} bytes outside allowed range [{min}, {max}]")]
    MemoryLimit {
        /// Requested bytes.
        requested: u64,
        /// Engine minimum in bytes.
        min: u64,
        /// Engine maximum in bytes.
        max: u64,
    },

    /// The VM directory already exists.
    #[error("VM directory already exists: {}", .0.display())]
    VmExists(PathBuf),

    /// Creating an artifact failed.
    #[error("storage error during {operation}: {reason}")]
    Storage {
        /// Operation that failed.
        operation: String,
        /// Underlying reason.
        reason: String,
    },

    /// A persisted artifact is missing or unreadable.
    #[error("failed to load {} from {}: {}", .artifact, .path.display(), .reason)]
    ArtifactLoad {
        /// Artifact kind.
        artifact: &'static str,
        /// Expected location.
        path: PathBuf,
        /// Underlying reason.
        reason: String,
    },

    /// Machine identifier bytes are not a valid identifier.
    #[error("invalid machine identifier: {0}")]
    InvalidMachineIdentifier(String),

    /// The assembled VM definition is inconsistent.
    #[error("invalid VM definition: {0}")]
    InvalidDefinition(String),

    /// No usable virtualization engine.
    #[error("hypervisor unavailable: {0}")]
    HypervisorUnavailable(String),

    /// The engine failed to start the VM.
    #[error("failed to start VM: {0}")]
    StartFailed(String),

    /// The engine stopped the VM with an error.
    #[error("VM stopped with error: {0}")]
    GuestFailed(String),

    /// Invalid lifecycle transition.
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state(s).
        expected: String,
        /// Actual state.
        actual: String,
    },

    /// Host tool settings could not be loaded.
    #[error("failed to load settings: {0}")]
    ConfigLoad(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration validation error.
    pub fn config(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a storage error.
    pub fn storage(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create an artifact load error.
    pub fn artifact_load(
        artifact: &'static str,
        path: impl Into<PathBuf>,
        reason: impl ToString,
    ) -> Self {
        Self::ArtifactLoad {
            artifact,
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = Error::CpuLimit {
            requested: 64,
            available: 8,
        };
        assert_eq!(err.to_string(), "cpu count 64 exceeds host processor count 8");

        let err = Error::VmExists(PathBuf::from("/tmp/vms/test1"));
        assert_eq!(err.to_string(), "VM directory already exists: /tmp/vms/test1");

        let err = Error::storage("truncate disk image", "no space left");
        assert!(err.to_string().contains("truncate disk image"));
    }
}
