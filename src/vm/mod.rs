//! Virtualization engine abstraction.
//!
//! The engine is treated as a black box: it reports host limits, mints
//! machine identities and variable stores, validates a [`VmDefinition`],
//! and starts it asynchronously. Guest shutdown is delivered once through
//! [`RunningVm::wait`].

pub mod backend;
pub mod definition;

use crate::error::{Error, Result};
use tokio::sync::oneshot;

pub use definition::{
    BootLoader, ConsoleDevice, DefinitionBuilder, NetworkAttachment, NetworkDevice, Platform,
    StorageDevice, VmDefinition,
};

/// Bytes in one GiB, the unit of user-facing disk and memory sizes.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Resource limits the engine enforces on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostLimits {
    /// Host logical processor count.
    pub cpu_count: u64,
    /// Minimum guest memory in bytes.
    pub min_memory: u64,
    /// Maximum guest memory in bytes.
    pub max_memory: u64,
}

impl HostLimits {
    /// Check a CPU count against the host processor count.
    pub fn check_cpus(&self, requested: u64) -> Result<()> {
        if requested > self.cpu_count {
            return Err(Error::CpuLimit {
                requested,
                available: self.cpu_count,
            });
        }
        Ok(())
    }

    /// Check a memory size against the engine bounds.
    pub fn check_memory(&self, requested: u64) -> Result<()> {
        if requested < self.min_memory || requested > self.max_memory {
            return Err(Error::MemoryLimit {
                requested,
                min: self.min_memory,
                max: self.max_memory,
            });
        }
        Ok(())
    }
}

/// Opaque, durable identity of one virtual machine.
///
/// Persisted as its 16 raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineIdentifier(uuid::Uuid);

impl MachineIdentifier {
    /// Generate a fresh identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Reconstruct an identifier from its persisted representation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        uuid::Uuid::from_slice(bytes)
            .map(Self)
            .map_err(|_| {
                Error::InvalidMachineIdentifier(format!(
                    "expected 16 bytes, found {}",
                    bytes.len()
                ))
            })
    }

    /// Persisted representation.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Hyphenated form, as passed to the engine.
    pub fn to_hyphenated(&self) -> String {
        self.0.hyphenated().to_string()
    }
}

impl std::fmt::Display for MachineIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// How a started VM came to a stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestExit {
    /// The guest shut itself down.
    Shutdown,
    /// The engine stopped the VM because of an error.
    Error(String),
}

/// Handle to a started VM.
///
/// Holds the single-shot stop notification registered at start.
#[derive(Debug)]
pub struct RunningVm {
    stopped: oneshot::Receiver<GuestExit>,
}

impl RunningVm {
    /// Create a handle and the sender the engine uses to report the stop.
    pub fn channel() -> (oneshot::Sender<GuestExit>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { stopped: rx })
    }

    /// Block until the VM stops. There is no timeout.
    pub async fn wait(self) -> GuestExit {
        self.stopped.await.unwrap_or_else(|_| {
            GuestExit::Error("engine dropped the stop notification".to_string())
        })
    }
}

/// A virtualization engine.
///
/// Backends implement this to assemble and run a [`VmDefinition`].
#[allow(async_fn_in_trait)]
pub trait VmBackend {
    /// Backend name for diagnostics.
    fn name(&self) -> &'static str;

    /// Resource limits for guests on this host.
    fn limits(&self) -> HostLimits;

    /// Mint a new machine identity.
    fn new_machine_identifier(&self) -> MachineIdentifier {
        MachineIdentifier::generate()
    }

    /// Create a new, empty EFI variable store at `path`.
    ///
    /// Must fail if `path` already exists.
    fn create_variable_store(&self, path: &std::path::Path) -> Result<()>;

    /// Check the definition as a unit before starting it.
    fn validate(&self, definition: &VmDefinition) -> Result<()> {
        definition.validate()
    }

    /// Start the VM. Resolves once the engine reports start success or failure.
    async fn start(&self, definition: &VmDefinition) -> Result<RunningVm>;
}
