//! Persistent VM artifacts.
//!
//! Each VM owns one directory holding everything needed to boot it again.
//! Artifacts are created exactly once on `create` and only read on `run`.
//!
//! # Directory Layout
//!
//! ```text
//! <vm_dir>/
//! ├── UserConfig.json     # Verbatim copy of the create-time configuration
//! ├── Disk.img            # Sparse primary disk, never resized
//! ├── MachineIdentifier   # Raw machine identity bytes
//! └── NVRAM               # EFI variable store, mutated by the firmware
//! ```

use crate::error::{Error, Result};
use crate::vm::{MachineIdentifier, VmBackend};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Persisted configuration filename.
pub const USER_CONFIG_FILENAME: &str = "UserConfig.json";

/// Primary disk image filename.
pub const DISK_IMAGE_FILENAME: &str = "Disk.img";

/// Machine identity filename.
pub const MACHINE_IDENTIFIER_FILENAME: &str = "MachineIdentifier";

/// EFI variable store filename.
pub const VARIABLE_STORE_FILENAME: &str = "NVRAM";

/// Artifact locations for one VM directory.
///
/// Computed once from the VM directory; create and run share this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmPaths {
    /// The VM directory.
    pub vm_dir: PathBuf,
    /// Persisted configuration.
    pub user_config: PathBuf,
    /// Primary disk image.
    pub main_disk_image: PathBuf,
    /// Machine identity.
    pub machine_identifier: PathBuf,
    /// EFI variable store.
    pub efi_variable_store: PathBuf,
}

impl VmPaths {
    /// Derive all artifact paths from a VM directory.
    pub fn new(vm_dir: impl Into<PathBuf>) -> Self {
        let vm_dir = vm_dir.into();
        Self {
            user_config: vm_dir.join(USER_CONFIG_FILENAME),
            main_disk_image: vm_dir.join(DISK_IMAGE_FILENAME),
            machine_identifier: vm_dir.join(MACHINE_IDENTIFIER_FILENAME),
            efi_variable_store: vm_dir.join(VARIABLE_STORE_FILENAME),
            vm_dir,
        }
    }
}

/// Handle to an EFI variable store on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableStore {
    path: PathBuf,
}

impl VariableStore {
    /// Path to the store.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Handle to the primary disk image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskImage {
    path: PathBuf,
}

impl DiskImage {
    /// Path to the image.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Create and load operations for the artifacts of one VM directory.
#[derive(Debug, Clone)]
pub struct VmStore {
    paths: VmPaths,
}

impl VmStore {
    /// Create a store over the given layout.
    pub fn new(paths: VmPaths) -> Self {
        Self { paths }
    }

    /// Artifact locations.
    pub fn paths(&self) -> &VmPaths {
        &self.paths
    }

    // ========================================================================
    // Create path
    // ========================================================================

    /// Create the VM directory.
    ///
    /// The parent must exist and the directory must not, so an existing VM
    /// is never overwritten.
    pub fn create_vm_dir(&self) -> Result<()> {
        let dir = &self.paths.vm_dir;
        tracing::info!(path = %dir.display(), "creating VM directory");

        std::fs::create_dir(dir).map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => Error::VmExists(dir.clone()),
            _ => Error::storage(
                "create VM directory",
                format!("{}: {}", dir.display(), e),
            ),
        })
    }

    /// Persist the configuration document inside the VM directory.
    pub fn persist_config(&self, document: &[u8]) -> Result<()> {
        tracing::info!(path = %self.paths.user_config.display(), "persisting configuration");
        write_new_file(&self.paths.user_config, document)
            .map_err(|e| Error::storage("persist configuration", e.to_string()))
    }

    /// Persist a newly minted machine identity.
    pub fn create_machine_identifier(&self, id: &MachineIdentifier) -> Result<()> {
        tracing::info!(
            path = %self.paths.machine_identifier.display(),
            id = %id,
            "persisting machine identifier"
        );
        write_new_file(&self.paths.machine_identifier, id.as_bytes())
            .map_err(|e| Error::storage("persist machine identifier", e.to_string()))
    }

    /// Create an empty EFI variable store through the engine.
    pub fn create_variable_store<B: VmBackend>(&self, backend: &B) -> Result<VariableStore> {
        let path = &self.paths.efi_variable_store;
        tracing::info!(path = %path.display(), backend = backend.name(), "creating EFI variable store");

        backend.create_variable_store(path).map_err(|e| match e {
            Error::Storage { .. } => e,
            other => Error::storage("create EFI variable store", other.to_string()),
        })?;

        Ok(VariableStore { path: path.clone() })
    }

    /// Create the sparse primary disk image.
    pub fn create_disk_image(&self, size_bytes: u64) -> Result<DiskImage> {
        let path = &self.paths.main_disk_image;
        if size_bytes == 0 {
            return Err(Error::storage("create disk image", "disk size must be greater than 0"));
        }

        tracing::info!(
            path = %path.display(),
            size_gb = size_bytes / (1024 * 1024 * 1024),
            "creating sparse disk image"
        );

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| Error::storage("create disk image", format!("{}: {}", path.display(), e)))?;

        file.set_len(size_bytes)
            .map_err(|e| Error::storage("truncate disk image", e.to_string()))?;
        file.sync_all()
            .map_err(|e| Error::storage("sync disk image", e.to_string()))?;

        Ok(DiskImage { path: path.clone() })
    }

    // ========================================================================
    // Load path
    // ========================================================================

    /// Read the persisted machine identity.
    pub fn load_machine_identifier(&self) -> Result<MachineIdentifier> {
        let path = &self.paths.machine_identifier;
        tracing::debug!(path = %path.display(), "loading machine identifier");

        let bytes = std::fs::read(path)
            .map_err(|e| Error::artifact_load("machine identifier", path, e))?;
        MachineIdentifier::from_bytes(&bytes)
    }

    /// Open the existing EFI variable store.
    pub fn open_variable_store(&self) -> Result<VariableStore> {
        let path = &self.paths.efi_variable_store;
        tracing::debug!(path = %path.display(), "opening EFI variable store");

        if !path.is_file() {
            return Err(Error::artifact_load(
                "EFI variable store",
                path,
                "file does not exist",
            ));
        }
        Ok(VariableStore { path: path.clone() })
    }

    /// Reference the existing disk image. The engine opens it.
    pub fn disk_image(&self) -> DiskImage {
        DiskImage {
            path: self.paths.main_disk_image.clone(),
        }
    }
}

/// Write a file that must not already exist, and sync it.
fn write_new_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}
