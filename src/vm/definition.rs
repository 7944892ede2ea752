//! Declarative VM definitions.
//!
//! A [`VmDefinition`] is assembled from a validated [`UserConfig`] and the
//! artifacts created or loaded for it, then handed to a backend.

use crate::error::{Error, Result};
use crate::storage::{DiskImage, VariableStore};
use crate::user_config::UserConfig;
use crate::vm::MachineIdentifier;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

/// Generic platform carrying the machine identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    /// Durable machine identity.
    pub machine_identifier: MachineIdentifier,
}

/// EFI boot loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootLoader {
    /// Variable store the firmware reads and writes.
    pub variable_store: PathBuf,
}

/// Block device backed by a host file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDevice {
    /// Backing file.
    pub path: PathBuf,
    /// Whether the guest may write to it.
    pub read_only: bool,
}

/// How a network device reaches the outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkAttachment {
    /// Host-provided NAT.
    Nat,
}

/// Guest network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkDevice {
    /// Attachment mode.
    pub attachment: NetworkAttachment,
}

/// Serial console bound to host file descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsoleDevice {
    /// Host fd the guest reads from.
    pub input: RawFd,
    /// Host fd the guest writes to.
    pub output: RawFd,
}

impl ConsoleDevice {
    /// Console over the process's standard input and output.
    pub fn stdio() -> Self {
        Self {
            input: libc::STDIN_FILENO,
            output: libc::STDOUT_FILENO,
        }
    }
}

/// Everything a backend needs to boot one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmDefinition {
    /// Number of vCPUs.
    pub cpu_count: u64,
    /// Memory size in bytes.
    pub memory_size: u64,
    /// Platform identity.
    pub platform: Platform,
    /// Firmware boot loader.
    pub boot_loader: BootLoader,
    /// Block devices in attachment order.
    pub storage_devices: Vec<StorageDevice>,
    /// Network devices.
    pub network_devices: Vec<NetworkDevice>,
    /// Serial consoles.
    pub console_devices: Vec<ConsoleDevice>,
}

impl VmDefinition {
    /// Check the definition as a whole.
    pub fn validate(&self) -> Result<()> {
        if self.cpu_count == 0 {
            return Err(Error::InvalidDefinition("cpu count must be at least 1".into()));
        }
        if self.memory_size == 0 {
            return Err(Error::InvalidDefinition("memory size must be non-zero".into()));
        }

        if !self.boot_loader.variable_store.is_file() {
            return Err(Error::InvalidDefinition(format!(
                "EFI variable store not found: {}",
                self.boot_loader.variable_store.display()
            )));
        }

        let writable = self.storage_devices.iter().filter(|d| !d.read_only).count();
        if writable != 1 {
            return Err(Error::InvalidDefinition(format!(
                "expected exactly one writable disk, found {}",
                writable
            )));
        }
        // Installer media, if any, precedes the primary disk.
        if let Some(last) = self.storage_devices.last() {
            if last.read_only {
                return Err(Error::InvalidDefinition(
                    "primary disk must be the last storage device".into(),
                ));
            }
        }
        for device in &self.storage_devices {
            if !device.path.is_file() {
                return Err(Error::InvalidDefinition(format!(
                    "storage backing file not found: {}",
                    device.path.display()
                )));
            }
        }

        if self.network_devices.len() != 1 {
            return Err(Error::InvalidDefinition(format!(
                "expected exactly one network device, found {}",
                self.network_devices.len()
            )));
        }
        if self.console_devices.len() != 1 {
            return Err(Error::InvalidDefinition(format!(
                "expected exactly one console device, found {}",
                self.console_devices.len()
            )));
        }

        Ok(())
    }

    /// Whether installer media is attached.
    pub fn has_installer(&self) -> bool {
        self.storage_devices.iter().any(|d| d.read_only)
    }
}

/// Assembles a [`VmDefinition`] from configuration and artifacts.
#[derive(Debug)]
pub struct DefinitionBuilder<'a> {
    config: &'a UserConfig,
    machine_identifier: Option<MachineIdentifier>,
    variable_store: Option<PathBuf>,
    installer: Option<PathBuf>,
    disk: Option<PathBuf>,
    console: ConsoleDevice,
}

impl<'a> DefinitionBuilder<'a> {
    /// Start a definition for `config`.
    pub fn new(config: &'a UserConfig) -> Self {
        Self {
            config,
            machine_identifier: None,
            variable_store: None,
            installer: None,
            disk: None,
            console: ConsoleDevice::stdio(),
        }
    }

    /// Set the platform identity.
    pub fn machine_identifier(mut self, id: MachineIdentifier) -> Self {
        self.machine_identifier = Some(id);
        self
    }

    /// Boot through EFI with this variable store.
    pub fn variable_store(mut self, store: &VariableStore) -> Self {
        self.variable_store = Some(store.path().to_path_buf());
        self
    }

    /// Attach read-only installer media.
    pub fn installer(mut self, iso: &Path) -> Self {
        self.installer = Some(iso.to_path_buf());
        self
    }

    /// Attach the writable primary disk.
    pub fn disk(mut self, disk: &DiskImage) -> Self {
        self.disk = Some(disk.path().to_path_buf());
        self
    }

    /// Override the console file descriptors.
    pub fn console(mut self, console: ConsoleDevice) -> Self {
        self.console = console;
        self
    }

    /// Produce the definition.
    ///
    /// Storage order is fixed: installer first, then the primary disk.
    pub fn build(self) -> Result<VmDefinition> {
        let machine_identifier = self
            .machine_identifier
            .ok_or_else(|| Error::InvalidDefinition("no machine identifier".into()))?;
        let variable_store = self
            .variable_store
            .ok_or_else(|| Error::InvalidDefinition("no EFI variable store".into()))?;
        let disk = self
            .disk
            .ok_or_else(|| Error::InvalidDefinition("no primary disk".into()))?;

        let mut storage_devices = Vec::with_capacity(2);
        if let Some(iso) = self.installer {
            storage_devices.push(StorageDevice {
                path: iso,
                read_only: true,
            });
        }
        storage_devices.push(StorageDevice {
            path: disk,
            read_only: false,
        });

        Ok(VmDefinition {
            cpu_count: self.config.cpu_count,
            memory_size: self.config.memory_size_bytes,
            platform: Platform { machine_identifier },
            boot_loader: BootLoader { variable_store },
            storage_devices,
            network_devices: vec![NetworkDevice {
                attachment: NetworkAttachment::Nat,
            }],
            console_devices: vec![self.console],
        })
    }
}
