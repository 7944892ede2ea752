//! Host tool settings.
//!
//! These settings describe how to drive the engine on this host (binary,
//! machine type, firmware images). They are independent of any one VM and
//! live in `<config_dir>/efivm/config.toml`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application name for config file storage.
const APP_NAME: &str = "efivm";

/// Settings filename.
const CONFIG_FILENAME: &str = "config.toml";

/// Environment variable overriding the settings file location.
pub const CONFIG_ENV: &str = "EFIVM_CONFIG";

/// Default minimum guest memory in MiB.
const DEFAULT_MIN_MEMORY_MIB: u64 = 128;

/// Known locations of UEFI code images, by host architecture.
#[cfg(target_arch = "aarch64")]
const FIRMWARE_CODE_PATHS: &[&str] = &[
    "/usr/share/AAVMF/AAVMF_CODE.fd",
    "/usr/share/qemu-efi-aarch64/QEMU_EFI.fd",
    "/usr/share/edk2/aarch64/QEMU_EFI-pflash.raw",
    "/opt/homebrew/share/qemu/edk2-aarch64-code.fd",
    "/usr/local/share/qemu/edk2-aarch64-code.fd",
];

/// Known locations of empty UEFI variable templates, by host architecture.
#[cfg(target_arch = "aarch64")]
const FIRMWARE_VARS_PATHS: &[&str] = &[
    "/usr/share/AAVMF/AAVMF_VARS.fd",
    "/usr/share/edk2/aarch64/vars-template-pflash.raw",
    "/opt/homebrew/share/qemu/edk2-arm-vars.fd",
    "/usr/local/share/qemu/edk2-arm-vars.fd",
];

#[cfg(not(target_arch = "aarch64"))]
const FIRMWARE_CODE_PATHS: &[&str] = &[
    "/usr/share/OVMF/OVMF_CODE.fd",
    "/usr/share/OVMF/OVMF_CODE_4M.fd",
    "/usr/share/edk2/ovmf/OVMF_CODE.fd",
    "/usr/share/qemu/OVMF_CODE.fd",
    "/usr/local/share/qemu/edk2-x86_64-code.fd",
];

#[cfg(not(target_arch = "aarch64"))]
const FIRMWARE_VARS_PATHS: &[&str] = &[
    "/usr/share/OVMF/OVMF_VARS.fd",
    "/usr/share/OVMF/OVMF_VARS_4M.fd",
    "/usr/share/edk2/ovmf/OVMF_VARS.fd",
    "/usr/share/qemu/OVMF_VARS.fd",
    "/usr/local/share/qemu/edk2-i386-vars.fd",
];

/// Host tool settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EfivmConfig {
    /// Engine executable.
    pub qemu_binary: String,

    /// Machine type.
    pub machine: String,

    /// Hardware accelerator.
    pub accelerator: String,

    /// UEFI code image. Searched in known locations when unset.
    pub firmware_code: Option<PathBuf>,

    /// Empty UEFI variable store template. Searched when unset.
    pub firmware_vars_template: Option<PathBuf>,

    /// Minimum guest memory in MiB.
    pub min_memory_mib: u64,
}

impl Default for EfivmConfig {
    fn default() -> Self {
        let (qemu_binary, machine) = if cfg!(target_arch = "aarch64") {
            ("qemu-system-aarch64", "virt")
        } else {
            ("qemu-system-x86_64", "q35")
        };
        let accelerator = if cfg!(target_os = "macos") { "hvf" } else { "kvm" };

        Self {
            qemu_binary: qemu_binary.to_string(),
            machine: machine.to_string(),
            accelerator: accelerator.to_string(),
            firmware_code: None,
            firmware_vars_template: None,
            min_memory_mib: DEFAULT_MIN_MEMORY_MIB,
        }
    }
}

impl EfivmConfig {
    /// Default settings file path.
    ///
    /// `$EFIVM_CONFIG` if set, else `<config_dir>/efivm/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join(APP_NAME).join(CONFIG_FILENAME))
    }

    /// Load settings from the default location.
    ///
    /// A missing file yields the defaults.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load settings from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no settings file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(Error::ConfigLoad(format!("{}: {}", path.display(), e)));
            }
        };

        toml::from_str(&contents)
            .map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e)))
    }

    /// Minimum guest memory in bytes.
    pub fn min_memory_bytes(&self) -> u64 {
        self.min_memory_mib.saturating_mul(1024 * 1024)
    }

    /// Resolve the UEFI code image.
    pub fn resolve_firmware_code(&self) -> Option<PathBuf> {
        self.firmware_code
            .clone()
            .or_else(|| find_existing(FIRMWARE_CODE_PATHS))
    }

    /// Resolve the UEFI variable store template.
    pub fn resolve_firmware_vars_template(&self) -> Option<PathBuf> {
        self.firmware_vars_template
            .clone()
            .or_else(|| find_existing(FIRMWARE_VARS_PATHS))
    }
}

/// First path in `candidates` that exists.
fn find_existing(candidates: &[&str]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
        .inspect(|path| tracing::debug!(path = %path.display(), "found firmware image"))
}
