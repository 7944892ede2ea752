//! VM backend implementations.
//!
//! This module provides hypervisor backend implementations for different platforms.

mod qemu;

use crate::config::EfivmConfig;
use crate::error::{Error, Result};

pub use qemu::QemuBackend;

/// Create the default backend for this platform.
///
/// Fails when the engine binary does not run or no UEFI code image is
/// present, so nothing is provisioned for a VM that cannot boot.
pub fn create_default(config: &EfivmConfig) -> Result<QemuBackend> {
    let backend = QemuBackend::new(config.clone());
    if !backend.is_available() {
        return Err(Error::HypervisorUnavailable(format!(
            "'{}' not found or not runnable (set qemu_binary in {})",
            config.qemu_binary,
            settings_location()
        )));
    }

    let firmware = backend.firmware_code().map_err(|e| {
        Error::HypervisorUnavailable(format!(
            "{} (set firmware_code in {})",
            e,
            settings_location()
        ))
    })?;
    tracing::debug!(firmware = %firmware.display(), "using UEFI firmware");

    Ok(backend)
}

fn settings_location() -> String {
    EfivmConfig::default_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "the settings file".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn fake_qemu(dir: &Path) -> String {
        let script = dir.join("fake-qemu");
        std::fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script.to_string_lossy().into_owned()
    }

    #[test]
    fn test_missing_binary_is_unavailable() {
        let temp = tempfile::tempdir().unwrap();
        let config = EfivmConfig {
            qemu_binary: temp.path().join("no-qemu").to_string_lossy().into_owned(),
            ..EfivmConfig::default()
        };
        assert!(matches!(
            create_default(&config),
            Err(Error::HypervisorUnavailable(_))
        ));
    }

    #[test]
    fn test_missing_firmware_is_unavailable() {
        let temp = tempfile::tempdir().unwrap();
        let config = EfivmConfig {
            qemu_binary: fake_qemu(temp.path()),
            firmware_code: Some(temp.path().join("CODE.fd")),
            ..EfivmConfig::default()
        };

        let err = create_default(&config).unwrap_err();
        assert!(matches!(err, Error::HypervisorUnavailable(_)));
        assert!(err.to_string().contains("firmware"));

        std::fs::write(temp.path().join("CODE.fd"), b"code").unwrap();
        assert!(create_default(&config).is_ok());
    }
}
