//! QEMU backend.
//!
//! Runs the definition as a `qemu-system-*` child process with UEFI
//! firmware on pflash, virtio block and network devices, and a stdio
//! serial console.

use crate::config::EfivmConfig;
use crate::error::{Error, Result};
use crate::vm::{
    ConsoleDevice, GuestExit, HostLimits, NetworkAttachment, RunningVm, VmBackend, VmDefinition,
};
use std::os::unix::io::{BorrowedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// How long the engine must stay up before a start counts as successful.
pub const STARTUP_GRACE: Duration = Duration::from_millis(500);

/// Bytes per MiB, QEMU's memory unit.
const MIB: u64 = 1024 * 1024;

/// QEMU process backend.
#[derive(Debug, Clone)]
pub struct QemuBackend {
    config: EfivmConfig,
}

impl QemuBackend {
    /// Create a backend from host settings.
    pub fn new(config: EfivmConfig) -> Self {
        Self { config }
    }

    /// Check that the engine binary runs.
    pub fn is_available(&self) -> bool {
        std::process::Command::new(&self.config.qemu_binary)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Locate the UEFI code image the guest boots from.
    pub fn firmware_code(&self) -> Result<PathBuf> {
        let path = self.config.resolve_firmware_code().ok_or_else(|| {
            Error::InvalidDefinition(
                "UEFI firmware not found (install OVMF/AAVMF or set firmware_code)".into(),
            )
        })?;
        if !path.is_file() {
            return Err(Error::InvalidDefinition(format!(
                "UEFI firmware not found: {}",
                path.display()
            )));
        }
        Ok(path)
    }

    /// Engine arguments for a definition.
    pub fn command_args(&self, definition: &VmDefinition, firmware_code: &Path) -> Vec<String> {
        let cpu = if self.config.accelerator == "tcg" {
            "max"
        } else {
            "host"
        };

        let mut args: Vec<String> = vec![
            "-nodefaults".into(),
            "-no-reboot".into(),
            "-machine".into(),
            format!("{},accel={}", self.config.machine, self.config.accelerator),
            "-cpu".into(),
            cpu.into(),
            "-smp".into(),
            definition.cpu_count.to_string(),
            "-m".into(),
            format!("{}M", definition.memory_size / MIB),
            "-uuid".into(),
            definition.platform.machine_identifier.to_hyphenated(),
            "-drive".into(),
            format!(
                "if=pflash,format=raw,unit=0,readonly=on,file={}",
                escape_option(firmware_code)
            ),
            "-drive".into(),
            format!(
                "if=pflash,format=raw,unit=1,file={}",
                escape_option(&definition.boot_loader.variable_store)
            ),
        ];

        for (index, device) in definition.storage_devices.iter().enumerate() {
            let read_only = if device.read_only { ",readonly=on" } else { "" };
            args.push("-drive".into());
            args.push(format!(
                "if=none,id=disk{},format=raw,file={}{}",
                index,
                escape_option(&device.path),
                read_only
            ));
            args.push("-device".into());
            args.push(format!("virtio-blk-pci,drive=disk{},bootindex={}", index, index));
        }

        for (index, device) in definition.network_devices.iter().enumerate() {
            match device.attachment {
                NetworkAttachment::Nat => {
                    args.push("-netdev".into());
                    args.push(format!("user,id=net{}", index));
                    args.push("-device".into());
                    args.push(format!("virtio-net-pci,netdev=net{}", index));
                }
            }
        }

        for index in 0..definition.console_devices.len() {
            args.push("-chardev".into());
            args.push(format!("stdio,id=console{},signal=off", index));
            args.push("-serial".into());
            args.push(format!("chardev:console{}", index));
        }

        args.extend(["-display", "none", "-monitor", "none"].map(String::from));
        args
    }
}

impl VmBackend for QemuBackend {
    fn name(&self) -> &'static str {
        "qemu"
    }

    fn limits(&self) -> HostLimits {
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get() as u64)
            .unwrap_or(1);

        HostLimits {
            cpu_count,
            min_memory: self.config.min_memory_bytes(),
            max_memory: physical_memory(),
        }
    }

    fn create_variable_store(&self, path: &Path) -> Result<()> {
        use std::fs::OpenOptions;

        let template = self.config.resolve_firmware_vars_template().ok_or_else(|| {
            Error::storage(
                "create EFI variable store",
                "UEFI variable template not found (install OVMF/AAVMF or set firmware_vars_template)",
            )
        })?;

        tracing::debug!(template = %template.display(), path = %path.display(), "copying variable template");

        let mut source = std::fs::File::open(&template).map_err(|e| {
            Error::storage(
                "open UEFI variable template",
                format!("{}: {}", template.display(), e),
            )
        })?;
        let mut dest = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                Error::storage("create EFI variable store", format!("{}: {}", path.display(), e))
            })?;

        std::io::copy(&mut source, &mut dest)
            .map_err(|e| Error::storage("copy UEFI variable template", e.to_string()))?;
        dest.sync_all()
            .map_err(|e| Error::storage("sync EFI variable store", e.to_string()))?;
        Ok(())
    }

    fn validate(&self, definition: &VmDefinition) -> Result<()> {
        definition.validate()?;
        self.firmware_code()?;
        Ok(())
    }

    async fn start(&self, definition: &VmDefinition) -> Result<RunningVm> {
        let firmware_code = self.firmware_code()?;
        let args = self.command_args(definition, &firmware_code);
        let console = definition
            .console_devices
            .first()
            .copied()
            .unwrap_or_else(ConsoleDevice::stdio);

        tracing::debug!(binary = %self.config.qemu_binary, ?args, "spawning engine");

        let mut child = Command::new(&self.config.qemu_binary)
            .args(&args)
            .stdin(dup_stdio(console.input)?)
            .stdout(dup_stdio(console.output)?)
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| Error::StartFailed(format!("{}: {}", self.config.qemu_binary, e)))?;

        match tokio::time::timeout(STARTUP_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                return Err(Error::StartFailed(format!(
                    "engine exited during startup ({})",
                    status
                )));
            }
            Ok(Err(e)) => return Err(Error::StartFailed(e.to_string())),
            Err(_) => {}
        }

        tracing::info!(pid = ?child.id(), "engine running");

        let (tx, vm) = RunningVm::channel();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) if status.success() => GuestExit::Shutdown,
                Ok(status) => GuestExit::Error(format!("engine exited with {}", status)),
                Err(e) => GuestExit::Error(e.to_string()),
            };
            let _ = tx.send(exit);
        });

        Ok(vm)
    }
}

/// Duplicate a console fd for the child process.
fn dup_stdio(fd: RawFd) -> Result<Stdio> {
    // SAFETY: console fds are the process's own open descriptors and
    // outlive this call; the duplicate is owned by the returned Stdio.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let owned = borrowed.try_clone_to_owned()?;
    Ok(Stdio::from(owned))
}

/// Host physical memory in bytes.
fn physical_memory() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let (pages, page_size) =
        unsafe { (libc::sysconf(libc::_SC_PHYS_PAGES), libc::sysconf(libc::_SC_PAGESIZE)) };
    if pages <= 0 || page_size <= 0 {
        return 0;
    }
    (pages as u64).saturating_mul(page_size as u64)
}

/// Escape a path for a QEMU option value (commas are doubled).
fn escape_option(path: &Path) -> String {
    path.to_string_lossy().replace(',', ",,")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{BootLoader, MachineIdentifier, NetworkDevice, Platform, StorageDevice};
    use std::os::unix::fs::PermissionsExt;

    fn definition(dir: &Path, installer: bool) -> VmDefinition {
        let mut storage_devices = Vec::new();
        if installer {
            storage_devices.push(StorageDevice {
                path: dir.join("installer.iso"),
                read_only: true,
            });
        }
        storage_devices.push(StorageDevice {
            path: dir.join("Disk.img"),
            read_only: false,
        });

        VmDefinition {
            cpu_count: 2,
            memory_size: 2 * crate::vm::GIB,
            platform: Platform {
                machine_identifier: MachineIdentifier::generate(),
            },
            boot_loader: BootLoader {
                variable_store: dir.join("NVRAM"),
            },
            storage_devices,
            network_devices: vec![NetworkDevice {
                attachment: NetworkAttachment::Nat,
            }],
            console_devices: vec![ConsoleDevice::stdio()],
        }
    }

    fn script_backend(dir: &Path, body: &str) -> QemuBackend {
        let script = dir.join("fake-qemu");
        std::fs::write(&script, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let firmware = dir.join("CODE.fd");
        std::fs::write(&firmware, b"code").unwrap();

        QemuBackend::new(EfivmConfig {
            qemu_binary: script.to_string_lossy().into_owned(),
            firmware_code: Some(firmware),
            ..EfivmConfig::default()
        })
    }

    #[test]
    fn test_command_args() {
        let dir = Path::new("/vms/test1");
        let backend = QemuBackend::new(EfivmConfig {
            machine: "q35".into(),
            accelerator: "kvm".into(),
            ..EfivmConfig::default()
        });
        let def = definition(dir, true);
        let args = backend.command_args(&def, Path::new("/fw/CODE.fd"));
        let joined = args.join(" ");

        assert!(joined.contains("-machine q35,accel=kvm"));
        assert!(joined.contains("-smp 2"));
        assert!(joined.contains("-m 2048M"));
        assert!(joined.contains(&format!(
            "-uuid {}",
            def.platform.machine_identifier.to_hyphenated()
        )));
        assert!(joined.contains("if=pflash,format=raw,unit=0,readonly=on,file=/fw/CODE.fd"));
        assert!(joined.contains("if=pflash,format=raw,unit=1,file=/vms/test1/NVRAM"));
        assert!(joined.contains("-netdev user,id=net0"));
        assert!(joined.contains("-serial chardev:console0"));

        let iso = joined
            .find("file=/vms/test1/installer.iso,readonly=on")
            .unwrap();
        let disk = joined.find("file=/vms/test1/Disk.img").unwrap();
        assert!(iso < disk);
        assert!(!joined.contains("Disk.img,readonly=on"));
    }

    #[test]
    fn test_command_args_run_has_one_disk() {
        let backend = QemuBackend::new(EfivmConfig::default());
        let args = backend.command_args(&definition(Path::new("/vms/a"), false), Path::new("/fw"));
        let drives = args.iter().filter(|a| a.starts_with("virtio-blk-pci")).count();
        assert_eq!(drives, 1);
    }

    #[test]
    fn test_escape_option() {
        assert_eq!(escape_option(Path::new("/a,b/c")), "/a,,b/c");
    }

    #[test]
    fn test_create_variable_store_copies_template() {
        let temp = tempfile::tempdir().unwrap();
        let template = temp.path().join("VARS.fd");
        std::fs::write(&template, vec![0xAA; 4096]).unwrap();

        let backend = QemuBackend::new(EfivmConfig {
            firmware_vars_template: Some(template),
            ..EfivmConfig::default()
        });
        let store = temp.path().join("NVRAM");
        backend.create_variable_store(&store).unwrap();
        assert_eq!(std::fs::read(&store).unwrap(), vec![0xAA; 4096]);

        // Never recreated over an existing store.
        assert!(backend.create_variable_store(&store).is_err());
    }

    #[test]
    fn test_limits() {
        let limits = QemuBackend::new(EfivmConfig::default()).limits();
        assert!(limits.cpu_count >= 1);
        assert_eq!(limits.min_memory, 128 * MIB);
        assert!(limits.max_memory > limits.min_memory);
    }

    #[tokio::test]
    async fn test_start_failure_inside_grace_period() {
        let temp = tempfile::tempdir().unwrap();
        let backend = script_backend(temp.path(), "exit 1");

        let result = backend.start(&definition(temp.path(), false)).await;
        assert!(matches!(result, Err(Error::StartFailed(_))));
    }

    #[tokio::test]
    async fn test_start_then_shutdown() {
        let temp = tempfile::tempdir().unwrap();
        let backend = script_backend(temp.path(), "sleep 1\nexit 0");

        let vm = backend.start(&definition(temp.path(), false)).await.unwrap();
        assert_eq!(vm.wait().await, GuestExit::Shutdown);
    }

    #[tokio::test]
    async fn test_engine_error_after_start() {
        let temp = tempfile::tempdir().unwrap();
        let backend = script_backend(temp.path(), "sleep 1\nexit 3");

        let vm = backend.start(&definition(temp.path(), false)).await.unwrap();
        assert!(matches!(vm.wait().await, GuestExit::Error(_)));
    }
}
