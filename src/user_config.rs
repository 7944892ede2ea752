//! User VM configuration.
//!
//! Decodes the create-time JSON document (or its persisted copy inside a VM
//! directory), derives artifact paths, and validates the request against the
//! host limits before anything on disk is touched.

use crate::error::{Error, Result};
use crate::storage::{VmPaths, USER_CONFIG_FILENAME};
use crate::vm::{HostLimits, GIB};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Maximum length of a VM name.
const MAX_NAME_LEN: usize = 64;

/// Configuration document as written by the user.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigDocument {
    /// VM name; also the VM directory name.
    pub name: String,
    /// Parent directory of the VM directory.
    pub dir: String,
    /// Primary disk size in GB.
    #[serde(rename = "diskSize")]
    pub disk_size: u64,
    /// Number of vCPUs.
    #[serde(rename = "cpuCount")]
    pub cpu_count: u64,
    /// Memory size in GB.
    #[serde(rename = "memorySize")]
    pub memory_size: u64,
    /// Installer ISO path.
    #[serde(rename = "installerISO")]
    pub installer_iso: String,
}

/// Validated description of one VM instance.
#[derive(Debug, Clone)]
pub struct UserConfig {
    /// VM name.
    pub name: String,
    /// Parent directory of the VM directory.
    pub base_dir: PathBuf,
    /// Primary disk capacity in bytes.
    pub disk_size_bytes: u64,
    /// Number of vCPUs.
    pub cpu_count: u64,
    /// Memory size in bytes.
    pub memory_size_bytes: u64,
    /// Installer media, only attached on create.
    pub installer_iso_path: PathBuf,
    /// Artifact locations inside the VM directory.
    pub paths: VmPaths,
    document: Vec<u8>,
}

impl UserConfig {
    /// Load the create-time configuration from a JSON file.
    pub fn load_for_create(path: &Path, limits: &HostLimits) -> Result<Self> {
        let document = std::fs::read(path).map_err(|e| {
            Error::config("read configuration", format!("{}: {}", path.display(), e))
        })?;

        let config = Self::decode(path, document, None)?;
        config.validate(limits)?;

        if !config.installer_iso_path.is_file() {
            return Err(Error::config(
                "validate installerISO",
                format!("not a file: {}", config.installer_iso_path.display()),
            ));
        }

        tracing::debug!(vm_dir = %config.paths.vm_dir.display(), "loaded create configuration");
        Ok(config)
    }

    /// Load the configuration persisted inside an existing VM directory.
    ///
    /// Artifacts are located under `vm_dir`, not under the persisted
    /// `dir`/`name` pair.
    pub fn load_for_run(vm_dir: &Path, limits: &HostLimits) -> Result<Self> {
        let path = vm_dir.join(USER_CONFIG_FILENAME);
        let document = std::fs::read(&path)
            .map_err(|e| Error::artifact_load("configuration", &path, e))?;

        let config = Self::decode(&path, document, Some(vm_dir))?;

        let recorded = config.base_dir.join(&config.name);
        if !same_location(&recorded, vm_dir) {
            tracing::warn!(
                recorded = %recorded.display(),
                actual = %vm_dir.display(),
                "VM directory has moved since creation"
            );
        }

        config.validate(limits)?;

        tracing::debug!(vm_dir = %config.paths.vm_dir.display(), "loaded persisted configuration");
        Ok(config)
    }

    /// Decode a configuration document and derive its paths.
    pub fn decode(source: &Path, document: Vec<u8>, vm_dir: Option<&Path>) -> Result<Self> {
        let parsed: ConfigDocument =
            serde_json::from_slice(&document).map_err(|e| Error::ConfigParse {
                path: source.to_path_buf(),
                source: e,
            })?;

        validate_name(&parsed.name)?;

        let base_dir = PathBuf::from(&parsed.dir);
        let vm_dir = match vm_dir {
            Some(dir) => dir.to_path_buf(),
            None => base_dir.join(&parsed.name),
        };

        Ok(Self {
            paths: VmPaths::new(vm_dir),
            disk_size_bytes: gib_to_bytes("diskSize", parsed.disk_size)?,
            memory_size_bytes: gib_to_bytes("memorySize", parsed.memory_size)?,
            cpu_count: parsed.cpu_count,
            installer_iso_path: PathBuf::from(parsed.installer_iso),
            name: parsed.name,
            base_dir,
            document,
        })
    }

    /// Check the request against the host limits.
    pub fn validate(&self, limits: &HostLimits) -> Result<()> {
        if self.disk_size_bytes == 0 {
            return Err(Error::config("validate diskSize", "disk size must be at least 1 GB"));
        }
        if self.cpu_count == 0 {
            return Err(Error::config("validate cpuCount", "cpu count must be at least 1"));
        }

        limits.check_cpus(self.cpu_count)?;
        limits.check_memory(self.memory_size_bytes)?;
        Ok(())
    }

    /// The configuration document exactly as it was read.
    pub fn document(&self) -> &[u8] {
        &self.document
    }
}

/// Convert a GB quantity to bytes.
fn gib_to_bytes(field: &str, gib: u64) -> Result<u64> {
    gib.checked_mul(GIB).ok_or_else(|| {
        Error::config(
            format!("validate {}", field),
            format!("{} GB does not fit in a byte count", gib),
        )
    })
}

/// Validate a VM name used as a directory name.
///
/// Rules:
/// - Length: 1..=64 characters
/// - Allowed characters: alphanumeric, hyphen (-), underscore (_), dot (.)
/// - Must start with a letter or digit
/// - No path separators (/, \)
pub fn validate_name(name: &str) -> Result<()> {
    let first_char = name
        .chars()
        .next()
        .ok_or_else(|| Error::config("validate name", "VM name cannot be empty"))?;

    if name.len() > MAX_NAME_LEN {
        return Err(Error::config(
            "validate name",
            format!(
                "VM name too long: {} characters (max {})",
                name.len(),
                MAX_NAME_LEN
            ),
        ));
    }

    if !first_char.is_ascii_alphanumeric() {
        return Err(Error::config(
            "validate name",
            "VM name must start with a letter or digit",
        ));
    }

    for c in name.chars() {
        if c == '/' || c == '\\' {
            return Err(Error::config(
                "validate name",
                "VM name cannot contain path separators",
            ));
        }
        if !c.is_ascii_alphanumeric() && c != '-' && c != '_' && c != '.' {
            return Err(Error::config(
                "validate name",
                format!("VM name contains invalid character: '{}'", c),
            ));
        }
    }

    Ok(())
}

/// Compare two directory paths, resolving them when possible.
fn same_location(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a.components().eq(b.components()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{"name":"test1","dir":"/tmp/vms/","diskSize":1,"cpuCount":2,"memorySize":2,"installerISO":"/tmp/x.iso"}"#;

    fn limits() -> HostLimits {
        HostLimits {
            cpu_count: 4,
            min_memory: 128 * 1024 * 1024,
            max_memory: 16 * GIB,
        }
    }

    fn decode(json: &str) -> Result<UserConfig> {
        UserConfig::decode(Path::new("config.json"), json.as_bytes().to_vec(), None)
    }

    #[test]
    fn test_decode_derives_paths() {
        let config = decode(SAMPLE).unwrap();

        assert_eq!(config.name, "test1");
        assert_eq!(config.disk_size_bytes, 1_073_741_824);
        assert_eq!(config.memory_size_bytes, 2 * 1_073_741_824);
        assert_eq!(config.cpu_count, 2);
        assert_eq!(config.paths.vm_dir, PathBuf::from("/tmp/vms/test1"));
        assert_eq!(
            config.paths.main_disk_image,
            PathBuf::from("/tmp/vms/test1/Disk.img")
        );
        assert_eq!(
            config.paths.machine_identifier,
            PathBuf::from("/tmp/vms/test1/MachineIdentifier")
        );
        assert_eq!(
            config.paths.efi_variable_store,
            PathBuf::from("/tmp/vms/test1/NVRAM")
        );
        assert_eq!(config.document(), SAMPLE.as_bytes());
        assert!(config.validate(&limits()).is_ok());
    }

    #[test]
    fn test_trailing_slash_optional() {
        let with = decode(SAMPLE).unwrap();
        let without = decode(&SAMPLE.replace("/tmp/vms/", "/tmp/vms")).unwrap();
        assert_eq!(with.paths, without.paths);
    }

    #[test]
    fn test_missing_field_rejected() {
        let json = r#"{"name":"test1","dir":"/tmp/vms/","diskSize":1,"cpuCount":2,"memorySize":2}"#;
        assert!(matches!(decode(json), Err(Error::ConfigParse { .. })));
    }

    #[test]
    fn test_wrong_type_rejected() {
        let json = SAMPLE.replace("\"cpuCount\":2", "\"cpuCount\":\"2\"");
        assert!(matches!(decode(&json), Err(Error::ConfigParse { .. })));
    }

    #[test]
    fn test_cpu_over_host_rejected() {
        let config = decode(&SAMPLE.replace("\"cpuCount\":2", "\"cpuCount\":5")).unwrap();
        assert!(matches!(
            config.validate(&limits()),
            Err(Error::CpuLimit { .. })
        ));
    }

    #[test]
    fn test_memory_out_of_bounds_rejected() {
        let config = decode(&SAMPLE.replace("\"memorySize\":2", "\"memorySize\":17")).unwrap();
        assert!(matches!(
            config.validate(&limits()),
            Err(Error::MemoryLimit { .. })
        ));

        let config = decode(&SAMPLE.replace("\"memorySize\":2", "\"memorySize\":0")).unwrap();
        assert!(matches!(
            config.validate(&limits()),
            Err(Error::MemoryLimit { .. })
        ));
    }

    #[test]
    fn test_zero_disk_and_cpu_rejected() {
        let config = decode(&SAMPLE.replace("\"diskSize\":1", "\"diskSize\":0")).unwrap();
        assert!(matches!(config.validate(&limits()), Err(Error::Config { .. })));

        let config = decode(&SAMPLE.replace("\"cpuCount\":2", "\"cpuCount\":0")).unwrap();
        assert!(matches!(config.validate(&limits()), Err(Error::Config { .. })));
    }

    #[test]
    fn test_size_overflow_rejected() {
        let json = SAMPLE.replace("\"diskSize\":1", &format!("\"diskSize\":{}", u64::MAX));
        assert!(matches!(decode(&json), Err(Error::Config { .. })));
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("test1").is_ok());
        assert!(validate_name("debian-12.5_arm").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name(".hidden").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("a\\b").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name(&"a".repeat(65)).is_err());
    }

    #[test]
    fn test_unreadable_create_input_is_config_error() {
        let temp = tempfile::tempdir().unwrap();
        let err = UserConfig::load_for_create(&temp.path().join("missing.json"), &limits())
            .unwrap_err();
        assert!(matches!(err, Error::Config { ref operation, .. } if operation == "read configuration"));

        // The persisted copy of a VM is an artifact, not user input.
        let err = UserConfig::load_for_run(temp.path(), &limits()).unwrap_err();
        assert!(matches!(err, Error::ArtifactLoad { .. }));
    }

    #[test]
    fn test_run_uses_given_directory() {
        let config = UserConfig::decode(
            Path::new("UserConfig.json"),
            SAMPLE.as_bytes().to_vec(),
            Some(Path::new("/srv/moved/test1")),
        )
        .unwrap();
        assert_eq!(config.paths.vm_dir, PathBuf::from("/srv/moved/test1"));
        assert_eq!(config.base_dir, PathBuf::from("/tmp/vms/"));
    }
}
