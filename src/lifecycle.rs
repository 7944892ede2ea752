//! VM lifecycle controller.
//!
//! Drives one `create` or `run` invocation through
//! `Idle -> Configuring -> [Provisioning] -> Assembling -> Starting -> Running -> Stopped`.
//! Any error moves the controller to `Failed` and is returned to the caller;
//! nothing here terminates the process.

use crate::error::{Error, Result};
use crate::storage::{DiskImage, VariableStore, VmStore};
use crate::terminal::RawModeGuard;
use crate::user_config::UserConfig;
use crate::vm::{DefinitionBuilder, GuestExit, MachineIdentifier, VmBackend, VmDefinition};
use std::path::PathBuf;

/// What the user asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Provision a new VM from a JSON configuration file, then boot it.
    Create {
        /// Configuration file.
        config: PathBuf,
    },
    /// Boot an existing VM directory.
    Run {
        /// VM directory.
        vm_dir: PathBuf,
    },
}

impl Command {
    fn is_create(&self) -> bool {
        matches!(self, Command::Create { .. })
    }
}

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Nothing done yet.
    Idle,
    /// Loading and validating configuration.
    Configuring,
    /// Creating persistent artifacts (create only).
    Provisioning,
    /// Building the VM definition.
    Assembling,
    /// Waiting for the engine to report start.
    Starting,
    /// Guest is running.
    Running,
    /// Guest shut down.
    Stopped,
    /// A fatal error occurred.
    Failed,
}

impl LifecycleState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Stopped | LifecycleState::Failed)
    }

    fn can_advance_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (Idle, Configuring)
            | (Configuring, Provisioning)
            | (Configuring, Assembling)
            | (Provisioning, Assembling)
            | (Assembling, Starting)
            | (Starting, Running)
            | (Running, Stopped) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    fn expected_next(self) -> &'static str {
        use LifecycleState::*;
        match self {
            Idle => "configuring",
            Configuring => "provisioning or assembling",
            Provisioning => "assembling",
            Assembling => "starting",
            Starting => "running",
            Running => "stopped",
            Stopped | Failed => "no further transition",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Idle => write!(f, "idle"),
            LifecycleState::Configuring => write!(f, "configuring"),
            LifecycleState::Provisioning => write!(f, "provisioning"),
            LifecycleState::Assembling => write!(f, "assembling"),
            LifecycleState::Starting => write!(f, "starting"),
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::Stopped => write!(f, "stopped"),
            LifecycleState::Failed => write!(f, "failed"),
        }
    }
}

/// Artifacts a definition is assembled from.
#[derive(Debug, Clone)]
pub struct Artifacts {
    /// Machine identity.
    pub machine_identifier: MachineIdentifier,
    /// EFI variable store.
    pub variable_store: VariableStore,
    /// Primary disk.
    pub disk: DiskImage,
    /// Installer media; attached on create only.
    pub installer: Option<PathBuf>,
}

/// Drives one VM through its lifecycle.
#[derive(Debug)]
pub struct Controller<'a, B: VmBackend> {
    backend: &'a B,
    state: LifecycleState,
}

impl<'a, B: VmBackend> Controller<'a, B> {
    /// Create an idle controller.
    pub fn new(backend: &'a B) -> Self {
        Self {
            backend,
            state: LifecycleState::Idle,
        }
    }

    /// Current state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    fn advance(&mut self, next: LifecycleState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(Error::InvalidState {
                expected: self.state.expected_next().to_string(),
                actual: next.to_string(),
            });
        }
        tracing::debug!(from = %self.state, to = %next, "lifecycle transition");
        self.state = next;
        Ok(())
    }

    /// Run a command to completion: until the guest stops or an error occurs.
    pub async fn execute(&mut self, command: &Command) -> Result<()> {
        let result = self.execute_inner(command).await;
        if let Err(e) = &result {
            if !self.state.is_terminal() {
                tracing::debug!(state = %self.state, error = %e, "lifecycle failed");
                self.state = LifecycleState::Failed;
            }
        }
        result
    }

    async fn execute_inner(&mut self, command: &Command) -> Result<()> {
        let config = self.configure(command)?;

        let artifacts = if command.is_create() {
            self.provision(&config)?
        } else {
            self.load(&config)?
        };

        // Raw mode must be in place before stdin is bound to the guest.
        let _raw_mode = RawModeGuard::stdin()?;

        let definition = self.assemble(&config, &artifacts)?;
        self.boot(&definition).await
    }

    /// Load and validate the configuration for `command`.
    pub fn configure(&mut self, command: &Command) -> Result<UserConfig> {
        self.advance(LifecycleState::Configuring)?;
        let limits = self.backend.limits();

        match command {
            Command::Create { config } => UserConfig::load_for_create(config, &limits),
            Command::Run { vm_dir } => UserConfig::load_for_run(vm_dir, &limits),
        }
    }

    /// Create every artifact for a new VM, in dependency order.
    ///
    /// There is no rollback: a failure leaves the VM directory as it is.
    pub fn provision(&mut self, config: &UserConfig) -> Result<Artifacts> {
        self.advance(LifecycleState::Provisioning)?;
        let store = VmStore::new(config.paths.clone());

        store.create_vm_dir()?;

        let result = self.create_artifacts(&store, config);
        match result {
            Ok(artifacts) => {
                tracing::info!(vm_dir = %config.paths.vm_dir.display(), "VM provisioned");
                println!("Created VM {} in {}", config.name, config.paths.vm_dir.display());
                Ok(artifacts)
            }
            Err(e) => {
                tracing::debug!(
                    vm_dir = %config.paths.vm_dir.display(),
                    error = %e,
                    "provisioning failed, VM directory left partially populated"
                );
                Err(e)
            }
        }
    }

    /// Create the artifacts inside a freshly created VM directory.
    fn create_artifacts(&self, store: &VmStore, config: &UserConfig) -> Result<Artifacts> {
        store.persist_config(config.document())?;

        let machine_identifier = self.backend.new_machine_identifier();
        store.create_machine_identifier(&machine_identifier)?;

        let variable_store = store.create_variable_store(self.backend)?;
        let disk = store.create_disk_image(config.disk_size_bytes)?;

        Ok(Artifacts {
            machine_identifier,
            variable_store,
            disk,
            installer: Some(config.installer_iso_path.clone()),
        })
    }

    /// Load the artifacts of an existing VM.
    pub fn load(&mut self, config: &UserConfig) -> Result<Artifacts> {
        let store = VmStore::new(config.paths.clone());

        let machine_identifier = store.load_machine_identifier()?;
        let variable_store = store.open_variable_store()?;

        tracing::debug!(id = %machine_identifier, "loaded VM artifacts");
        Ok(Artifacts {
            machine_identifier,
            variable_store,
            disk: store.disk_image(),
            installer: None,
        })
    }

    /// Build and validate the VM definition.
    pub fn assemble(&mut self, config: &UserConfig, artifacts: &Artifacts) -> Result<VmDefinition> {
        self.advance(LifecycleState::Assembling)?;

        let mut builder = DefinitionBuilder::new(config)
            .machine_identifier(artifacts.machine_identifier)
            .variable_store(&artifacts.variable_store)
            .disk(&artifacts.disk);
        if let Some(iso) = &artifacts.installer {
            builder = builder.installer(iso);
        }

        let definition = builder.build()?;
        self.backend.validate(&definition)?;

        tracing::debug!(
            cpus = definition.cpu_count,
            memory = definition.memory_size,
            storage_devices = definition.storage_devices.len(),
            "VM definition assembled"
        );
        Ok(definition)
    }

    /// Start the VM and wait for it to stop.
    pub async fn boot(&mut self, definition: &VmDefinition) -> Result<()> {
        self.advance(LifecycleState::Starting)?;
        let vm = self.backend.start(definition).await?;

        self.advance(LifecycleState::Running)?;
        println!("VM started");

        match vm.wait().await {
            GuestExit::Shutdown => {
                self.advance(LifecycleState::Stopped)?;
                println!("Guest stopped");
                Ok(())
            }
            GuestExit::Error(reason) => Err(Error::GuestFailed(reason)),
        }
    }
}
