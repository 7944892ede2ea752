//! Create command implementation.

use clap::Args;
use efivm::config::EfivmConfig;
use efivm::lifecycle::Command;
use std::path::PathBuf;

/// Provision a new VM and boot it with the installer attached.
#[derive(Args, Debug)]
pub struct CreateCmd {
    /// JSON configuration file.
    pub config: PathBuf,
}

impl CreateCmd {
    /// Execute the create command.
    pub fn run(self, config: &EfivmConfig) -> efivm::Result<()> {
        super::execute(Command::Create { config: self.config }, config)
    }
}
