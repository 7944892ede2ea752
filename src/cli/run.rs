//! Run command implementation.

use clap::Args;
use efivm::config::EfivmConfig;
use efivm::lifecycle::Command;
use std::path::PathBuf;

/// Boot an existing VM.
#[derive(Args, Debug)]
pub struct RunCmd {
    /// VM directory created by `create`.
    pub vm_dir: PathBuf,
}

impl RunCmd {
    /// Execute the run command.
    pub fn run(self, config: &EfivmConfig) -> efivm::Result<()> {
        super::execute(Command::Run { vm_dir: self.vm_dir }, config)
    }
}
