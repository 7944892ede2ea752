//! CLI command implementations.

pub mod create;
pub mod run;

use efivm::config::EfivmConfig;
use efivm::lifecycle::{Command, Controller};
use efivm::vm::backend;

/// Drive `command` to completion on a single-threaded runtime.
fn execute(command: Command, config: &EfivmConfig) -> efivm::Result<()> {
    let backend = backend::create_default(config)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let mut controller = Controller::new(&backend);
        controller.execute(&command).await
    })
}
