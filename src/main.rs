//! efivm CLI entry point.

use clap::{Parser, Subcommand};
use efivm::config::EfivmConfig;
use tracing_subscriber::EnvFilter;

mod cli;

/// efivm - create and run EFI Linux virtual machines
#[derive(Parser, Debug)]
#[command(name = "efivm")]
#[command(about = "Create and run EFI Linux virtual machines")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision a new VM from a JSON configuration and boot its installer.
    Create(cli::create::CreateCmd),

    /// Boot an existing VM directory.
    Run(cli::run::RunCmd),
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to warn
    init_logging();

    tracing::debug!(version = efivm::VERSION, "starting efivm");

    // Load host settings
    let config = match EfivmConfig::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load settings, using defaults");
            EfivmConfig::default()
        }
    };

    // Execute command
    let result = match cli.command {
        Commands::Create(cmd) => cmd.run(&config),
        Commands::Run(cmd) => cmd.run(&config),
    };

    // Handle errors
    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber.
///
/// Logs go to stderr; stdout carries the guest console.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("efivm=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_cli_accepts_one_command_and_one_path() {
        let cli = Cli::try_parse_from(["efivm", "create", "a.json"]).unwrap();
        assert!(matches!(cli.command, Commands::Create(ref cmd) if cmd.config == PathBuf::from("a.json")));

        let cli = Cli::try_parse_from(["efivm", "run", "/vms/x"]).unwrap();
        assert!(matches!(cli.command, Commands::Run(ref cmd) if cmd.vm_dir == PathBuf::from("/vms/x")));
    }

    #[test]
    fn test_cli_rejects_other_shapes() {
        assert!(Cli::try_parse_from(["efivm"]).is_err());
        assert!(Cli::try_parse_from(["efivm", "create"]).is_err());
        assert!(Cli::try_parse_from(["efivm", "run", "a", "b"]).is_err());
        assert!(Cli::try_parse_from(["efivm", "boot", "x"]).is_err());
    }
}
