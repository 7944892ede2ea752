//! efivm - create and boot EFI Linux virtual machines.
//!
//! A VM is provisioned once by `create` into a self-contained directory
//! (disk image, machine identity, EFI variable store, configuration copy)
//! and booted from that directory by every later `run`.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod storage;
pub mod terminal;
pub mod user_config;
pub mod vm;

pub use error::{Error, Result};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
