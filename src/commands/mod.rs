//! CLI command handlers.
//!
//! Each submodule handles a specific CLI command:
//! - `build` - Build an initramfs from a staged tree
//! - `verify` - Verify a staged tree or built archive
//! - `scan` - Report a binary's shared library dependencies
//! - `boot` - Boot an archive under QEMU and classify the result
//! - `extract` - Unpack an archive for inspection
//! - `show` - Display the contract, configuration or command line
//! - `preflight` - Report host capabilities
//!
//! Handlers return the process exit code; only `main` exits.

mod boot;
mod build;
mod extract;
mod preflight;
mod scan;
pub mod show;
mod verify;

use anyhow::Result;
use serde::Serialize;

pub use boot::{cmd_boot, BootArgs, EXIT_HOST_NOT_CAPABLE};
pub use build::cmd_build;
pub use extract::cmd_extract;
pub use preflight::cmd_preflight;
pub use scan::cmd_scan;
pub use show::cmd_show;
pub use verify::cmd_verify;

/// Print a value as pretty JSON on stdout.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
