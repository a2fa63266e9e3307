//! Host capability checks.
//!
//! Reports whether this host can run boot trials and create device nodes.
//! Run with `rock-image preflight`.

mod environment;
mod host_tools;
mod types;

use crate::config::Config;

pub use types::{CheckResult, CheckStatus, PreflightReport};

/// Run all preflight checks.
pub fn run_preflight(config: &Config) -> PreflightReport {
    let mut checks = Vec::new();
    checks.extend(host_tools::check_host_tools(&config.emulator));
    checks.extend(environment::check_build_environment(config));
    PreflightReport { checks }
}
