//! Preflight command - reports host capabilities.

use anyhow::Result;
use std::process::ExitCode;

use crate::config::Config;
use crate::preflight;

use super::print_json;

/// Execute the preflight command.
pub fn cmd_preflight(strict: bool, config: &Config) -> Result<ExitCode> {
    let report = preflight::run_preflight(config);

    if config.json {
        print_json(&report)?;
    } else {
        report.print();
        if !report.all_passed() && !strict {
            println!("Some checks failed. Use --strict to exit non-zero.");
        }
    }

    Ok(if strict && !report.all_passed() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
