//! Verify command - checks a staged tree or archive against the contract.

use anyhow::Result;
use std::path::Path;
use std::process::ExitCode;

use crate::config::Config;
use crate::verify::{self, DevicePolicy, VerifyLevel, VerifyOptions};

use super::print_json;

/// Execute the verify command. Exit 1 means the image will not boot.
pub fn cmd_verify(
    path: &Path,
    level: VerifyLevel,
    strict_devices: bool,
    config: &Config,
) -> Result<ExitCode> {
    let opts = VerifyOptions {
        level,
        device_policy: if strict_devices || config.strict_devices {
            DevicePolicy::Strict
        } else {
            DevicePolicy::Lenient
        },
    };

    if !config.json {
        println!("=== Verifying {} ({}) ===\n", path.display(), level);
    }

    let result = verify::verify_path(path, &opts)?;

    if config.json {
        print_json(&result)?;
    } else {
        result.print();
    }

    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
