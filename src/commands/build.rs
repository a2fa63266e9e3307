//! Build command - packs a staged tree into a verified initramfs.

use anyhow::{bail, Result};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use crate::artifact::{self, BuildError, BuildOptions};
use crate::config::Config;
use crate::verify::{DevicePolicy, VerifyOptions};

use super::print_json;

/// Default archive name when `-o` is not given.
pub const DEFAULT_OUTPUT: &str = "initramfs.cpio.gz";

/// Execute the build command.
pub fn cmd_build(
    tree: &Path,
    output: Option<PathBuf>,
    gzip_level: Option<u32>,
    strict_devices: bool,
    config: &Config,
) -> Result<ExitCode> {
    let gzip_level = gzip_level.unwrap_or(config.gzip_level);
    if !(1..=9).contains(&gzip_level) {
        bail!("--gzip-level must be between 1 and 9 (got {})", gzip_level);
    }
    let output = output.unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT));

    let opts = BuildOptions {
        gzip_level,
        source_date_epoch: config.source_date_epoch,
        verify: VerifyOptions {
            device_policy: if strict_devices || config.strict_devices {
                DevicePolicy::Strict
            } else {
                DevicePolicy::Lenient
            },
            ..VerifyOptions::default()
        },
    };

    if !config.json {
        println!("=== Building Initramfs ===\n");
        println!("  Source: {}", tree.display());
        println!("  Output: {}", output.display());
        println!();
    }
    let start = Instant::now();

    match artifact::build_initramfs(tree, &output, &opts) {
        Ok(report) => {
            if config.json {
                print_json(&report)?;
            } else {
                for w in &report.warnings {
                    println!("  [WARN] {}", w);
                }
                if !report.warnings.is_empty() {
                    println!();
                }
                println!("=== Initramfs Complete ===");
                println!("  Archive: {}", report.output.display());
                println!("  Entries: {}", report.entries);
                println!("  Size: {} KB", report.size / 1024);
                println!("  SHA256: {}", report.sha256);
                println!("  Time: {:.1}s", start.elapsed().as_secs_f64());
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => match err.findings() {
            Some(findings) => {
                if config.json {
                    print_json(&json!({
                        "success": false,
                        "error": err.to_string(),
                        "findings": findings,
                    }))?;
                } else {
                    findings.print();
                    println!();
                    eprintln!("✗ {}", err);
                }
                Ok(ExitCode::FAILURE)
            }
            None => match err {
                BuildError::SourceMissing(path) => {
                    bail!("Staged tree not found: {}", path.display())
                }
                other => Err(other.into()),
            },
        },
    }
}
