//! Scan command - reports a binary's shared library dependencies.

use anyhow::{Context, Result};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use crate::config::Config;
use crate::elf::{self, ElfError, ResolverConfig, ScanReport};

use super::print_json;

/// Execute the scan command. Exit 1 when a non-system dependency is unresolved.
pub fn cmd_scan(
    binary: &Path,
    search_paths: Vec<PathBuf>,
    sysroot: Option<PathBuf>,
    recursive: bool,
    config: &Config,
) -> Result<ExitCode> {
    let sysroot = sysroot.or_else(|| config.sysroot.clone());
    let search_dirs = if search_paths.is_empty() {
        let mut effective = config.clone();
        effective.sysroot = sysroot.clone();
        effective.library_search_paths()
    } else {
        search_paths
    };

    let mut resolver = ResolverConfig::new(search_dirs);
    if let Some(root) = sysroot {
        resolver = resolver.with_sysroot(root);
    }

    let result = if recursive {
        elf::scan_recursive(binary, &resolver)
    } else {
        elf::scan(binary, &resolver)
    };

    let report = match result {
        Ok(report) => report,
        Err(ElfError::Script(interp)) => {
            if config.json {
                print_json(&json!({
                    "binary": binary,
                    "script": true,
                    "interpreter": interp,
                    "dependencies": [],
                }))?;
            } else {
                println!("{}: script (interpreter: {}), no library dependencies", binary.display(), interp);
            }
            return Ok(ExitCode::SUCCESS);
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Cannot scan {}", binary.display()));
        }
    };

    if config.json {
        print_json(&report)?;
    } else {
        print_report(&report, &resolver);
    }

    Ok(if report.is_satisfied() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_report(report: &ScanReport, resolver: &ResolverConfig) {
    println!("=== Dependencies of {} ===\n", report.binary.display());
    println!("  Architecture: {}", report.architecture);
    println!("  C library: {}", report.libc);
    if let Some(interp) = &report.interpreter {
        println!("  Interpreter: {}", interp);
    }
    println!(
        "  Portable: {}",
        if report.portable { "yes" } else { "no (glibc or unknown libc)" }
    );
    println!();

    if report.is_static {
        println!("  Statically linked, no dependencies");
    } else {
        for dep in &report.dependencies {
            match (&dep.resolved_path, &dep.real_path) {
                (Some(path), Some(real)) => println!(
                    "  ✓ {} => {} -> {}",
                    dep.library_name,
                    path.display(),
                    real.display()
                ),
                (Some(path), None) => println!("  ✓ {} => {}", dep.library_name, path.display()),
                (None, _) if dep.system_provided => {
                    println!("  ○ {} (system provided)", dep.library_name)
                }
                (None, _) => println!("  ✗ {} => NOT FOUND", dep.library_name),
            }
        }
    }

    println!();
    println!(
        "  Size: {} KB ({} KB with dependencies)",
        report.binary_size / 1024,
        report.total_size / 1024
    );

    let missing: Vec<_> = report.unresolved().collect();
    if !missing.is_empty() {
        println!();
        println!("✗ {} unresolved dependencies. Searched:", missing.len());
        for dir in &resolver.search_dirs {
            println!("    {}", dir.display());
        }
    }
}
