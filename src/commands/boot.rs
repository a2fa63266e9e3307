//! Boot command - one QEMU boot trial of a built archive.

use anyhow::Result;
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use crate::config::Config;
use crate::contract::BootMode;
use crate::qemu::{self, BootConfig, BootError, BootOutcome, BootTrial};

use super::print_json;

/// Exit code when the host cannot run a boot trial at all.
pub const EXIT_HOST_NOT_CAPABLE: u8 = 3;

/// Flags for the boot command.
pub struct BootArgs {
    pub archive: PathBuf,
    pub kernel: Option<PathBuf>,
    pub mode: BootMode,
    pub timeout: Option<u64>,
    pub memory: Option<u32>,
    pub append: Vec<String>,
}

/// Execute the boot command.
///
/// Exit codes: 0 success or partial success, 1 failed, 2 inconclusive,
/// 3 host cannot run boot trials (no emulator, emulator will not start,
/// or no kernel).
pub fn cmd_boot(args: BootArgs, config: &Config) -> Result<ExitCode> {
    let kernel = match args.kernel.or_else(|| config.find_kernel()) {
        Some(kernel) => kernel,
        None => {
            let reason = "no kernel image (pass --kernel or set ROCK_KERNEL)".to_string();
            return host_not_capable(&reason, config);
        }
    };

    let mut boot = BootConfig::new(kernel, &args.archive);
    boot.emulator = config.emulator.clone();
    boot.mode = args.mode;
    boot.timeout = args
        .timeout
        .map(Duration::from_secs)
        .unwrap_or(config.boot_timeout);
    boot.memory_mb = args.memory.unwrap_or(config.boot_memory_mb);
    boot.extra_params = args.append;

    if !config.json {
        println!("=== Boot Trial ({}) ===\n", boot.mode);
        println!("  Kernel: {}", boot.kernel.display());
        println!("  Initramfs: {}", boot.archive.display());
        println!("  Timeout: {}s", boot.timeout.as_secs());
        println!();
    }

    let json = config.json;
    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(qemu::run_boot_trial(&boot, |chunk| {
        if !json {
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(chunk);
            let _ = out.flush();
        }
    }));

    let trial = match result {
        Ok(trial) => trial,
        Err(BootError::HostNotCapable(reason)) => return host_not_capable(&reason, config),
        Err(BootError::MissingInput { what: "kernel", path }) => {
            return host_not_capable(&format!("kernel not found: {}", path.display()), config);
        }
        Err(e @ BootError::Spawn { .. }) => return host_not_capable(&e.to_string(), config),
        Err(e) => return Err(e.into()),
    };

    if config.json {
        print_json(&trial)?;
    } else {
        print_verdict(&trial);
    }

    Ok(ExitCode::from(exit_code(trial.outcome)))
}

/// CLI exit code for a trial outcome.
pub fn exit_code(outcome: BootOutcome) -> u8 {
    match outcome {
        BootOutcome::Success | BootOutcome::PartialSuccess => 0,
        BootOutcome::Failed => 1,
        BootOutcome::Inconclusive => 2,
    }
}

fn host_not_capable(reason: &str, config: &Config) -> Result<ExitCode> {
    if config.json {
        print_json(&json!({ "outcome": "host_not_capable", "reason": reason }))?;
    } else {
        eprintln!("[WARN] Boot trial skipped: {}", reason);
        eprintln!("       Run 'rock-image preflight' to check this host.");
    }
    Ok(ExitCode::from(EXIT_HOST_NOT_CAPABLE))
}

fn print_verdict(trial: &BootTrial) {
    println!();
    println!("=== Boot Result: {} ===", trial.outcome);
    if let Some(marker) = &trial.marker {
        println!("  Marker: {}", marker);
    }
    println!("  Cmdline: {}", trial.cmdline);
    println!("  Elapsed: {:.1}s", trial.elapsed_ms as f64 / 1000.0);
    match trial.outcome {
        BootOutcome::Success => println!("✓ rock-init started"),
        BootOutcome::PartialSuccess => {
            println!("⚠ Kernel handed off to /sbin/init, but rock-init never reported in")
        }
        BootOutcome::Failed => println!("✗ Boot failed"),
        BootOutcome::Inconclusive => {
            println!("⚠ No boot marker before the deadline; try a longer --timeout")
        }
    }
}
