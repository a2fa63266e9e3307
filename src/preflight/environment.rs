//! Build environment checks (privileges, kernel, sysroot).

use crate::config::Config;

use super::types::CheckResult;

/// Check what the host can materialize and what inputs are in place.
pub fn check_build_environment(config: &Config) -> Vec<CheckResult> {
    let mut results = Vec::new();

    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if euid == 0 {
        results.push(CheckResult::pass_with(
            "Device node creation",
            "running as root, archive device entries unpack as real nodes",
        ));
    } else {
        results.push(CheckResult::warn(
            "Device node creation",
            "not root; device entries unpack as placeholders and staged trees rarely carry /dev nodes",
        ));
    }

    match config.find_kernel() {
        Some(kernel) => results.push(CheckResult::pass_with("Kernel image", &kernel.display().to_string())),
        None => {
            let tried = config
                .kernel_candidates()
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            results.push(CheckResult::warn(
                "Kernel image",
                &format!("Not found (tried {}). Pass --kernel to boot.", tried),
            ));
        }
    }

    if let Some(sysroot) = &config.sysroot {
        if sysroot.is_dir() {
            results.push(CheckResult::pass_with("ROCK_SYSROOT", &sysroot.display().to_string()));
        } else {
            results.push(CheckResult::fail(
                "ROCK_SYSROOT",
                &format!("{} is not a directory", sysroot.display()),
            ));
        }
    }

    results
}
