//! Emulator and virtualization checks.

use std::path::Path;

use crate::process::{self, Cmd};

use super::types::CheckResult;

/// Check the boot-trial emulator and KVM.
pub fn check_host_tools(emulator: &str) -> Vec<CheckResult> {
    let mut results = Vec::new();

    match process::which(emulator) {
        Some(path) => {
            let version = Cmd::new(emulator)
                .arg("--version")
                .run()
                .ok()
                .and_then(|r| r.stdout.lines().next().map(str::to_string))
                .unwrap_or_default();
            let details = if version.is_empty() {
                path.display().to_string()
            } else {
                format!("{} ({})", path.display(), version)
            };
            results.push(CheckResult::pass_with(emulator, &details));
        }
        None => results.push(CheckResult::fail(
            emulator,
            "Not found. Install QEMU (qemu-system-x86) or set ROCK_QEMU. Boot trials are unavailable.",
        )),
    }

    if Path::new("/dev/kvm").exists() {
        results.push(CheckResult::pass_with("KVM", "/dev/kvm present, trials use -enable-kvm"));
    } else {
        results.push(CheckResult::warn(
            "KVM",
            "/dev/kvm not available; trials run under TCG and may need a longer --timeout",
        ));
    }

    results
}
