//! Structural and contract verification.
//!
//! Staged directories and built archives are verified the same way: an
//! archive is unpacked by the reader first and its format defects join the
//! findings. The input is never modified.

mod checks;
mod findings;
mod view;

use std::path::Path;

use anyhow::{bail, Context, Result};
use log::debug;

use crate::artifact::checksum;
use crate::artifact::reader::read_archive;
use crate::contract::{contract, IntegrationContract};

pub use checks::{checks_for, Check, CheckId, DevicePolicy, VerifyLevel, VerifyOptions, CHECKS};
pub use findings::{Finding, Findings, VerificationResult};
pub use view::{is_busybox_target, ArchiveFacts, DeviceInfo, FsView};

/// Run the checks selected by `opts.level` against a view.
pub fn verify_view(
    view: &FsView,
    contract: &IntegrationContract,
    opts: &VerifyOptions,
) -> VerificationResult {
    let mut findings = Findings::default();
    let mut ran = Vec::new();
    for check in checks_for(opts.level) {
        debug!("running check {}", check.name);
        (check.run)(view, contract, opts, &mut findings);
        ran.push(check.name.to_string());
    }
    findings.into_result(ran)
}

/// Verify a staged directory.
pub fn verify_tree(root: &Path, opts: &VerifyOptions) -> Result<VerificationResult> {
    if !root.is_dir() {
        bail!("Staged tree not found: {}", root.display());
    }
    Ok(verify_view(&FsView::for_tree(root), contract(), opts))
}

/// Verify a built archive, including its `.sha256` sidecar when present.
pub fn verify_archive(archive: &Path, opts: &VerifyOptions) -> Result<VerificationResult> {
    if !archive.is_file() {
        bail!("Archive not found: {}", archive.display());
    }
    let checksum = checksum::check_sidecar(archive)?;
    let extracted = read_archive(archive)
        .with_context(|| format!("Failed to unpack {}", archive.display()))?;
    let view = FsView::for_archive(&extracted, checksum);
    Ok(verify_view(&view, contract(), opts))
}

/// Verify whichever a path holds, directory or archive.
pub fn verify_path(path: &Path, opts: &VerifyOptions) -> Result<VerificationResult> {
    if path.is_dir() {
        verify_tree(path, opts)
    } else if path.is_file() {
        verify_archive(path, opts)
    } else {
        bail!("Nothing to verify at {}", path.display())
    }
}
