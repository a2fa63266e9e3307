//! Shared test utilities for rock-image tests.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use rock_image::contract::{contract, BUSYBOX_PATH};
use rock_image::verify::VerificationResult;

/// Test environment with a staged tree and an output directory.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    /// Staged initramfs root
    pub staging: PathBuf,
    /// Where archives are written
    pub output: PathBuf,
    pub base_dir: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let base = temp_dir.path();

        let staging = base.join("staging");
        let output = base.join("output");
        fs::create_dir_all(&staging).expect("Failed to create staging dir");
        fs::create_dir_all(&output).expect("Failed to create output dir");

        Self {
            staging,
            output,
            base_dir: base.to_path_buf(),
            _temp_dir: temp_dir,
        }
    }

    /// Path of an archive in the output directory.
    pub fn archive(&self, name: &str) -> PathBuf {
        self.output.join(name)
    }

    /// Host path of an absolute image path inside the staged tree.
    pub fn staged(&self, image_path: &str) -> PathBuf {
        self.staging.join(image_path.trim_start_matches('/'))
    }
}

// =============================================================================
// Fake ELF files
// =============================================================================

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;
const DT_NEEDED: u64 = 1;
const DT_STRTAB: u64 = 5;
const DT_STRSZ: u64 = 10;

/// Minimal x86_64 ELF64 image. `needed: None` leaves out the dynamic
/// segment (static binary).
pub fn fake_elf(needed: Option<&[&str]>, interp: Option<&str>) -> Vec<u8> {
    let mut strtab = vec![0u8];
    let mut offsets = Vec::new();
    for name in needed.unwrap_or(&[]) {
        offsets.push(strtab.len() as u64);
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);
    }

    let phnum: u64 = 1 + needed.is_some() as u64 + interp.is_some() as u64;
    let dyn_off = 64 + 56 * phnum;
    let dyn_len = if needed.is_some() { 16 * (offsets.len() as u64 + 3) } else { 0 };
    let interp_off = dyn_off + dyn_len;
    let interp_bytes = interp.map(|s| format!("{}\0", s)).unwrap_or_default();
    let strtab_off = interp_off + interp_bytes.len() as u64;
    let total = strtab_off + strtab.len() as u64;

    let mut out = Vec::new();
    out.extend_from_slice(b"\x7fELF\x02\x01\x01\0\0\0\0\0\0\0\0\0");
    out.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    out.extend_from_slice(&62u16.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&0u64.to_le_bytes());
    out.extend_from_slice(&64u64.to_le_bytes());
    out.extend_from_slice(&0u64.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&64u16.to_le_bytes());
    out.extend_from_slice(&56u16.to_le_bytes());
    out.extend_from_slice(&(phnum as u16).to_le_bytes());
    out.extend_from_slice(&[0u8; 6]);

    let mut phdr = |p_type: u32, off: u64, len: u64| {
        out.extend_from_slice(&p_type.to_le_bytes());
        out.extend_from_slice(&4u32.to_le_bytes());
        for _ in 0..3 {
            out.extend_from_slice(&off.to_le_bytes());
        }
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&8u64.to_le_bytes());
    };
    phdr(PT_LOAD, 0, total);
    if needed.is_some() {
        phdr(PT_DYNAMIC, dyn_off, dyn_len);
    }
    if interp.is_some() {
        phdr(PT_INTERP, interp_off, interp_bytes.len() as u64);
    }

    if needed.is_some() {
        for off in &offsets {
            out.extend_from_slice(&DT_NEEDED.to_le_bytes());
            out.extend_from_slice(&off.to_le_bytes());
        }
        out.extend_from_slice(&DT_STRTAB.to_le_bytes());
        out.extend_from_slice(&strtab_off.to_le_bytes());
        out.extend_from_slice(&DT_STRSZ.to_le_bytes());
        out.extend_from_slice(&(strtab.len() as u64).to_le_bytes());
        out.extend_from_slice(&[0u8; 16]);
    }
    out.extend_from_slice(interp_bytes.as_bytes());
    out.extend_from_slice(&strtab);
    out
}

/// Statically linked fake binary.
pub fn static_elf() -> Vec<u8> {
    fake_elf(None, None)
}

/// Write `data` to `path` with the given mode, creating parents.
pub fn write_file(path: &Path, data: &[u8], mode: u32) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create parent dir");
    }
    fs::write(path, data).expect("Failed to write file");
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).expect("Failed to set permissions");
}

/// Create a symlink, creating parents.
pub fn make_symlink(target: &str, link: &Path) {
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent).expect("Failed to create parent dir");
    }
    symlink(target, link).expect("Failed to create symlink");
}

// =============================================================================
// Staged trees
// =============================================================================

/// A tree that satisfies the contract: every binary (static ELF, 0755),
/// `/bin/sh -> busybox`, every directory and every busybox command link.
/// Device nodes are left out (creating them needs root).
pub fn stage_scenario_a(root: &Path) {
    let c = contract();
    for dir in c.directories {
        fs::create_dir_all(root.join(dir.path.trim_start_matches('/'))).expect("Failed to create dir");
    }
    for binary in c.binaries {
        write_file(
            &root.join(binary.destination.trim_start_matches('/')),
            &static_elf(),
            binary.permissions,
        );
    }
    make_symlink("busybox", &root.join("bin/sh"));
    for command in c.busybox_commands.iter().filter(|c| **c != "sh") {
        make_symlink(BUSYBOX_PATH, &root.join("bin").join(command));
    }
}

// =============================================================================
// Assertions
// =============================================================================

/// Assert a verification passed, showing the findings if not.
pub fn assert_passes(result: &VerificationResult) {
    assert!(
        result.success && result.critical_errors.is_empty(),
        "Expected success, got critical errors: {:#?}",
        result.critical_errors
    );
}

/// Assert a verification failed with a critical error naming `path`.
pub fn assert_critical(result: &VerificationResult, path: &str) {
    assert!(!result.success, "Expected failure for {}", path);
    assert!(
        result.has_critical_for(path),
        "Expected a critical error for {}, got: {:#?}",
        path,
        result.critical_errors
    );
}

/// Assert that a symlink exists and points to the expected target.
pub fn assert_symlink(path: &Path, expected_target: &str) {
    assert!(
        path.is_symlink(),
        "Expected symlink at {}, but it's not a symlink",
        path.display()
    );
    let target = fs::read_link(path).expect("Failed to read symlink");
    assert_eq!(
        target.to_string_lossy(),
        expected_target,
        "Symlink {} points to {:?}, expected {}",
        path.display(),
        target,
        expected_target
    );
}

/// Assert that a file exists.
pub fn assert_file_exists(path: &Path) {
    assert!(path.exists(), "Expected file to exist: {}", path.display());
}
