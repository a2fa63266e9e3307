//! Integration tests for the rock-image builder, reader and verifier.
//!
//! Staged trees are built in temp dirs with fake static ELF binaries, so
//! none of these tests need root, QEMU or real ROCK-OS binaries.

mod helpers;

use flate2::write::GzEncoder;
use flate2::Compression;
use regex::Regex;
use std::ffi::OsStr;
use std::fs;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

use helpers::{
    assert_critical, assert_file_exists, assert_passes, fake_elf, make_symlink, stage_scenario_a,
    static_elf, write_file, TestEnv,
};
use rock_image::artifact::checksum::{self, sidecar_path};
use rock_image::artifact::cpio::{EntryKind, Header, NewcWriter};
use rock_image::artifact::{self, BuildError, BuildOptions};
use rock_image::contract::{contract, ROCK_INIT_PATH, SHELL_PATH, VOLCANO_AGENT_PATH};
use rock_image::elf::{self, ResolverConfig};
use rock_image::verify::{self, DevicePolicy, VerifyLevel, VerifyOptions};

fn remove_path(path: &Path) {
    let meta = fs::symlink_metadata(path).expect("path to remove should exist");
    if meta.is_dir() {
        fs::remove_dir_all(path).unwrap();
    } else {
        fs::remove_file(path).unwrap();
    }
}

fn build(env: &TestEnv, name: &str) -> Result<artifact::BuildReport, BuildError> {
    artifact::build_initramfs(&env.staging, &env.archive(name), &BuildOptions::default())
}

// =============================================================================
// Contract scenarios
// =============================================================================

#[test]
fn test_scenario_a_complete_tree_passes() {
    let env = TestEnv::new();
    stage_scenario_a(&env.staging);

    let result = verify::verify_tree(&env.staging, &VerifyOptions::default()).unwrap();
    assert_passes(&result);
    assert_eq!(result.checks.len(), 7);
}

#[test]
fn test_scenario_b_missing_agent_is_the_only_critical_error() {
    let env = TestEnv::new();
    stage_scenario_a(&env.staging);
    fs::remove_file(env.staged(VOLCANO_AGENT_PATH)).unwrap();

    let result = verify::verify_tree(&env.staging, &VerifyOptions::default()).unwrap();
    assert!(!result.success);
    assert_eq!(
        result.critical_errors.len(),
        1,
        "unexpected critical errors: {:#?}",
        result.critical_errors
    );
    assert_eq!(result.critical_errors[0].path, VOLCANO_AGENT_PATH);
}

#[test]
fn test_scenario_c_dot_slash_names_fail_self_verification() {
    let env = TestEnv::new();
    let archive = env.archive("dotslash.cpio.gz");

    // Same content as a good image, but every name carries a "./" prefix.
    let mut writer = NewcWriter::new(GzEncoder::new(Vec::new(), Compression::default()));
    let dir = |ino| Header {
        ino,
        mode: EntryKind::Directory.type_bits() | 0o755,
        nlink: 2,
        ..Default::default()
    };
    let file = |ino| Header {
        ino,
        mode: EntryKind::File.type_bits() | 0o755,
        nlink: 1,
        ..Default::default()
    };
    let mut ino = 1;
    for d in ["./sbin", "./bin", "./usr", "./usr/bin", "./proc", "./sys", "./dev"] {
        writer.write_raw(dir(ino), d, b"").unwrap();
        ino += 1;
    }
    for b in contract().binaries {
        let name = format!(".{}", b.destination);
        writer.write_raw(file(ino), &name, &static_elf()).unwrap();
        ino += 1;
    }
    let gz = writer.finish().unwrap();
    fs::write(&archive, gz.finish().unwrap()).unwrap();

    let result = artifact::self_verify(&archive, &VerifyOptions::default()).unwrap();
    assert!(!result.success);
    assert!(
        result.has_critical_for("./sbin/init"),
        "expected a defect for ./sbin/init: {:#?}",
        result.critical_errors
    );
    // Nothing was unpacked under the unprefixed name either.
    assert_critical(&result, ROCK_INIT_PATH);
}

// =============================================================================
// Builder
// =============================================================================

#[test]
fn test_build_then_verify_matches_tree_verification() {
    let env = TestEnv::new();
    stage_scenario_a(&env.staging);

    let report = build(&env, "initramfs.cpio.gz").unwrap();
    assert_file_exists(&report.output);
    assert_file_exists(&sidecar_path(&report.output));
    assert!(report.entries > contract().binaries.len());
    assert_eq!(report.sha256, checksum::sha256_file(&report.output).unwrap());

    let tree = verify::verify_tree(&env.staging, &VerifyOptions::default()).unwrap();
    let archive = verify::verify_archive(&report.output, &VerifyOptions::default()).unwrap();
    assert_passes(&archive);
    assert_eq!(tree.critical_errors, archive.critical_errors);

    // Verifying twice changes nothing.
    let again = verify::verify_path(&report.output, &VerifyOptions::default()).unwrap();
    assert_eq!(archive, again);
}

#[test]
fn test_emitted_names_are_relative() {
    let env = TestEnv::new();
    stage_scenario_a(&env.staging);
    write_file(&env.staged("/etc/rock/deep/nested/dir/config.toml"), b"x = 1\n", 0o644);
    make_symlink("../../usr/bin/rock-manager", &env.staged("/etc/rock/deep/manager"));
    make_symlink("/etc/rock/deep/nested", &env.staged("/etc/rock/nested-link"));

    let report = build(&env, "initramfs.cpio.gz").unwrap();
    let extracted = artifact::read_archive(&report.output).unwrap();

    let shape = Regex::new(r"^[^/]+(/[^/]+)*$").unwrap();
    assert!(!extracted.entries.is_empty());
    for entry in &extracted.entries {
        assert!(shape.is_match(&entry.name), "bad entry name {:?}", entry.name);
        assert!(!entry.name.starts_with("./"), "bad entry name {:?}", entry.name);
        assert!(
            entry.name.split('/').all(|c| c != "." && c != ".."),
            "bad entry name {:?}",
            entry.name
        );
    }

    // Parents come before children.
    let pos = |name: &str| extracted.entries.iter().position(|e| e.name == name).unwrap();
    assert!(pos("etc/rock/deep/nested") < pos("etc/rock/deep/nested/dir/config.toml"));

    // Symlinks keep their raw targets.
    let link = extracted.entry("etc/rock/nested-link").unwrap();
    assert_eq!(link.kind, EntryKind::Symlink);
    assert_eq!(link.link_target.as_deref(), Some("/etc/rock/deep/nested"));
    let sh = extracted.entry("bin/sh").unwrap();
    assert_eq!(sh.link_target.as_deref(), Some("busybox"));
}

#[test]
fn test_mtimes_clamped_to_source_date_epoch() {
    let env = TestEnv::new();
    stage_scenario_a(&env.staging);
    let opts = BuildOptions {
        source_date_epoch: Some(1_000),
        ..BuildOptions::default()
    };

    let report = artifact::build_initramfs(&env.staging, &env.archive("repro.cpio.gz"), &opts).unwrap();
    let extracted = artifact::read_archive(&report.output).unwrap();
    assert!(extracted.entries.iter().all(|e| e.mtime <= 1_000));
}

#[test]
fn test_reproducible_with_source_date_epoch() {
    let env = TestEnv::new();
    stage_scenario_a(&env.staging);
    let opts = BuildOptions {
        source_date_epoch: Some(1_700_000_000),
        ..BuildOptions::default()
    };

    let a = artifact::build_initramfs(&env.staging, &env.archive("a.cpio.gz"), &opts).unwrap();
    let b = artifact::build_initramfs(&env.staging, &env.archive("b.cpio.gz"), &opts).unwrap();
    assert_eq!(a.sha256, b.sha256);
}

#[test]
fn test_pre_check_failure_writes_nothing() {
    let env = TestEnv::new();
    stage_scenario_a(&env.staging);
    fs::remove_file(env.staged(ROCK_INIT_PATH)).unwrap();
    let output = env.archive("initramfs.cpio.gz");

    let err = build(&env, "initramfs.cpio.gz").unwrap_err();
    assert!(matches!(err, BuildError::PreCheckFailed(_)));
    let findings = err.findings().unwrap();
    assert_critical(findings, ROCK_INIT_PATH);

    assert!(!output.exists());
    assert!(!sidecar_path(&output).exists());
    assert_eq!(fs::read_dir(&env.output).unwrap().count(), 0, "no temp files left behind");
}

#[test]
fn test_failure_mid_write_removes_partial_output() {
    let env = TestEnv::new();
    stage_scenario_a(&env.staging);
    // Sorts after bin/ and dev/, so the temp file already holds entries.
    symlink(OsStr::from_bytes(b"lib\xff.so"), env.staged("/usr/bin/bad-link")).unwrap();

    let err = build(&env, "initramfs.cpio.gz").unwrap_err();
    assert!(matches!(err, BuildError::Io { .. }), "unexpected error: {}", err);
    assert_eq!(fs::read_dir(&env.output).unwrap().count(), 0, "partial output left behind");
}

#[test]
fn test_failed_build_keeps_previous_archive() {
    let env = TestEnv::new();
    stage_scenario_a(&env.staging);
    let output = env.archive("initramfs.cpio.gz");
    fs::write(&output, b"previous build").unwrap();
    symlink(OsStr::from_bytes(b"lib\xff.so"), env.staged("/usr/bin/bad-link")).unwrap();

    assert!(build(&env, "initramfs.cpio.gz").is_err());
    assert_eq!(fs::read(&output).unwrap(), b"previous build");
    let left: Vec<_> = fs::read_dir(&env.output).unwrap().map(|e| e.unwrap().file_name()).collect();
    assert_eq!(left, vec![OsStr::new("initramfs.cpio.gz").to_os_string()]);
}

#[test]
fn test_missing_source_is_an_error() {
    let env = TestEnv::new();
    let err = artifact::build_initramfs(
        &env.base_dir.join("does-not-exist"),
        &env.archive("x.cpio.gz"),
        &BuildOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, BuildError::SourceMissing(_)));
}

#[test]
fn test_extract_round_trips_contract_paths() {
    let env = TestEnv::new();
    stage_scenario_a(&env.staging);
    let report = build(&env, "initramfs.cpio.gz").unwrap();
    let dest = env.base_dir.join("extracted");

    let extracted = artifact::extract_archive(&report.output, &dest).unwrap();
    assert!(extracted.is_clean());
    for b in contract().binaries {
        let path = dest.join(b.destination.trim_start_matches('/'));
        assert_eq!(fs::read(&path).unwrap(), static_elf(), "{}", b.destination);
    }
    helpers::assert_symlink(&dest.join("bin/sh"), "busybox");
}

// =============================================================================
// Verifier
// =============================================================================

#[test]
fn test_removing_any_required_path_fails_naming_it() {
    let c = contract();
    let mut required: Vec<&str> = c.binaries.iter().map(|b| b.destination).collect();
    required.push(SHELL_PATH);
    required.extend(c.directories.iter().filter(|d| d.critical).map(|d| d.path));

    for path in required {
        let env = TestEnv::new();
        stage_scenario_a(&env.staging);
        remove_path(&env.staged(path));

        let result = verify::verify_tree(&env.staging, &VerifyOptions::default()).unwrap();
        assert_critical(&result, path);
    }
}

#[test]
fn test_optional_directories_only_warn() {
    let env = TestEnv::new();
    stage_scenario_a(&env.staging);
    fs::remove_dir_all(env.staged("/etc/rock")).unwrap();

    let result = verify::verify_tree(&env.staging, &VerifyOptions::default()).unwrap();
    assert_passes(&result);
    assert!(result.warnings.iter().any(|w| w.path == "/etc/rock"));
}

#[test]
fn test_non_executable_binary_is_critical_and_wrong_mode_warns() {
    let env = TestEnv::new();
    stage_scenario_a(&env.staging);
    fs::set_permissions(env.staged("/usr/bin/rock-manager"), fs::Permissions::from_mode(0o644)).unwrap();
    fs::set_permissions(env.staged(VOLCANO_AGENT_PATH), fs::Permissions::from_mode(0o700)).unwrap();

    let result = verify::verify_tree(&env.staging, &VerifyOptions::default()).unwrap();
    assert_critical(&result, "/usr/bin/rock-manager");
    assert!(!result.has_critical_for(VOLCANO_AGENT_PATH));
    assert!(result.warnings.iter().any(|w| w.path == VOLCANO_AGENT_PATH));
}

#[test]
fn test_shell_pointing_elsewhere_warns() {
    let env = TestEnv::new();
    stage_scenario_a(&env.staging);
    fs::remove_file(env.staged(SHELL_PATH)).unwrap();
    write_file(&env.staged("/bin/bash"), &static_elf(), 0o755);
    make_symlink("bash", &env.staged(SHELL_PATH));

    let result = verify::verify_tree(&env.staging, &VerifyOptions::default()).unwrap();
    assert_passes(&result);
    assert!(result.warnings.iter().any(|w| w.path == SHELL_PATH));
}

#[test]
fn test_dangling_shell_is_critical() {
    let env = TestEnv::new();
    stage_scenario_a(&env.staging);
    fs::remove_file(env.staged(SHELL_PATH)).unwrap();
    make_symlink("/nowhere/busybox", &env.staged(SHELL_PATH));

    let result = verify::verify_tree(&env.staging, &VerifyOptions::default()).unwrap();
    assert_critical(&result, SHELL_PATH);
}

#[test]
fn test_plain_file_shell_is_critical() {
    let env = TestEnv::new();
    stage_scenario_a(&env.staging);
    fs::remove_file(env.staged(SHELL_PATH)).unwrap();
    write_file(&env.staged(SHELL_PATH), b"echo not a shell\n", 0o644);

    let result = verify::verify_tree(&env.staging, &VerifyOptions::default()).unwrap();
    assert_critical(&result, SHELL_PATH);
}

#[test]
fn test_binary_symlink_cannot_escape_the_image() {
    let env = TestEnv::new();
    stage_scenario_a(&env.staging);
    // Resolves on the host, but inside the image it points nowhere.
    let outside = env.base_dir.join("outside-agent");
    write_file(&outside, &static_elf(), 0o755);
    fs::remove_file(env.staged(VOLCANO_AGENT_PATH)).unwrap();
    make_symlink(outside.to_str().unwrap(), &env.staged(VOLCANO_AGENT_PATH));

    let result = verify::verify_tree(&env.staging, &VerifyOptions::default()).unwrap();
    assert_critical(&result, VOLCANO_AGENT_PATH);
}

#[test]
fn test_device_policy() {
    let env = TestEnv::new();
    stage_scenario_a(&env.staging);
    // The staged tree has no /dev nodes (creating them needs root).
    let lenient = verify::verify_tree(&env.staging, &VerifyOptions::default()).unwrap();
    assert_passes(&lenient);
    assert!(lenient.warnings.iter().any(|w| w.path == "/dev/null"));

    let strict = VerifyOptions {
        device_policy: DevicePolicy::Strict,
        ..VerifyOptions::default()
    };
    let result = verify::verify_tree(&env.staging, &strict).unwrap();
    assert_critical(&result, "/dev/null");
}

#[test]
fn test_unresolved_library_is_critical() {
    let env = TestEnv::new();
    stage_scenario_a(&env.staging);
    let manager = fake_elf(
        Some(&["libssl.so.3", "libc.musl-x86_64.so.1"]),
        Some("/lib/ld-musl-x86_64.so.1"),
    );
    write_file(&env.staged("/usr/bin/rock-manager"), &manager, 0o755);

    let result = verify::verify_tree(&env.staging, &VerifyOptions::default()).unwrap();
    assert_critical(&result, "/usr/bin/rock-manager");
    assert!(result.critical_errors.iter().any(|f| f.reason.contains("libssl.so.3")));

    // Provide it through an absolute symlink, which must resolve in the image.
    write_file(&env.staged("/usr/lib/libssl.so.3.0.0"), &fake_elf(Some(&[]), None), 0o755);
    make_symlink("/usr/lib/libssl.so.3.0.0", &env.staged("/lib/libssl.so.3"));
    let result = verify::verify_tree(&env.staging, &VerifyOptions::default()).unwrap();
    assert_passes(&result);
}

#[test]
fn test_glibc_binary_warns_about_portability() {
    let env = TestEnv::new();
    stage_scenario_a(&env.staging);
    let agent = fake_elf(Some(&["libc.so.6"]), Some("/lib64/ld-linux-x86-64.so.2"));
    write_file(&env.staged(VOLCANO_AGENT_PATH), &agent, 0o755);

    let result = verify::verify_tree(&env.staging, &VerifyOptions::default()).unwrap();
    assert_passes(&result);
    assert!(result
        .warnings
        .iter()
        .any(|w| w.path == VOLCANO_AGENT_PATH && w.reason.contains("glibc")));
}

#[test]
fn test_levels_run_subsets() {
    let env = TestEnv::new();
    stage_scenario_a(&env.staging);
    fs::remove_file(env.staged(VOLCANO_AGENT_PATH)).unwrap();
    let manager = fake_elf(Some(&["libmissing.so.1"]), None);
    write_file(&env.staged("/usr/bin/rock-manager"), &manager, 0o755);

    let at = |level| {
        let opts = VerifyOptions {
            level,
            ..VerifyOptions::default()
        };
        verify::verify_tree(&env.staging, &opts).unwrap()
    };

    let structure = at(VerifyLevel::Structure);
    assert!(structure.has_critical_for(VOLCANO_AGENT_PATH));
    assert!(!structure.has_critical_for("/usr/bin/rock-manager"));

    let deps = at(VerifyLevel::Dependencies);
    assert!(!deps.has_critical_for(VOLCANO_AGENT_PATH));
    assert!(deps.has_critical_for("/usr/bin/rock-manager"));

    let all = at(VerifyLevel::Integration);
    assert!(all.has_critical_for(VOLCANO_AGENT_PATH));
    assert!(all.has_critical_for("/usr/bin/rock-manager"));
}

#[test]
fn test_verify_does_not_modify_tree() {
    let env = TestEnv::new();
    stage_scenario_a(&env.staging);
    let listing = |root: &Path| {
        let mut names: Vec<PathBuf> = walkdir::WalkDir::new(root)
            .into_iter()
            .map(|e| e.unwrap().into_path())
            .collect();
        names.sort();
        names
    };
    let before = listing(&env.staging);
    verify::verify_tree(&env.staging, &VerifyOptions::default()).unwrap();
    assert_eq!(before, listing(&env.staging));
}

// =============================================================================
// Archive integrity
// =============================================================================

#[test]
fn test_tampered_checksum_is_critical() {
    let env = TestEnv::new();
    stage_scenario_a(&env.staging);
    let report = build(&env, "initramfs.cpio.gz").unwrap();

    let sidecar = sidecar_path(&report.output);
    fs::write(&sidecar, format!("{}  initramfs.cpio.gz\n", "0".repeat(64))).unwrap();

    let result = verify::verify_archive(&report.output, &VerifyOptions::default()).unwrap();
    assert_critical(&result, "(archive)");
}

#[test]
fn test_truncated_archive_is_critical() {
    let env = TestEnv::new();
    stage_scenario_a(&env.staging);
    let report = build(&env, "initramfs.cpio.gz").unwrap();
    fs::remove_file(sidecar_path(&report.output)).unwrap();

    let bytes = fs::read(&report.output).unwrap();
    let cut = env.archive("cut.cpio.gz");
    fs::write(&cut, &bytes[..bytes.len() / 2]).unwrap();

    let result = verify::verify_archive(&cut, &VerifyOptions::default()).unwrap();
    assert_critical(&result, "(archive)");
}

#[test]
fn test_unextractable_entry_is_critical_not_an_error() {
    let env = TestEnv::new();
    let mut writer = NewcWriter::new(GzEncoder::new(Vec::new(), Compression::fast()));
    writer.append_file("bin", 0o644, 0, b"not a directory").unwrap();
    writer.append_file("bin/busybox", 0o755, 0, &static_elf()).unwrap();
    let bytes = writer.finish().unwrap().finish().unwrap();
    let archive = env.archive("clash.cpio.gz");
    fs::write(&archive, bytes).unwrap();

    let result = verify::verify_archive(&archive, &VerifyOptions::default()).unwrap();
    assert_critical(&result, "bin/busybox");
}

#[test]
fn test_uncompressed_archive_is_accepted() {
    let env = TestEnv::new();
    stage_scenario_a(&env.staging);
    let report = build(&env, "initramfs.cpio.gz").unwrap();

    // Re-pack the same stream without gzip.
    let mut raw = Vec::new();
    let mut decoder = flate2::read::MultiGzDecoder::new(fs::File::open(&report.output).unwrap());
    std::io::copy(&mut decoder, &mut raw).unwrap();
    let plain = env.archive("initramfs.cpio");
    fs::File::create(&plain).unwrap().write_all(&raw).unwrap();

    let extracted = artifact::read_archive(&plain).unwrap();
    assert!(!extracted.compressed);
    let result = verify::verify_archive(&plain, &VerifyOptions::default()).unwrap();
    assert_passes(&result);
}

// =============================================================================
// Dependency resolver
// =============================================================================

#[test]
fn test_first_search_dir_wins() {
    let env = TestEnv::new();
    let first = env.base_dir.join("first");
    let second = env.base_dir.join("second");
    write_file(&first.join("libfoo.so.1"), b"short", 0o644);
    write_file(&second.join("libfoo.so.1"), b"much longer contents", 0o644);
    let binary = env.base_dir.join("app");
    write_file(&binary, &fake_elf(Some(&["libfoo.so.1"]), None), 0o755);

    let report = elf::scan(&binary, &ResolverConfig::new(vec![first.clone(), second.clone()])).unwrap();
    assert_eq!(report.dependencies[0].resolved_path, Some(first.join("libfoo.so.1")));
    assert_eq!(report.dependencies[0].size, Some(5));

    let report = elf::scan(&binary, &ResolverConfig::new(vec![second.clone(), first])).unwrap();
    assert_eq!(report.dependencies[0].resolved_path, Some(second.join("libfoo.so.1")));
    assert_eq!(report.dependencies[0].size, Some(20));
}

#[test]
fn test_static_binary_has_no_dependencies() {
    let env = TestEnv::new();
    let binary = env.base_dir.join("static-app");
    write_file(&binary, &static_elf(), 0o755);

    for dirs in [vec![], vec![env.base_dir.clone()], vec![PathBuf::from("/nonexistent")]] {
        let report = elf::scan(&binary, &ResolverConfig::new(dirs)).unwrap();
        assert!(report.is_static);
        assert!(report.dependencies.is_empty());
        assert!(report.is_satisfied());
        assert!(report.portable);
    }
}

#[test]
fn test_system_libraries_never_count_as_unresolved() {
    let env = TestEnv::new();
    let binary = env.base_dir.join("app");
    write_file(
        &binary,
        &fake_elf(Some(&["libc.so.6", "libfoo.so.1"]), Some("/lib64/ld-linux-x86-64.so.2")),
        0o755,
    );

    let report = elf::scan(&binary, &ResolverConfig::new(vec![])).unwrap();
    let missing: Vec<_> = report.unresolved().map(|d| d.library_name.as_str()).collect();
    assert_eq!(missing, vec!["libfoo.so.1"]);
    assert!(!report.is_satisfied());
    assert!(!report.portable);
}

#[test]
fn test_recursive_scan_follows_libraries() {
    let env = TestEnv::new();
    let lib = env.base_dir.join("lib");
    write_file(&lib.join("liba.so"), &fake_elf(Some(&["libb.so"]), None), 0o755);
    write_file(&lib.join("libb.so"), &fake_elf(Some(&["liba.so"]), None), 0o755);
    let binary = env.base_dir.join("app");
    write_file(&binary, &fake_elf(Some(&["liba.so"]), None), 0o755);

    let config = ResolverConfig::new(vec![lib]);
    let direct = elf::scan(&binary, &config).unwrap();
    assert_eq!(direct.dependencies.len(), 1);

    let all = elf::scan_recursive(&binary, &config).unwrap();
    let names: Vec<_> = all.dependencies.iter().map(|d| d.library_name.as_str()).collect();
    assert_eq!(names, vec!["liba.so", "libb.so"]);
    assert!(all.total_size > all.binary_size);
}

#[test]
fn test_script_is_reported_as_script() {
    let env = TestEnv::new();
    let script = env.base_dir.join("run.sh");
    write_file(&script, b"#!/bin/sh\necho hi\n", 0o755);

    let err = elf::scan(&script, &ResolverConfig::default()).unwrap_err();
    assert!(matches!(err, elf::ElfError::Script(ref i) if i == "/bin/sh"));
}
