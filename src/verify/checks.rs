//! The ordered check battery.
//!
//! # ⚠️ DO NOT WEAKEN THESE CHECKS ⚠️
//!
//! Every critical finding below corresponds to an image that rock-init
//! cannot start. If a check fails, fix the staged tree. Do not downgrade a
//! critical finding to a warning to get a build through.

use std::os::unix::fs::PermissionsExt;

use serde::Serialize;

use super::findings::{Finding, Findings};
use super::view::{is_busybox_target, FsView};
use crate::artifact::checksum::ChecksumStatus;
use crate::artifact::cpio::EntryKind;
use crate::contract::{IntegrationContract, BUSYBOX_PATH, SHELL_PATH};
use crate::elf::{self, ElfError, LibcFamily};

/// Which subset of checks to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyLevel {
    #[default]
    Integration,
    Structure,
    Dependencies,
}

impl VerifyLevel {
    fn includes(self, check: CheckId) -> bool {
        match self {
            VerifyLevel::Integration => true,
            VerifyLevel::Structure => check != CheckId::Dependencies,
            VerifyLevel::Dependencies => {
                matches!(check, CheckId::Dependencies | CheckId::ArchiveIntegrity)
            }
        }
    }
}

impl std::fmt::Display for VerifyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyLevel::Integration => write!(f, "integration"),
            VerifyLevel::Structure => write!(f, "structure"),
            VerifyLevel::Dependencies => write!(f, "dependencies"),
        }
    }
}

/// How a missing device node is judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePolicy {
    /// Missing nodes are warnings; devtmpfs provides them at boot.
    #[default]
    Lenient,
    /// Missing nodes are critical.
    Strict,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyOptions {
    pub level: VerifyLevel,
    pub device_policy: DevicePolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckId {
    Binaries,
    Shell,
    Directories,
    DeviceNodes,
    BusyboxLinks,
    Dependencies,
    ArchiveIntegrity,
}

pub struct Check {
    pub id: CheckId,
    pub name: &'static str,
    pub run: fn(&FsView, &IntegrationContract, &VerifyOptions, &mut Findings),
}

/// Run order. Checks never short-circuit each other.
pub static CHECKS: &[Check] = &[
    Check {
        id: CheckId::Binaries,
        name: "binaries",
        run: check_binaries,
    },
    Check {
        id: CheckId::Shell,
        name: "shell",
        run: check_shell,
    },
    Check {
        id: CheckId::Directories,
        name: "directories",
        run: check_directories,
    },
    Check {
        id: CheckId::DeviceNodes,
        name: "device-nodes",
        run: check_device_nodes,
    },
    Check {
        id: CheckId::BusyboxLinks,
        name: "busybox-links",
        run: check_busybox_links,
    },
    Check {
        id: CheckId::Dependencies,
        name: "dependencies",
        run: check_dependencies,
    },
    Check {
        id: CheckId::ArchiveIntegrity,
        name: "archive-integrity",
        run: check_archive_integrity,
    },
];

pub fn checks_for(level: VerifyLevel) -> impl Iterator<Item = &'static Check> {
    CHECKS.iter().filter(move |c| level.includes(c.id))
}

fn check_binaries(
    view: &FsView,
    contract: &IntegrationContract,
    _opts: &VerifyOptions,
    findings: &mut Findings,
) {
    for binary in contract.binaries {
        let dest = binary.destination;
        if view.lstat(dest).is_none() {
            findings.critical(
                Finding::new(dest, "required binary is missing")
                    .with_detail(format!("install '{}' here", binary.source)),
            );
            continue;
        }

        let Some(meta) = view.stat(dest) else {
            findings.critical(Finding::new(dest, "symlink does not resolve inside the image"));
            continue;
        };
        if !meta.is_file() {
            findings.critical(Finding::new(dest, "not a regular file"));
            continue;
        }

        let perms = meta.permissions().mode() & 0o7777;
        if perms & 0o111 == 0 {
            findings.critical(
                Finding::new(dest, "not executable").with_detail(format!("mode {:04o}", perms)),
            );
        } else if perms != binary.permissions {
            findings.warn(Finding::new(dest, "permission mismatch").with_detail(format!(
                "expected {:04o}, found {:04o}",
                binary.permissions, perms
            )));
        }

        if binary.is_renamed() {
            findings.note(Finding::new(
                dest,
                format!("installed from '{}' under a different name", binary.source),
            ));
        }
    }
}

fn check_shell(
    view: &FsView,
    _contract: &IntegrationContract,
    _opts: &VerifyOptions,
    findings: &mut Findings,
) {
    let Some(meta) = view.lstat(SHELL_PATH) else {
        findings.critical(
            Finding::new(SHELL_PATH, "shell is missing")
                .with_detail(format!("symlink it to {}", BUSYBOX_PATH)),
        );
        return;
    };

    if !meta.file_type().is_symlink() {
        findings.critical(
            Finding::new(SHELL_PATH, "not a symlink to busybox")
                .with_detail(format!("symlink it to {}", BUSYBOX_PATH)),
        );
        return;
    }

    // The recovery path execs the shell, so it has to resolve.
    let target = view.read_link(SHELL_PATH).unwrap_or_default();
    if view.stat(SHELL_PATH).is_none() {
        findings.critical(
            Finding::new(SHELL_PATH, "shell symlink is dangling")
                .with_detail(format!("points to '{}'", target)),
        );
    } else if !is_busybox_target(&target) {
        findings.warn(
            Finding::new(SHELL_PATH, "symlink does not point at busybox")
                .with_detail(format!("points to '{}'", target)),
        );
    }
}

fn check_directories(
    view: &FsView,
    contract: &IntegrationContract,
    _opts: &VerifyOptions,
    findings: &mut Findings,
) {
    for dir in contract.directories {
        let reason = match view.stat(dir.path) {
            Some(meta) if meta.is_dir() => continue,
            Some(_) => "exists but is not a directory",
            None => "directory is missing",
        };
        if dir.critical {
            findings.critical(Finding::new(dir.path, reason));
        } else {
            findings.warn(Finding::new(dir.path, format!("optional {}", reason)));
        }
    }
}

fn check_device_nodes(
    view: &FsView,
    contract: &IntegrationContract,
    opts: &VerifyOptions,
    findings: &mut Findings,
) {
    for node in contract.device_nodes {
        let expected = format!("c {}:{}", node.major, node.minor);
        match view.device(node.path) {
            Some(dev) if dev.kind != EntryKind::CharDevice => {
                findings.warn(Finding::new(node.path, "not a character device"));
            }
            Some(dev) if (dev.major, dev.minor) != (node.major, node.minor) => {
                findings.warn(
                    Finding::new(node.path, "wrong device numbers")
                        .with_detail(format!("expected {}, found {}:{}", expected, dev.major, dev.minor)),
                );
            }
            Some(dev) => {
                if dev.perms != node.mode {
                    findings.note(Finding::new(node.path, "device mode differs").with_detail(
                        format!("expected {:04o}, found {:04o}", node.mode, dev.perms),
                    ));
                }
            }
            None if view.lstat(node.path).is_some() => {
                findings.warn(
                    Finding::new(node.path, "not a device node").with_detail(format!("expected {}", expected)),
                );
            }
            None => {
                let finding = Finding::new(node.path, "device node is missing")
                    .with_detail(format!("expected {}", expected));
                match opts.device_policy {
                    DevicePolicy::Strict => findings.critical(finding),
                    DevicePolicy::Lenient => findings.warn(finding),
                }
            }
        }
    }
}

fn check_busybox_links(
    view: &FsView,
    contract: &IntegrationContract,
    _opts: &VerifyOptions,
    findings: &mut Findings,
) {
    for command in contract.busybox_commands.iter().filter(|c| **c != "sh") {
        let path = format!("/bin/{}", command);
        match view.read_link(&path) {
            Some(target) if is_busybox_target(&target) => {}
            Some(target) => findings.warn(
                Finding::new(&path, "symlink does not point at busybox")
                    .with_detail(format!("points to '{}'", target)),
            ),
            None if view.lstat(&path).is_some() => {
                findings.warn(Finding::new(&path, "not a busybox symlink"));
            }
            None => findings.warn(Finding::new(&path, "busybox command link is missing")),
        }
    }
}

fn check_dependencies(
    view: &FsView,
    contract: &IntegrationContract,
    _opts: &VerifyOptions,
    findings: &mut Findings,
) {
    let resolver = view.library_resolver();

    for binary in contract.binaries {
        let dest = binary.destination;
        // Absent binaries are check 1's finding, not this one's.
        let Some(host) = view.resolve(dest).filter(|p| p.is_file()) else {
            continue;
        };

        match elf::scan(&host, &resolver) {
            Ok(report) => {
                for dep in report.unresolved() {
                    findings.critical(
                        Finding::new(dest, format!("requires {}", dep.library_name))
                            .with_detail("not found in the image's library directories"),
                    );
                }
                if report.libc == LibcFamily::Glibc {
                    findings.warn(
                        Finding::new(dest, "linked against glibc")
                            .with_detail("static or musl builds are preferred for the minimal image"),
                    );
                }
            }
            Err(ElfError::Script(interp)) => {
                findings.note(Finding::new(dest, format!("script (interpreter {})", interp)));
            }
            Err(e) => {
                findings.warn(Finding::new(dest, "cannot inspect dependencies").with_detail(e.to_string()));
            }
        }
    }
}

fn check_archive_integrity(
    view: &FsView,
    _contract: &IntegrationContract,
    _opts: &VerifyOptions,
    findings: &mut Findings,
) {
    let Some(archive) = view.archive() else {
        return;
    };

    for defect in &archive.defects {
        findings.critical(Finding::new(defect.path(), defect.to_string()));
    }

    match &archive.checksum {
        Some(ChecksumStatus::Mismatch { expected, actual }) => findings.critical(
            Finding::new("(archive)", "checksum does not match its .sha256 file")
                .with_detail(format!("expected {}, found {}", expected, actual)),
        ),
        Some(ChecksumStatus::Unreadable { reason }) => {
            findings.warn(Finding::new("(archive)", "checksum file is unreadable").with_detail(reason))
        }
        Some(ChecksumStatus::Match) | None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_select_checks() {
        let names = |level| checks_for(level).map(|c| c.name).collect::<Vec<_>>();
        assert_eq!(names(VerifyLevel::Integration).len(), 7);
        assert_eq!(
            names(VerifyLevel::Structure),
            vec![
                "binaries",
                "shell",
                "directories",
                "device-nodes",
                "busybox-links",
                "archive-integrity"
            ]
        );
        assert_eq!(
            names(VerifyLevel::Dependencies),
            vec!["dependencies", "archive-integrity"]
        );
    }

    #[test]
    fn test_busybox_target() {
        assert!(is_busybox_target("busybox"));
        assert!(is_busybox_target("/bin/busybox"));
        assert!(!is_busybox_target("bash"));
        assert!(!is_busybox_target("/bin/busybox.static"));
    }
}
