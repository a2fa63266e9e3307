//! Shared-library resolution for one binary.
//!
//! Search directories are an explicit value. Nothing here reads the
//! environment; `Config::library_search_paths` builds the host list and
//! [`ResolverConfig::in_image`] builds the list for a staged tree.

use std::collections::{HashSet, VecDeque};
use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};

use log::debug;
use serde::Serialize;

use super::parse::{read_elf, ElfError, ElfInfo};

/// Library directories searched inside an image, relative to its root.
pub const IMAGE_LIBRARY_DIRS: &[&str] = &[
    "lib",
    "lib64",
    "usr/lib",
    "usr/lib64",
    "lib/x86_64-linux-musl",
];

/// Symlink hops followed before giving up on a loop.
const MAX_LINK_DEPTH: usize = 40;

#[derive(Debug, Clone, Default)]
pub struct ResolverConfig {
    /// Searched in order; the first directory holding the name wins.
    pub search_dirs: Vec<PathBuf>,
    /// Absolute symlink targets are re-rooted here instead of the host `/`.
    pub sysroot: Option<PathBuf>,
}

impl ResolverConfig {
    pub fn new(search_dirs: Vec<PathBuf>) -> Self {
        Self {
            search_dirs,
            sysroot: None,
        }
    }

    pub fn with_sysroot(mut self, sysroot: impl Into<PathBuf>) -> Self {
        self.sysroot = Some(sysroot.into());
        self
    }

    /// Resolve against the image's own library directories.
    pub fn in_image(root: &Path) -> Self {
        Self {
            search_dirs: IMAGE_LIBRARY_DIRS.iter().map(|d| root.join(d)).collect(),
            sysroot: Some(root.to_path_buf()),
        }
    }
}

/// One declared need of one binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyRecord {
    pub library_name: String,
    pub resolved_path: Option<PathBuf>,
    /// Set only when `resolved_path` is a symlink.
    pub real_path: Option<PathBuf>,
    pub size: Option<u64>,
    pub found: bool,
    pub system_provided: bool,
}

impl DependencyRecord {
    /// Neither present in the search path nor supplied by the loader/libc.
    pub fn is_unresolved(&self) -> bool {
        !self.found && !self.system_provided
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LibcFamily {
    Static,
    Musl,
    Glibc,
    Unknown,
}

impl LibcFamily {
    /// Static and musl binaries run on the minimal image without a glibc runtime.
    pub fn is_portable(self) -> bool {
        matches!(self, LibcFamily::Static | LibcFamily::Musl)
    }
}

impl std::fmt::Display for LibcFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LibcFamily::Static => "static",
            LibcFamily::Musl => "musl",
            LibcFamily::Glibc => "glibc",
            LibcFamily::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub binary: PathBuf,
    pub architecture: String,
    pub is_static: bool,
    pub interpreter: Option<String>,
    pub libc: LibcFamily,
    pub portable: bool,
    pub dependencies: Vec<DependencyRecord>,
    pub binary_size: u64,
    /// Binary plus every resolved dependency.
    pub total_size: u64,
}

impl ScanReport {
    pub fn unresolved(&self) -> impl Iterator<Item = &DependencyRecord> {
        self.dependencies.iter().filter(|d| d.is_unresolved())
    }

    pub fn is_satisfied(&self) -> bool {
        self.unresolved().next().is_none()
    }
}

/// Loader and libc components the runtime supplies on its own.
pub fn is_system_library(name: &str) -> bool {
    name.starts_with("libc.") || name.starts_with("ld-") || name.starts_with("linux-vdso")
}

/// Classify the C library a binary links against.
pub fn libc_family(info: &ElfInfo) -> LibcFamily {
    if info.is_static() {
        return LibcFamily::Static;
    }
    let interp = info.interpreter.as_deref().unwrap_or_default();
    if interp.contains("ld-musl") || info.needed.iter().any(|n| n.contains("musl")) {
        return LibcFamily::Musl;
    }
    if interp.contains("ld-linux") || info.needed.iter().any(|n| n == "libc.so.6") {
        return LibcFamily::Glibc;
    }
    LibcFamily::Unknown
}

/// Direct dependencies of one binary.
pub fn scan(binary: &Path, config: &ResolverConfig) -> Result<ScanReport, ElfError> {
    let info = read_elf(binary)?;
    let dependencies = if info.is_static() {
        Vec::new()
    } else {
        info.needed
            .iter()
            .map(|name| resolve_dependency(name, config))
            .collect()
    };
    Ok(build_report(binary, &info, dependencies))
}

/// Like [`scan`], but follows resolved libraries to their own needs.
///
/// Each library appears once, in breadth-first order of discovery.
pub fn scan_recursive(binary: &Path, config: &ResolverConfig) -> Result<ScanReport, ElfError> {
    let info = read_elf(binary)?;
    let mut dependencies = Vec::new();

    if !info.is_static() {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<String> = info.needed.iter().cloned().collect();

        while let Some(name) = queue.pop_front() {
            if !seen.insert(name.clone()) {
                continue;
            }
            let record = resolve_dependency(&name, config);
            if let Some(path) = record.real_path.as_ref().or(record.resolved_path.as_ref()) {
                match read_elf(path) {
                    Ok(lib) => queue.extend(lib.needed.into_iter().filter(|n| !seen.contains(n))),
                    Err(e) => debug!("not following {}: {}", path.display(), e),
                }
            }
            dependencies.push(record);
        }
    }

    Ok(build_report(binary, &info, dependencies))
}

fn build_report(binary: &Path, info: &ElfInfo, dependencies: Vec<DependencyRecord>) -> ScanReport {
    let binary_size = fs::metadata(binary).map(|m| m.len()).unwrap_or(0);
    let total_size = binary_size + dependencies.iter().filter_map(|d| d.size).sum::<u64>();
    let libc = libc_family(info);

    ScanReport {
        binary: binary.to_path_buf(),
        architecture: info.architecture(),
        is_static: info.is_static(),
        interpreter: info.interpreter.clone(),
        libc,
        portable: libc.is_portable(),
        dependencies,
        binary_size,
        total_size,
    }
}

/// Look one library name up in the configured directories.
pub fn resolve_dependency(name: &str, config: &ResolverConfig) -> DependencyRecord {
    let mut record = DependencyRecord {
        library_name: name.to_string(),
        resolved_path: None,
        real_path: None,
        size: None,
        found: false,
        system_provided: is_system_library(name),
    };

    for dir in &config.search_dirs {
        let candidate = dir.join(name);
        let Some(target) = locate(&candidate, config.sysroot.as_deref()) else {
            continue;
        };

        record.size = fs::metadata(&target).ok().map(|m| m.len());
        if target != candidate {
            record.real_path = Some(target);
        }
        record.resolved_path = Some(candidate);
        record.found = true;
        break;
    }

    record
}

/// The file a search candidate names, or `None` if absent or dangling.
fn locate(candidate: &Path, sysroot: Option<&Path>) -> Option<PathBuf> {
    if sysroot.is_some() {
        return real_path(candidate, sysroot);
    }
    let meta = fs::symlink_metadata(candidate).ok()?;
    if meta.file_type().is_symlink() {
        let real = fs::canonicalize(candidate).ok();
        if real.is_none() {
            debug!("{} is a dangling symlink, skipping", candidate.display());
        }
        real
    } else {
        Some(candidate.to_path_buf())
    }
}

/// Follow a symlink chain to the file it names.
///
/// With a sysroot every component is resolved under it, so a staged
/// image's `/lib/...` links never reach into the host and `..` stops at
/// the image root.
pub fn real_path(path: &Path, sysroot: Option<&Path>) -> Option<PathBuf> {
    let Some(root) = sysroot else {
        return fs::canonicalize(path).ok();
    };

    let Ok(rel) = path.strip_prefix(root) else {
        return fs::canonicalize(path).ok();
    };
    let mut pending: VecDeque<OsString> = parts(rel).collect();
    let mut current = root.to_path_buf();
    let mut hops = 0;

    while let Some(part) = pending.pop_front() {
        if part == ".." {
            if current != root {
                current.pop();
            }
            continue;
        }
        let next = current.join(&part);
        let meta = fs::symlink_metadata(&next).ok()?;
        if !meta.file_type().is_symlink() {
            current = next;
            continue;
        }

        hops += 1;
        if hops > MAX_LINK_DEPTH {
            return None;
        }
        let target = fs::read_link(&next).ok()?;
        if target.is_absolute() {
            current = root.to_path_buf();
        }
        for p in parts(&target).collect::<Vec<_>>().into_iter().rev() {
            pending.push_front(p);
        }
    }

    Some(current)
}

fn parts(path: &Path) -> impl Iterator<Item = OsString> + '_ {
    path.components().filter_map(|c| match c {
        Component::Normal(p) => Some(p.to_os_string()),
        Component::ParentDir => Some(OsString::from("..")),
        _ => None,
    })
}
