//! Archive reader: unpack an initramfs into a scratch directory.
//!
//! Format problems do not abort the read. They are collected as
//! [`ArchiveDefect`]s so verification can report them next to the contract
//! findings, and whatever could be unpacked is still available.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::fs;
use std::io::{self, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use log::{debug, warn};
use serde::Serialize;
use tempfile::TempDir;

use super::cpio::{check_name, dev_join, pad4, EntryKind, Header, NameError, HEADER_LEN, TRAILER_NAME};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// One record as stored in the archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveEntry {
    pub name: String,
    pub kind: EntryKind,
    pub mode: u32,
    pub size: u64,
    pub link_target: Option<String>,
    pub rdev: (u32, u32),
    pub mtime: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ArchiveDefect {
    AbsoluteName(String),
    DotSlashName(String),
    EscapingName(String),
    /// Entry would be written through a symlink unpacked earlier.
    ThroughSymlink(String),
    UnknownType { name: String, mode: u32 },
    /// Entry could not be written out, e.g. a file where its parent
    /// directory should be.
    Unpackable { name: String, error: String },
    MissingTrailer,
    Truncated(String),
    Corrupt(String),
}

impl ArchiveDefect {
    /// Archive path the defect is about, or "(archive)" for stream-level problems.
    pub fn path(&self) -> &str {
        match self {
            ArchiveDefect::AbsoluteName(n)
            | ArchiveDefect::DotSlashName(n)
            | ArchiveDefect::EscapingName(n)
            | ArchiveDefect::ThroughSymlink(n)
            | ArchiveDefect::UnknownType { name: n, .. }
            | ArchiveDefect::Unpackable { name: n, .. } => n,
            _ => "(archive)",
        }
    }
}

impl std::fmt::Display for ArchiveDefect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchiveDefect::AbsoluteName(n) => {
                write!(f, "entry '{}' has a leading '/'; the kernel unpacks it unpredictably", n)
            }
            ArchiveDefect::DotSlashName(n) => write!(
                f,
                "entry '{}' has a leading './'; rock-init lookups will not find it",
                n
            ),
            ArchiveDefect::EscapingName(n) => write!(f, "entry '{}' escapes the archive root", n),
            ArchiveDefect::ThroughSymlink(n) => {
                write!(f, "entry '{}' would be written through a symlink", n)
            }
            ArchiveDefect::UnknownType { name, mode } => {
                write!(f, "entry '{}' has unknown file type (mode {:o})", name, mode)
            }
            ArchiveDefect::Unpackable { name, error } => {
                write!(f, "entry '{}' cannot be extracted: {}", name, error)
            }
            ArchiveDefect::MissingTrailer => write!(f, "archive has no {} record", TRAILER_NAME),
            ArchiveDefect::Truncated(what) => write!(f, "archive is truncated: {}", what),
            ArchiveDefect::Corrupt(what) => write!(f, "archive is corrupt: {}", what),
        }
    }
}

impl From<NameError> for ArchiveDefect {
    fn from(e: NameError) -> Self {
        match e {
            NameError::Empty => ArchiveDefect::Corrupt("entry with empty name".to_string()),
            NameError::Absolute(n) => ArchiveDefect::AbsoluteName(n),
            NameError::DotSlash(n) => ArchiveDefect::DotSlashName(n),
            NameError::Escaping(n) => ArchiveDefect::EscapingName(n),
        }
    }
}

/// A device entry the host refused to create; a plain file stands in for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DevicePlaceholder {
    pub kind: EntryKind,
    pub mode: u32,
    pub major: u32,
    pub minor: u32,
}

/// An unpacked archive.
#[derive(Debug)]
pub struct ExtractedArchive {
    root: PathBuf,
    _scratch: Option<TempDir>,
    pub compressed: bool,
    pub entries: Vec<ArchiveEntry>,
    pub defects: Vec<ArchiveDefect>,
    /// Keyed by absolute image path, e.g. `/dev/console`.
    pub device_placeholders: BTreeMap<String, DevicePlaceholder>,
}

impl ExtractedArchive {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry(&self, name: &str) -> Option<&ArchiveEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn is_clean(&self) -> bool {
        self.defects.is_empty()
    }
}

/// Unpack into a temporary directory that lives as long as the result.
pub fn read_archive(archive: &Path) -> Result<ExtractedArchive> {
    let scratch = tempfile::Builder::new()
        .prefix("rock-image-")
        .tempdir()
        .context("Failed to create scratch directory")?;
    let mut extracted = extract_into(archive, scratch.path())?;
    extracted._scratch = Some(scratch);
    Ok(extracted)
}

/// Unpack into `dest`, which is created if needed and kept afterwards.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<ExtractedArchive> {
    fs::create_dir_all(dest).with_context(|| format!("Failed to create {}", dest.display()))?;
    extract_into(archive, dest)
}

fn extract_into(archive: &Path, dest: &Path) -> Result<ExtractedArchive> {
    let raw = fs::read(archive).with_context(|| format!("Failed to read {}", archive.display()))?;
    debug!("read {} bytes from {}", raw.len(), archive.display());

    let mut defects = Vec::new();
    let compressed = raw.starts_with(&GZIP_MAGIC);
    let stream = if compressed {
        let mut out = Vec::new();
        if let Err(e) = MultiGzDecoder::new(raw.as_slice()).read_to_end(&mut out) {
            // Keep what decoded; the parser reports where it stops.
            defects.push(ArchiveDefect::Corrupt(format!("gzip: {}", e)));
        }
        out
    } else {
        raw
    };

    let mut extracted = ExtractedArchive {
        root: dest.to_path_buf(),
        _scratch: None,
        compressed,
        entries: Vec::new(),
        defects,
        device_placeholders: BTreeMap::new(),
    };
    let mut unpacker = Unpacker {
        root: dest,
        dirs: Vec::new(),
    };

    for record in parse_stream(&stream, &mut extracted.defects) {
        if let Err(e) = check_name(&record.entry.name) {
            extracted.defects.push(e.into());
            extracted.entries.push(record.entry);
            continue;
        }
        match unpacker.unpack(&record.entry, record.data) {
            Ok(Unpacked::Done) => {}
            Ok(Unpacked::Placeholder(placeholder)) => {
                extracted
                    .device_placeholders
                    .insert(format!("/{}", record.entry.name), placeholder);
            }
            Ok(Unpacked::Refused(defect)) => extracted.defects.push(defect),
            Err(e) => {
                warn!("cannot unpack '{}': {}", record.entry.name, e);
                extracted.defects.push(ArchiveDefect::Unpackable {
                    name: record.entry.name.clone(),
                    error: e.to_string(),
                });
            }
        }
        extracted.entries.push(record.entry);
    }

    unpacker.finish()?;
    Ok(extracted)
}

struct Record<'a> {
    entry: ArchiveEntry,
    data: &'a [u8],
}

/// Split a decompressed newc stream into records, stopping at the trailer
/// or at the first structural problem.
fn parse_stream<'a>(stream: &'a [u8], defects: &mut Vec<ArchiveDefect>) -> Vec<Record<'a>> {
    let mut records = Vec::new();
    let mut pos = 0usize;

    loop {
        let remaining = &stream[pos..];
        if remaining.len() < HEADER_LEN {
            if remaining.iter().all(|&b| b == 0) {
                defects.push(ArchiveDefect::MissingTrailer);
            } else {
                defects.push(ArchiveDefect::Truncated(format!("partial header at offset {}", pos)));
            }
            break;
        }

        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&remaining[..HEADER_LEN]);
        let header = match Header::parse(&raw) {
            Ok(h) => h,
            Err(e) => {
                defects.push(ArchiveDefect::Corrupt(format!("{} at offset {}", e, pos)));
                break;
            }
        };

        let namesize = header.namesize as usize;
        let name_start = pos + HEADER_LEN;
        let Some(name_bytes) = stream.get(name_start..name_start + namesize) else {
            defects.push(ArchiveDefect::Truncated(format!("entry name at offset {}", pos)));
            break;
        };
        let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
        let name = String::from_utf8_lossy(&name_bytes[..name_len]).into_owned();

        let data_start = name_start + namesize + pad4(HEADER_LEN + namesize);
        if name == TRAILER_NAME {
            return records;
        }

        let filesize = header.filesize as usize;
        let Some(data) = stream.get(data_start..data_start + filesize) else {
            defects.push(ArchiveDefect::Truncated(format!("data of '{}'", name)));
            break;
        };
        pos = data_start + filesize + pad4(filesize);
        if pos > stream.len() {
            pos = stream.len();
        }

        let Some(kind) = EntryKind::from_mode(header.mode) else {
            defects.push(ArchiveDefect::UnknownType {
                name,
                mode: header.mode,
            });
            continue;
        };
        let link_target =
            (kind == EntryKind::Symlink).then(|| String::from_utf8_lossy(data).into_owned());

        records.push(Record {
            entry: ArchiveEntry {
                name,
                kind,
                mode: header.mode & 0o7777,
                size: u64::from(header.filesize),
                link_target,
                rdev: (header.rdev_major, header.rdev_minor),
                mtime: header.mtime,
            },
            data,
        });
    }

    records
}

enum Unpacked {
    Done,
    Placeholder(DevicePlaceholder),
    Refused(ArchiveDefect),
}

struct Unpacker<'a> {
    root: &'a Path,
    /// Directory modes are applied last so read-only directories can still
    /// receive their children.
    dirs: Vec<(PathBuf, u32)>,
}

impl Unpacker<'_> {
    fn unpack(&mut self, entry: &ArchiveEntry, data: &[u8]) -> io::Result<Unpacked> {
        if self.crosses_symlink(&entry.name) {
            return Ok(Unpacked::Refused(ArchiveDefect::ThroughSymlink(entry.name.clone())));
        }

        let target = self.root.join(&entry.name);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if entry.kind != EntryKind::Directory {
            remove_existing(&target)?;
        }

        match entry.kind {
            EntryKind::Directory => {
                if !target.is_dir() {
                    remove_existing(&target)?;
                    fs::create_dir(&target)?;
                }
                fs::set_permissions(&target, fs::Permissions::from_mode(0o700 | entry.mode))?;
                self.dirs.push((target, entry.mode));
            }
            EntryKind::File => {
                fs::write(&target, data)?;
                fs::set_permissions(&target, fs::Permissions::from_mode(entry.mode))?;
            }
            EntryKind::Symlink => {
                symlink(entry.link_target.as_deref().unwrap_or_default(), &target)?;
            }
            EntryKind::CharDevice | EntryKind::BlockDevice | EntryKind::Fifo | EntryKind::Socket => {
                if entry.kind != EntryKind::Socket && mknod(&target, entry).is_ok() {
                    return Ok(Unpacked::Done);
                }
                debug!("cannot create {} on this host, writing placeholder", entry.name);
                fs::write(&target, b"")?;
                fs::set_permissions(&target, fs::Permissions::from_mode(entry.mode))?;
                return Ok(Unpacked::Placeholder(DevicePlaceholder {
                    kind: entry.kind,
                    mode: entry.mode,
                    major: entry.rdev.0,
                    minor: entry.rdev.1,
                }));
            }
        }
        Ok(Unpacked::Done)
    }

    fn crosses_symlink(&self, name: &str) -> bool {
        let mut current = self.root.to_path_buf();
        let mut parts = name.split('/').peekable();
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                break;
            }
            current.push(part);
            if fs::symlink_metadata(&current)
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false)
            {
                return true;
            }
        }
        false
    }

    fn finish(self) -> Result<()> {
        for (dir, mode) in self.dirs.iter().rev() {
            // Keep owner access so the scratch directory can be cleaned up.
            if let Err(e) = fs::set_permissions(dir, fs::Permissions::from_mode(0o700 | mode)) {
                warn!("failed to set mode on {}: {}", dir.display(), e);
            }
        }
        Ok(())
    }
}

fn remove_existing(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn mknod(path: &Path, entry: &ArchiveEntry) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mode = (entry.kind.type_bits() | entry.mode) as libc::mode_t;
    let dev = dev_join(entry.rdev.0, entry.rdev.1) as libc::dev_t;
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
    let rc = unsafe { libc::mknod(c_path.as_ptr(), mode, dev) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
