//! Initramfs builder.
//!
//! # Build Flow
//!
//! ```text
//! 1. Verify the staged tree         (critical errors -> nothing written)
//! 2. Walk it in file-name order     (parents before children)
//! 3. Write newc + gzip to <out>.tmp
//! 4. Unpack <out>.tmp and verify it (failure -> <out>.tmp removed)
//! 5. Rename to <out>, write <out>.sha256
//! ```
//!
//! Step 4 checks the produced bytes, not the tree they came from, so an
//! archive with bad entry names can never reach `<out>`.

use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;
use walkdir::WalkDir;

use super::checksum;
use super::cpio::{dev_split, EntryKind, NewcWriter};
use crate::verify::{self, Finding, VerificationResult, VerifyOptions};

pub const DEFAULT_GZIP_LEVEL: u32 = 9;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("staged tree not found: {0}")]
    SourceMissing(PathBuf),
    #[error(
        "staged tree failed verification with {} critical error(s); no archive written",
        .0.critical_errors.len()
    )]
    PreCheckFailed(VerificationResult),
    #[error(
        "built archive failed self-verification with {} critical error(s); output removed",
        .0.critical_errors.len()
    )]
    SelfVerificationFailed(VerificationResult),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BuildError {
    /// Findings behind a verification failure, if that is what this is.
    pub fn findings(&self) -> Option<&VerificationResult> {
        match self {
            BuildError::PreCheckFailed(r) | BuildError::SelfVerificationFailed(r) => Some(r),
            _ => None,
        }
    }
}

fn io_err(context: impl Into<String>) -> impl FnOnce(io::Error) -> BuildError {
    let context = context.into();
    move |source| BuildError::Io { context, source }
}

#[derive(Debug, Clone, Copy)]
pub struct BuildOptions {
    pub gzip_level: u32,
    /// Upper bound for entry mtimes (reproducible builds).
    pub source_date_epoch: Option<u64>,
    pub verify: VerifyOptions,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            gzip_level: DEFAULT_GZIP_LEVEL,
            source_date_epoch: None,
            verify: VerifyOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub output: PathBuf,
    pub entries: usize,
    pub size: u64,
    pub sha256: String,
    /// Warnings from verifying the produced archive.
    pub warnings: Vec<Finding>,
    pub notes: Vec<Finding>,
}

/// Build `output` from the staged tree at `source`.
pub fn build_initramfs(
    source: &Path,
    output: &Path,
    opts: &BuildOptions,
) -> Result<BuildReport, BuildError> {
    if !source.is_dir() {
        return Err(BuildError::SourceMissing(source.to_path_buf()));
    }

    info!("pre-build verification of {}", source.display());
    let pre = verify::verify_tree(source, &opts.verify)?;
    if !pre.success {
        return Err(BuildError::PreCheckFailed(pre));
    }

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(io_err(format!("creating {}", parent.display())))?;
    }

    let temp = temp_path(output);
    let entries = match write_archive(source, &temp, opts) {
        Ok(n) => n,
        Err(e) => {
            remove_quietly(&temp);
            return Err(e);
        }
    };
    info!("wrote {} entries to {}", entries, temp.display());

    let post = match self_verify(&temp, &opts.verify) {
        Ok(result) => result,
        Err(e) => {
            remove_quietly(&temp);
            return Err(e);
        }
    };
    if !post.success {
        remove_quietly(&temp);
        return Err(BuildError::SelfVerificationFailed(post));
    }

    fs::rename(&temp, output).map_err(io_err(format!(
        "renaming {} to {}",
        temp.display(),
        output.display()
    )))?;
    let sha256 = checksum::write_sidecar(output)?;
    let size = fs::metadata(output)
        .map_err(io_err(format!("reading {}", output.display())))?
        .len();

    Ok(BuildReport {
        output: output.to_path_buf(),
        entries,
        size,
        sha256,
        warnings: post.warnings,
        notes: post.notes,
    })
}

/// Verify an archive as the builder does after writing it.
pub fn self_verify(archive: &Path, opts: &VerifyOptions) -> Result<VerificationResult, BuildError> {
    Ok(verify::verify_archive(archive, opts)?)
}

/// Write the gzip-compressed newc stream for `source` to `dest`.
/// Returns the number of entries, trailer excluded.
pub fn write_archive(source: &Path, dest: &Path, opts: &BuildOptions) -> Result<usize, BuildError> {
    let file = File::create(dest).map_err(io_err(format!("creating {}", dest.display())))?;
    let level = Compression::new(opts.gzip_level.clamp(1, 9));
    let mut writer = NewcWriter::new(GzEncoder::new(BufWriter::new(file), level));

    for entry in WalkDir::new(source)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1)
    {
        let entry = entry.map_err(|e| BuildError::Io {
            context: format!("walking {}", source.display()),
            source: e.into(),
        })?;
        let path = entry.path();
        let name = archive_name(source, path)?;
        let meta = fs::symlink_metadata(path).map_err(io_err(format!("reading {}", path.display())))?;
        let mtime = clamp_mtime(meta.mtime(), opts.source_date_epoch);
        let perms = meta.mode() & 0o7777;
        let ft = meta.file_type();
        let ctx = || format!("archiving {}", path.display());

        if ft.is_dir() {
            writer.append_dir(&name, perms, mtime).map_err(io_err(ctx()))?;
        } else if ft.is_symlink() {
            let target = fs::read_link(path).map_err(io_err(ctx()))?;
            let target = target.to_str().ok_or_else(|| BuildError::Io {
                context: ctx(),
                source: io::Error::new(io::ErrorKind::InvalidData, "symlink target is not UTF-8"),
            })?;
            writer.append_symlink(&name, target, mtime).map_err(io_err(ctx()))?;
        } else if ft.is_file() {
            let data = fs::read(path).map_err(io_err(ctx()))?;
            writer.append_file(&name, perms, mtime, &data).map_err(io_err(ctx()))?;
        } else {
            let kind = if ft.is_char_device() {
                EntryKind::CharDevice
            } else if ft.is_block_device() {
                EntryKind::BlockDevice
            } else if ft.is_fifo() {
                EntryKind::Fifo
            } else {
                warn!("skipping socket {}", path.display());
                continue;
            };
            let rdev = if kind.is_device() { dev_split(meta.rdev()) } else { (0, 0) };
            writer
                .append_special(&name, kind, perms, mtime, rdev)
                .map_err(io_err(ctx()))?;
        }
        debug!("+ {}", name);
    }

    let entries = writer.entries();
    let encoder = writer.finish().map_err(io_err(format!("finishing {}", dest.display())))?;
    let buffered = encoder.finish().map_err(io_err(format!("compressing {}", dest.display())))?;
    let file = buffered
        .into_inner()
        .map_err(|e| BuildError::Io {
            context: format!("flushing {}", dest.display()),
            source: e.into_error(),
        })?;
    file.sync_all().map_err(io_err(format!("syncing {}", dest.display())))?;

    Ok(entries)
}

/// Entry name for a path under the tree: components joined by `/`, with no
/// `./` or leading `/`.
fn archive_name(source: &Path, path: &Path) -> Result<String, BuildError> {
    let rel = path.strip_prefix(source).map_err(|_| BuildError::Io {
        context: format!("{} is outside {}", path.display(), source.display()),
        source: io::Error::new(io::ErrorKind::InvalidInput, "path outside tree"),
    })?;
    let parts = rel
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| BuildError::Io {
            context: format!("archiving {}", path.display()),
            source: io::Error::new(io::ErrorKind::InvalidData, "file name is not UTF-8"),
        })?;
    Ok(parts.join("/"))
}

fn clamp_mtime(mtime: i64, epoch: Option<u64>) -> u32 {
    let mtime = mtime.clamp(0, i64::from(u32::MAX)) as u64;
    let mtime = epoch.map_or(mtime, |e| mtime.min(e));
    mtime.min(u64::from(u32::MAX)) as u32
}

fn temp_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("failed to remove {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_clamp_mtime() {
        assert_eq!(clamp_mtime(1_700_000_000, None), 1_700_000_000);
        assert_eq!(clamp_mtime(1_700_000_000, Some(1_000)), 1_000);
        assert_eq!(clamp_mtime(500, Some(1_000)), 500);
        assert_eq!(clamp_mtime(-5, None), 0);
    }

    #[test]
    fn test_archive_name_is_relative() {
        let root = Path::new("/stage");
        assert_eq!(archive_name(root, Path::new("/stage/usr/bin/x")).unwrap(), "usr/bin/x");
        assert!(archive_name(root, Path::new("/elsewhere/x")).is_err());
    }

    #[test]
    fn test_missing_source() {
        let temp = TempDir::new().unwrap();
        let err = build_initramfs(
            &temp.path().join("nope"),
            &temp.path().join("out.cpio.gz"),
            &BuildOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, BuildError::SourceMissing(_)));
        assert!(!temp.path().join("out.cpio.gz").exists());
    }

    #[test]
    fn test_rejected_tree_writes_nothing() {
        let temp = TempDir::new().unwrap();
        let stage = temp.path().join("stage");
        fs::create_dir_all(&stage).unwrap();
        let out = temp.path().join("out.cpio.gz");

        let err = build_initramfs(&stage, &out, &BuildOptions::default()).unwrap_err();
        let findings = err.findings().unwrap();
        assert!(findings.has_critical_for("/sbin/init"));
        assert!(!out.exists());
        assert!(!temp_path(&out).exists());
    }
}
