//! SHA-256 sidecar files (`<archive>.sha256`, `sha256sum` format).

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChecksumStatus {
    Match,
    Mismatch { expected: String, actual: String },
    /// Sidecar present but not in `<hex>  <name>` form.
    Unreadable { reason: String },
}

pub fn sidecar_path(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_os_string();
    name.push(".sha256");
    PathBuf::from(name)
}

pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Hash `archive` and write its sidecar next to it. Returns the digest.
pub fn write_sidecar(archive: &Path) -> Result<String> {
    let digest = sha256_file(archive)
        .with_context(|| format!("Failed to hash {}", archive.display()))?;
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let sidecar = sidecar_path(archive);
    fs::write(&sidecar, format!("{}  {}\n", digest, name))
        .with_context(|| format!("Failed to write {}", sidecar.display()))?;
    Ok(digest)
}

/// Compare `archive` against its sidecar. `Ok(None)` when there is no sidecar.
pub fn check_sidecar(archive: &Path) -> Result<Option<ChecksumStatus>> {
    let sidecar = sidecar_path(archive);
    let content = match fs::read_to_string(&sidecar) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Ok(Some(ChecksumStatus::Unreadable {
                reason: e.to_string(),
            }))
        }
    };

    let expected = content.split_whitespace().next().unwrap_or_default();
    if expected.len() != 64 || !expected.chars().all(|c| c.is_ascii_hexdigit()) {
        return Ok(Some(ChecksumStatus::Unreadable {
            reason: format!("{} does not start with a SHA-256 digest", sidecar.display()),
        }));
    }

    let actual = sha256_file(archive)
        .with_context(|| format!("Failed to hash {}", archive.display()))?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(Some(ChecksumStatus::Match))
    } else {
        Ok(Some(ChecksumStatus::Mismatch {
            expected: expected.to_lowercase(),
            actual,
        }))
    }
}
