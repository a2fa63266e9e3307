//! Read-only view of an image root.
//!
//! Paths are image paths (`/sbin/init`). Symlinks are followed the way the
//! booted kernel would, with absolute targets resolved under the image root
//! rather than the host's.

use std::collections::BTreeMap;
use std::fs::{self, Metadata};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use crate::artifact::checksum::ChecksumStatus;
use crate::artifact::cpio::{dev_split, EntryKind};
use crate::artifact::reader::{ArchiveDefect, DevicePlaceholder, ExtractedArchive};
use crate::elf::{self, ResolverConfig};

/// What an archive input adds on top of the unpacked tree.
#[derive(Debug, Clone, Default)]
pub struct ArchiveFacts {
    pub defects: Vec<ArchiveDefect>,
    pub checksum: Option<ChecksumStatus>,
}

/// A device node as seen in the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub kind: EntryKind,
    pub perms: u32,
    pub major: u32,
    pub minor: u32,
    /// Came from an archive entry the host could not create.
    pub placeholder: bool,
}

#[derive(Debug)]
pub struct FsView {
    root: PathBuf,
    device_placeholders: BTreeMap<String, DevicePlaceholder>,
    archive: Option<ArchiveFacts>,
}

impl FsView {
    pub fn for_tree(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            device_placeholders: BTreeMap::new(),
            archive: None,
        }
    }

    pub fn for_archive(extracted: &ExtractedArchive, checksum: Option<ChecksumStatus>) -> Self {
        Self {
            root: extracted.root().to_path_buf(),
            device_placeholders: extracted.device_placeholders.clone(),
            archive: Some(ArchiveFacts {
                defects: extracted.defects.clone(),
                checksum,
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archive(&self) -> Option<&ArchiveFacts> {
        self.archive.as_ref()
    }

    /// Host location of an image path, without following symlinks.
    pub fn host_path(&self, image_path: &str) -> PathBuf {
        self.root.join(image_path.trim_start_matches('/'))
    }

    pub fn lstat(&self, image_path: &str) -> Option<Metadata> {
        fs::symlink_metadata(self.host_path(image_path)).ok()
    }

    /// Host location after following symlinks inside the image.
    pub fn resolve(&self, image_path: &str) -> Option<PathBuf> {
        elf::real_path(&self.host_path(image_path), Some(&self.root))
    }

    pub fn stat(&self, image_path: &str) -> Option<Metadata> {
        self.resolve(image_path).and_then(|p| fs::symlink_metadata(p).ok())
    }

    pub fn read_link(&self, image_path: &str) -> Option<String> {
        fs::read_link(self.host_path(image_path))
            .ok()
            .map(|t| t.to_string_lossy().into_owned())
    }

    pub fn device(&self, image_path: &str) -> Option<DeviceInfo> {
        if let Some(p) = self.device_placeholders.get(image_path) {
            return Some(DeviceInfo {
                kind: p.kind,
                perms: p.mode,
                major: p.major,
                minor: p.minor,
                placeholder: true,
            });
        }

        let meta = self.lstat(image_path)?;
        let ft = meta.file_type();
        let kind = if ft.is_char_device() {
            EntryKind::CharDevice
        } else if ft.is_block_device() {
            EntryKind::BlockDevice
        } else {
            return None;
        };
        let (major, minor) = dev_split(meta.rdev());
        Some(DeviceInfo {
            kind,
            perms: meta.mode() & 0o7777,
            major,
            minor,
            placeholder: false,
        })
    }

    pub fn library_resolver(&self) -> ResolverConfig {
        ResolverConfig::in_image(&self.root)
    }
}

/// True for `busybox` or any path ending in `/busybox`.
pub fn is_busybox_target(target: &str) -> bool {
    target == "busybox" || target.ends_with("/busybox")
}
