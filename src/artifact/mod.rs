//! Archive artifacts.
//!
//! - `cpio` - newc record codec
//! - `reader` - unpack an archive for inspection
//! - `initramfs` - build and self-verify an archive from a staged tree
//! - `checksum` - `.sha256` sidecars

pub mod checksum;
pub mod cpio;
pub mod initramfs;
pub mod reader;

pub use initramfs::{build_initramfs, self_verify, BuildError, BuildOptions, BuildReport};
pub use reader::{extract_archive, read_archive, ArchiveDefect, ArchiveEntry, ExtractedArchive};
