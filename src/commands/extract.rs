//! Extract command - unpacks an archive for inspection.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use crate::artifact::{self, ExtractedArchive};
use crate::contract::{contract, SHELL_PATH};

/// Execute the extract command.
pub fn cmd_extract(archive: &Path, output: Option<PathBuf>) -> Result<ExitCode> {
    let output_dir = output.unwrap_or_else(|| default_output(archive));
    println!("Extracting {} to {}...", archive.display(), output_dir.display());

    let extracted = artifact::extract_archive(archive, &output_dir)?;

    println!(
        "  {} entries ({})",
        extracted.entries.len(),
        if extracted.compressed { "gzip" } else { "uncompressed" }
    );
    if !extracted.device_placeholders.is_empty() {
        println!(
            "  {} device nodes written as placeholder files (not root)",
            extracted.device_placeholders.len()
        );
    }
    for defect in &extracted.defects {
        println!("  [WARN] {}", defect);
    }

    println!();
    println!("Contract paths:");
    print_contract_paths(&extracted);
    println!();
    println!("Extracted to: {}", output_dir.display());

    if !extracted.is_clean() {
        println!("Archive has defects. Run 'rock-image verify {}' for details.", archive.display());
    }
    Ok(if extracted.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// `initramfs.cpio.gz` extracts to `initramfs-extracted` beside it.
fn default_output(archive: &Path) -> PathBuf {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "initramfs".to_string());
    let stem = name.split('.').next().unwrap_or("initramfs");
    archive.with_file_name(format!("{}-extracted", stem))
}

fn print_contract_paths(extracted: &ExtractedArchive) {
    let mut paths: Vec<&str> = contract().binaries.iter().map(|b| b.destination).collect();
    paths.push(SHELL_PATH);

    for path in paths {
        let name = path.trim_start_matches('/');
        match extracted.entry(name) {
            Some(entry) => match &entry.link_target {
                Some(target) => println!("  ✓ {} -> {}", path, target),
                None => println!("  ✓ {} ({} bytes, mode {:o})", path, entry.size, entry.mode & 0o7777),
            },
            None => println!("  ✗ {} (missing)", path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_output() {
        assert_eq!(
            default_output(Path::new("/tmp/out/initramfs.cpio.gz")),
            PathBuf::from("/tmp/out/initramfs-extracted")
        );
    }
}
