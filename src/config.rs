//! Configuration for rock-image.
//!
//! Read once at the CLI boundary from the environment (after `.env` has been
//! loaded by `dotenvy` in main). Library code never reads the environment;
//! it receives values from here.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use log::warn;

use crate::artifact::initramfs::DEFAULT_GZIP_LEVEL;
use crate::qemu::{DEFAULT_EMULATOR, DEFAULT_MEMORY_MB, DEFAULT_TIMEOUT_SECS};

/// Host library directories, searched after any sysroot copies of them.
pub const DEFAULT_LIBRARY_DIRS: &[&str] = &[
    "/lib",
    "/lib64",
    "/usr/lib",
    "/usr/lib64",
    "/usr/local/lib",
    "/usr/local/lib64",
];

/// Kernel file names tried in the working directory.
const LOCAL_KERNELS: &[&str] = &["vmlinuz", "vmlinuz-lts"];

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Sysroot whose library dirs are searched before the host's (ROCK_SYSROOT).
    pub sysroot: Option<PathBuf>,
    /// Searched before everything else (LD_LIBRARY_PATH).
    pub ld_library_path: Vec<PathBuf>,
    /// Machine-readable output (ROCK_OUTPUT=json).
    pub json: bool,
    /// Emulator program (ROCK_QEMU).
    pub emulator: String,
    pub boot_timeout: Duration,
    pub boot_memory_mb: u32,
    /// Explicit kernel image (ROCK_KERNEL).
    pub kernel: Option<PathBuf>,
    /// Kernel cache directory (ROCK_KERNEL_CACHE, default ~/.rock/kernels).
    pub kernel_cache: Option<PathBuf>,
    pub gzip_level: u32,
    pub source_date_epoch: Option<u64>,
    /// Missing device nodes are critical (ROCK_STRICT_DEVICES=1).
    pub strict_devices: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_vars(&HashMap::new())
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn load() -> Self {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    /// Build configuration from an explicit variable map.
    pub fn from_vars(vars: &HashMap<String, String>) -> Self {
        let get = |key: &str| vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        let sysroot = get("ROCK_SYSROOT").map(PathBuf::from);
        let ld_library_path: Vec<PathBuf> = get("LD_LIBRARY_PATH")
            .map(|v| v.split(':').filter(|p| !p.is_empty()).map(PathBuf::from).collect())
            .unwrap_or_default();

        let json = get("ROCK_OUTPUT").is_some_and(|v| v.eq_ignore_ascii_case("json"));
        let emulator = get("ROCK_QEMU").unwrap_or(DEFAULT_EMULATOR).to_string();
        let boot_timeout = Duration::from_secs(parse_or(get("ROCK_BOOT_TIMEOUT"), "ROCK_BOOT_TIMEOUT", DEFAULT_TIMEOUT_SECS));
        let boot_memory_mb = parse_or(get("ROCK_BOOT_MEMORY"), "ROCK_BOOT_MEMORY", DEFAULT_MEMORY_MB);

        let kernel = get("ROCK_KERNEL").map(PathBuf::from);
        let kernel_cache = get("ROCK_KERNEL_CACHE")
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".rock").join("kernels")));

        let mut gzip_level = parse_or(get("ROCK_GZIP_LEVEL"), "ROCK_GZIP_LEVEL", DEFAULT_GZIP_LEVEL);
        if !(1..=9).contains(&gzip_level) {
            warn!("ROCK_GZIP_LEVEL={} out of range 1-9, using {}", gzip_level, DEFAULT_GZIP_LEVEL);
            gzip_level = DEFAULT_GZIP_LEVEL;
        }
        let source_date_epoch: Option<u64> = get("SOURCE_DATE_EPOCH").and_then(|v| match v.parse() {
            Ok(n) => Some(n),
            Err(_) => {
                warn!("ignoring SOURCE_DATE_EPOCH={:?}: not a number", v);
                None
            }
        });
        let strict_devices = get("ROCK_STRICT_DEVICES")
            .is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"));

        Self {
            sysroot,
            ld_library_path,
            json,
            emulator,
            boot_timeout,
            boot_memory_mb,
            kernel,
            kernel_cache,
            gzip_level,
            source_date_epoch,
            strict_devices,
        }
    }

    /// Host library search order: LD_LIBRARY_PATH, sysroot copies of the
    /// default dirs, then the default dirs.
    pub fn library_search_paths(&self) -> Vec<PathBuf> {
        let mut paths = self.ld_library_path.clone();
        if let Some(sysroot) = &self.sysroot {
            paths.extend(
                DEFAULT_LIBRARY_DIRS
                    .iter()
                    .map(|d| sysroot.join(d.trim_start_matches('/'))),
            );
        }
        paths.extend(DEFAULT_LIBRARY_DIRS.iter().map(PathBuf::from));
        paths
    }

    /// Kernel candidates in lookup order.
    pub fn kernel_candidates(&self) -> Vec<PathBuf> {
        if let Some(kernel) = &self.kernel {
            return vec![kernel.clone()];
        }
        let mut candidates: Vec<PathBuf> = LOCAL_KERNELS.iter().map(PathBuf::from).collect();
        if let Some(cache) = &self.kernel_cache {
            candidates.push(cache.join("vmlinuz"));
        }
        if let Some(home) = dirs::home_dir() {
            let default = home.join(".rock/kernels/vmlinuz");
            if !candidates.contains(&default) {
                candidates.push(default);
            }
        }
        candidates
    }

    /// First kernel candidate that exists.
    pub fn find_kernel(&self) -> Option<PathBuf> {
        self.kernel_candidates().into_iter().find(|p| p.is_file())
    }

    /// Print configuration for debugging.
    pub fn print(&self) {
        let show = |p: &Option<PathBuf>| {
            p.as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(not set)".to_string())
        };

        println!("Configuration:");
        println!("  ROCK_SYSROOT: {}", show(&self.sysroot));
        println!("  LD_LIBRARY_PATH: {}", join_paths(&self.ld_library_path));
        println!("  ROCK_OUTPUT: {}", if self.json { "json" } else { "text" });
        println!("  ROCK_QEMU: {}", self.emulator);
        println!("  ROCK_BOOT_TIMEOUT: {}s", self.boot_timeout.as_secs());
        println!("  ROCK_BOOT_MEMORY: {}M", self.boot_memory_mb);
        println!("  ROCK_KERNEL: {}", show(&self.kernel));
        println!("  ROCK_KERNEL_CACHE: {}", show(&self.kernel_cache));
        println!("  ROCK_GZIP_LEVEL: {}", self.gzip_level);
        println!(
            "  SOURCE_DATE_EPOCH: {}",
            self.source_date_epoch
                .map(|e| e.to_string())
                .unwrap_or_else(|| "(not set)".to_string())
        );
        println!("  ROCK_STRICT_DEVICES: {}", self.strict_devices);
        match self.find_kernel() {
            Some(k) => println!("  Kernel: FOUND ({})", k.display()),
            None => println!("  Kernel: NOT FOUND (set ROCK_KERNEL or pass --kernel)"),
        }
        println!("  Library search path:");
        for dir in self.library_search_paths() {
            println!("    {}", dir.display());
        }
    }
}

fn parse_or<T: std::str::FromStr + std::fmt::Display + Copy>(value: Option<&str>, key: &str, default: T) -> T {
    match value {
        None => default,
        Some(v) => v.parse().unwrap_or_else(|_| {
            warn!("ignoring {}={:?}: using {}", key, v, default);
            default
        }),
    }
}

fn join_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "(not set)".to_string();
    }
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":")
}
