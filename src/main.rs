//! rock-image - ROCK-OS initramfs builder and verifier.
//!
//! Builds the initramfs that rock-init boots from, and refuses to ship one
//! that violates the integration contract:
//! - Staged tree is verified before packing
//! - Built archive is re-read and verified before it replaces the output
//! - Boot trials classify real QEMU console output

use clap::{Parser, Subcommand, ValueEnum};
use env_logger::Env;
use std::path::PathBuf;
use std::process::ExitCode;

use rock_image::commands::{self, show::ShowTarget as ShowWhat, BootArgs};
use rock_image::config::Config;
use rock_image::contract::BootMode;
use rock_image::verify::VerifyLevel;

#[derive(Parser)]
#[command(name = "rock-image")]
#[command(about = "ROCK-OS initramfs builder and integration verifier")]
#[command(
    after_help = "QUICK START:\n  rock-image preflight              Check this host\n  rock-image build staging/          Pack and verify an initramfs\n  rock-image verify initramfs.cpio.gz\n  rock-image boot initramfs.cpio.gz  Boot it in QEMU"
)]
struct Cli {
    /// Print machine-readable JSON (same as ROCK_OUTPUT=json)
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack a staged root tree into a verified initramfs
    Build {
        /// Staged root tree
        tree: PathBuf,
        /// Output archive (default: initramfs.cpio.gz)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// gzip level 1-9 (default: ROCK_GZIP_LEVEL or 9)
        #[arg(long)]
        gzip_level: Option<u32>,
        /// Treat missing device nodes as critical
        #[arg(long)]
        strict_devices: bool,
    },

    /// Verify a staged tree or built archive (exit 1: will not boot)
    Verify {
        /// Directory or archive
        path: PathBuf,
        /// Which checks to run
        #[arg(long, value_enum, default_value_t = LevelArg::Integration)]
        level: LevelArg,
        /// Treat missing device nodes as critical
        #[arg(long)]
        strict_devices: bool,
    },

    /// Report a binary's shared library dependencies
    Scan {
        /// ELF binary
        binary: PathBuf,
        /// Library directory, searched in order (repeatable; replaces the defaults)
        #[arg(long = "search-path")]
        search_paths: Vec<PathBuf>,
        /// Resolve library symlinks under this root
        #[arg(long)]
        sysroot: Option<PathBuf>,
        /// Follow dependencies of dependencies
        #[arg(long)]
        recursive: bool,
    },

    /// Boot an archive in QEMU and classify the console output
    Boot {
        /// Built archive
        archive: PathBuf,
        /// Kernel image (default: ROCK_KERNEL or the kernel cache)
        #[arg(long)]
        kernel: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = ModeArg::Debug)]
        mode: ModeArg,
        /// Deadline in seconds (default: ROCK_BOOT_TIMEOUT or 10)
        #[arg(long)]
        timeout: Option<u64>,
        /// Guest memory in MiB (default: ROCK_BOOT_MEMORY or 256)
        #[arg(long)]
        memory: Option<u32>,
        /// Extra kernel parameter (repeatable)
        #[arg(long)]
        append: Vec<String>,
    },

    /// Extract an archive for inspection
    Extract {
        archive: PathBuf,
        /// Output directory (default: <archive>-extracted beside it)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show information
    Show {
        #[command(subcommand)]
        what: ShowTarget,
    },

    /// Check what this host can do (emulator, KVM, device nodes, kernel)
    Preflight {
        /// Fail if any checks fail (exit code 1)
        #[arg(long)]
        strict: bool,
    },
}

#[derive(Subcommand)]
enum ShowTarget {
    /// Show the rock-init integration contract
    Contract,
    /// Show current configuration
    Config,
    /// Show the kernel command line
    Cmdline {
        /// Only this mode (default: all)
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LevelArg {
    Integration,
    Structure,
    Dependencies,
}

impl From<LevelArg> for VerifyLevel {
    fn from(level: LevelArg) -> Self {
        match level {
            LevelArg::Integration => VerifyLevel::Integration,
            LevelArg::Structure => VerifyLevel::Structure,
            LevelArg::Dependencies => VerifyLevel::Dependencies,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Debug,
    Production,
}

impl From<ModeArg> for BootMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Debug => BootMode::Debug,
            ModeArg::Production => BootMode::Production,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Load .env if present
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();

    let mut config = Config::load();
    if cli.json {
        config.json = true;
    }

    let result = match cli.command {
        Commands::Build {
            tree,
            output,
            gzip_level,
            strict_devices,
        } => commands::cmd_build(&tree, output, gzip_level, strict_devices, &config),

        Commands::Verify {
            path,
            level,
            strict_devices,
        } => commands::cmd_verify(&path, level.into(), strict_devices, &config),

        Commands::Scan {
            binary,
            search_paths,
            sysroot,
            recursive,
        } => commands::cmd_scan(&binary, search_paths, sysroot, recursive, &config),

        Commands::Boot {
            archive,
            kernel,
            mode,
            timeout,
            memory,
            append,
        } => commands::cmd_boot(
            BootArgs {
                archive,
                kernel,
                mode: mode.into(),
                timeout,
                memory,
                append,
            },
            &config,
        ),

        Commands::Extract { archive, output } => commands::cmd_extract(&archive, output),

        Commands::Show { what } => {
            let show_target = match what {
                ShowTarget::Contract => ShowWhat::Contract,
                ShowTarget::Config => ShowWhat::Config,
                ShowTarget::Cmdline { mode } => ShowWhat::Cmdline {
                    mode: mode.map(Into::into),
                },
            };
            commands::cmd_show(show_target, &config).map(|()| ExitCode::SUCCESS)
        }

        Commands::Preflight { strict } => commands::cmd_preflight(strict, &config),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
