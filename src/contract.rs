//! The rock-init integration contract.
//!
//! rock-init has no runtime discovery. Every path below is a literal inside
//! the rock-init binary, so an image that disagrees with this table will not
//! boot, usually without a useful error on the console.
//!
//! # ⚠️ DO NOT EDIT THESE VALUES TO MAKE A BUILD PASS ⚠️
//!
//! If verification fails because a path is missing, fix the staged tree.
//! Changing a destination here only moves the failure to boot time.

use serde::Serialize;
use thiserror::Error;

/// Version of the contract table. Bump when rock-init changes a hard-coded path.
pub const CONTRACT_VERSION: &str = "1.0";

/// Where rock-init must live. Referenced throughout rock-init.
pub const ROCK_INIT_PATH: &str = "/sbin/init";
/// Hard-coded in rock-init's manager supervisor.
pub const ROCK_MANAGER_PATH: &str = "/usr/bin/rock-manager";
/// Hard-coded in rock-init's agent launcher and its restart path.
pub const VOLCANO_AGENT_PATH: &str = "/usr/bin/volcano-agent";
/// Read by rock-init when decrypting configuration.
pub const CONFIG_KEY_PATH: &str = "/config/CONFIG_KEY";
pub const BUSYBOX_PATH: &str = "/bin/busybox";
/// Must be a symlink to busybox. rock-init's recovery path execs it.
pub const SHELL_PATH: &str = "/bin/sh";

/// How one binary lands in the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BinaryMapping {
    /// Name of the binary as produced by its build.
    pub source: &'static str,
    /// Absolute path inside the image.
    pub destination: &'static str,
    pub permissions: u32,
}

impl BinaryMapping {
    /// True when the binary is installed under a different file name.
    pub fn is_renamed(&self) -> bool {
        self.destination.rsplit('/').next() != Some(self.source)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RequiredDirectory {
    pub path: &'static str,
    /// rock-init cannot start without a critical directory; the others it
    /// creates lazily.
    pub critical: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceNode {
    pub path: &'static str,
    pub mode: u32,
    pub major: u32,
    pub minor: u32,
}

/// Kernel command line policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KernelParams {
    /// Always the first token of the command line.
    pub mandatory_init_token: &'static str,
    /// Selects the initramfs-only init lookup, which rock-init does not support.
    /// Using it instead of `init=` panics before any console output from rock-init.
    pub forbidden_alternate_token: &'static str,
    pub required_flags: &'static [&'static str],
    pub debug_flags: &'static [&'static str],
    pub production_flags: &'static [&'static str],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IntegrationContract {
    pub version: &'static str,
    pub binaries: &'static [BinaryMapping],
    pub directories: &'static [RequiredDirectory],
    pub device_nodes: &'static [DeviceNode],
    /// Commands expected as symlinks to busybox in /bin. The shell is
    /// checked separately.
    pub busybox_commands: &'static [&'static str],
    pub kernel: KernelParams,
}

pub static REQUIRED_BINARIES: &[BinaryMapping] = &[
    BinaryMapping {
        source: "rock-init",
        destination: ROCK_INIT_PATH,
        permissions: 0o755,
    },
    BinaryMapping {
        source: "rock-manager",
        destination: ROCK_MANAGER_PATH,
        permissions: 0o755,
    },
    BinaryMapping {
        source: "volcano-agent",
        destination: VOLCANO_AGENT_PATH,
        permissions: 0o755,
    },
    BinaryMapping {
        source: "busybox",
        destination: BUSYBOX_PATH,
        permissions: 0o755,
    },
];

pub static REQUIRED_DIRECTORIES: &[RequiredDirectory] = &[
    RequiredDirectory { path: "/proc", critical: true },
    RequiredDirectory { path: "/sys", critical: true },
    RequiredDirectory { path: "/dev", critical: true },
    RequiredDirectory { path: "/sbin", critical: true },
    RequiredDirectory { path: "/bin", critical: true },
    RequiredDirectory { path: "/usr/bin", critical: true },
    RequiredDirectory { path: "/tmp", critical: false },
    RequiredDirectory { path: "/run", critical: false },
    RequiredDirectory { path: "/var/log", critical: false },
    RequiredDirectory { path: "/config", critical: false },
    RequiredDirectory { path: "/etc/rock", critical: false },
];

pub static REQUIRED_DEVICE_NODES: &[DeviceNode] = &[
    DeviceNode { path: "/dev/null", mode: 0o666, major: 1, minor: 3 },
    DeviceNode { path: "/dev/zero", mode: 0o666, major: 1, minor: 5 },
    DeviceNode { path: "/dev/random", mode: 0o666, major: 1, minor: 8 },
    DeviceNode { path: "/dev/urandom", mode: 0o666, major: 1, minor: 9 },
    DeviceNode { path: "/dev/tty", mode: 0o666, major: 5, minor: 0 },
    DeviceNode { path: "/dev/console", mode: 0o620, major: 5, minor: 1 },
    DeviceNode { path: "/dev/ptmx", mode: 0o666, major: 5, minor: 2 },
];

pub static BUSYBOX_COMMANDS: &[&str] = &[
    "ls", "cat", "echo", "mount", "umount", "mkdir", "rm", "cp", "mv", "chmod", "chown",
    "sleep", "test", "[", "[[", "ps",
];

pub static CONTRACT: IntegrationContract = IntegrationContract {
    version: CONTRACT_VERSION,
    binaries: REQUIRED_BINARIES,
    directories: REQUIRED_DIRECTORIES,
    device_nodes: REQUIRED_DEVICE_NODES,
    busybox_commands: BUSYBOX_COMMANDS,
    kernel: KernelParams {
        mandatory_init_token: "init=/sbin/init",
        forbidden_alternate_token: "rdinit=",
        required_flags: &["net.ifnames=0"],
        debug_flags: &["console=ttyS0", "debug"],
        production_flags: &["quiet", "security=selinux"],
    },
};

/// The contract rock-init was built against.
pub fn contract() -> &'static IntegrationContract {
    &CONTRACT
}

/// Boot mode, selecting the mode-specific kernel flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BootMode {
    #[default]
    Debug,
    Production,
}

impl std::fmt::Display for BootMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootMode::Debug => write!(f, "debug"),
            BootMode::Production => write!(f, "production"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CmdlineError {
    #[error("kernel command line is missing the mandatory '{0}' parameter")]
    MissingInitToken(&'static str),
    #[error("kernel command line contains '{found}', which rock-init cannot boot with; use '{expected}' instead")]
    ForbiddenToken {
        found: String,
        expected: &'static str,
    },
}

impl KernelParams {
    /// Build the command line for a mode: mandatory init token first, then
    /// required flags, mode flags and caller extras.
    ///
    /// Extras are validated like everything else, so a caller cannot sneak
    /// the forbidden token in.
    pub fn cmdline(&self, mode: BootMode, extra: &[String]) -> Result<String, CmdlineError> {
        let mode_flags = match mode {
            BootMode::Debug => self.debug_flags,
            BootMode::Production => self.production_flags,
        };

        let mut tokens: Vec<String> = vec![self.mandatory_init_token.to_string()];
        tokens.extend(self.required_flags.iter().map(|s| s.to_string()));
        tokens.extend(mode_flags.iter().map(|s| s.to_string()));
        for param in extra {
            tokens.extend(param.split_whitespace().map(str::to_string));
        }

        let line = tokens.join(" ");
        self.validate(&line)?;
        Ok(line)
    }

    /// Check an arbitrary command line against the policy.
    pub fn validate(&self, cmdline: &str) -> Result<(), CmdlineError> {
        let mut has_init = false;
        for token in cmdline.split_whitespace() {
            if token.starts_with(self.forbidden_alternate_token) {
                return Err(CmdlineError::ForbiddenToken {
                    found: token.to_string(),
                    expected: self.mandatory_init_token,
                });
            }
            if token == self.mandatory_init_token {
                has_init = true;
            }
        }

        if !has_init {
            return Err(CmdlineError::MissingInitToken(self.mandatory_init_token));
        }
        Ok(())
    }
}
