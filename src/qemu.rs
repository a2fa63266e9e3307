//! Boot trials: one emulator run against a built archive, classified from
//! the serial console.
//!
//! ```text
//! stdout reader ─┐
//!                ├─> bounded channel ─> controller (next chunk | deadline)
//! stderr reader ─┘
//! ```
//!
//! The controller owns the transcript. Only the guest console (stdout) is
//! classified; emulator stderr is kept in the transcript. On a failure
//! marker, on the deadline, or after the success grace window it closes
//! the channel, stops the readers, and SIGKILLs and reaps the child.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use log::{debug, info};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

use crate::contract::{contract, BootMode, CmdlineError};

pub const DEFAULT_EMULATOR: &str = "qemu-system-x86_64";
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MEMORY_MB: u32 = 256;

/// How long to keep watching after a success marker, so a panic right
/// after init starts still fails the trial.
pub const SUCCESS_GRACE: Duration = Duration::from_secs(2);

const CHANNEL_CAPACITY: usize = 64;
const READ_CHUNK: usize = 4096;
/// Longest unterminated console line kept for matching.
const MAX_LINE: usize = 4096;

/// Serial console flags added when the caller's line lacks them.
const SERIAL_FLAGS: &[(&str, &str)] = &[("console=ttyS0", "console=ttyS0"), ("panic=", "panic=1")];

/// Boot failed: panic, or the kernel could not run /sbin/init.
pub const FAILURE_MARKERS: &[&str] = &[
    "Kernel panic",
    "not syncing",
    "Failed to execute /sbin/init",
    "No working init found",
    "Requested init /sbin/init failed",
    "VFS: Cannot open root device",
];
/// Reported when one console line has both "/sbin/init" and "not found".
pub const INIT_NOT_FOUND_MARKER: &str = "/sbin/init ... not found";

/// Logged by rock-init or a process it starts.
pub const SUCCESS_MARKERS: &[&str] = &["rock-init", "ROCK-OS", "rock-manager", "volcano-agent"];

/// The kernel handed control to /sbin/init. `init=/sbin/init` is left out
/// on purpose: the kernel echoes its command line, which always has it.
pub const PARTIAL_MARKERS: &[&str] = &["Run /sbin/init"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BootOutcome {
    Success,
    PartialSuccess,
    Failed,
    Inconclusive,
}

impl std::fmt::Display for BootOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootOutcome::Success => write!(f, "SUCCESS"),
            BootOutcome::PartialSuccess => write!(f, "PARTIAL SUCCESS"),
            BootOutcome::Failed => write!(f, "FAILED"),
            BootOutcome::Inconclusive => write!(f, "INCONCLUSIVE"),
        }
    }
}

#[derive(Debug, Error)]
pub enum BootError {
    #[error("host cannot run boot trials: {0}")]
    HostNotCapable(String),
    #[error("{what} not found: {}", path.display())]
    MissingInput { what: &'static str, path: PathBuf },
    #[error(transparent)]
    Cmdline(#[from] CmdlineError),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct BootConfig {
    /// Program name (looked up on PATH) or path.
    pub emulator: String,
    pub kernel: PathBuf,
    pub archive: PathBuf,
    pub mode: BootMode,
    pub timeout: Duration,
    pub memory_mb: u32,
    /// Appended to the kernel command line, validated with it.
    pub extra_params: Vec<String>,
    /// `None` uses KVM when `/dev/kvm` exists.
    pub kvm: Option<bool>,
    pub grace: Duration,
}

impl BootConfig {
    pub fn new(kernel: impl Into<PathBuf>, archive: impl Into<PathBuf>) -> Self {
        Self {
            emulator: DEFAULT_EMULATOR.to_string(),
            kernel: kernel.into(),
            archive: archive.into(),
            mode: BootMode::default(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            memory_mb: DEFAULT_MEMORY_MB,
            extra_params: Vec::new(),
            kvm: None,
            grace: SUCCESS_GRACE,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BootTrial {
    pub outcome: BootOutcome,
    /// Marker that decided the outcome.
    pub marker: Option<String>,
    pub cmdline: String,
    pub elapsed_ms: u64,
    /// The trial killed the child rather than seeing it exit.
    pub killed: bool,
    pub transcript: String,
}

/// Highest-priority marker present in a console transcript.
pub fn classify(transcript: &str) -> Option<(BootOutcome, &'static str)> {
    let mut scanner = ConsoleScanner::default();
    scanner.feed(transcript.as_bytes())
}

fn classify_line(line: &str) -> Option<(BootOutcome, &'static str)> {
    if let Some(m) = FAILURE_MARKERS.iter().copied().find(|m| line.contains(m)) {
        return Some((BootOutcome::Failed, m));
    }
    if line.contains("/sbin/init") && line.contains("not found") {
        return Some((BootOutcome::Failed, INIT_NOT_FOUND_MARKER));
    }
    if let Some(m) = SUCCESS_MARKERS.iter().copied().find(|m| line.contains(m)) {
        return Some((BootOutcome::Success, m));
    }
    if let Some(m) = PARTIAL_MARKERS.iter().copied().find(|m| line.contains(m)) {
        return Some((BootOutcome::PartialSuccess, m));
    }
    None
}

fn rank(outcome: BootOutcome) -> u8 {
    match outcome {
        BootOutcome::Inconclusive => 0,
        BootOutcome::PartialSuccess => 1,
        BootOutcome::Success => 2,
        BootOutcome::Failed => 3,
    }
}

/// Incremental classifier for console output.
///
/// Each line is matched once when it completes. The unterminated tail is
/// matched on every feed and capped at `MAX_LINE` bytes, so a chatty
/// console costs time linear in its output. The verdict only ever moves
/// up in priority.
#[derive(Debug, Default)]
pub struct ConsoleScanner {
    line: Vec<u8>,
    verdict: Option<(BootOutcome, &'static str)>,
}

impl ConsoleScanner {
    /// Feed console bytes and return the verdict so far.
    pub fn feed(&mut self, chunk: &[u8]) -> Option<(BootOutcome, &'static str)> {
        for piece in chunk.split_inclusive(|&b| b == b'\n') {
            self.line.extend_from_slice(piece);
            if piece.ends_with(b"\n") {
                self.scan_line();
                self.line.clear();
            }
        }
        if !self.line.is_empty() {
            self.scan_line();
            if self.line.len() > MAX_LINE {
                let excess = self.line.len() - MAX_LINE;
                self.line.drain(..excess);
            }
        }
        self.verdict
    }

    pub fn verdict(&self) -> Option<(BootOutcome, &'static str)> {
        self.verdict
    }

    fn scan_line(&mut self) {
        let line = String::from_utf8_lossy(&self.line);
        if let Some(found) = classify_line(&line) {
            if self.verdict.map_or(true, |(o, _)| rank(found.0) > rank(o)) {
                self.verdict = Some(found);
            }
        }
    }
}

/// Kernel command line for a trial: contract line for the mode, serial
/// console flags if missing, then extras. Validated as a whole.
pub fn boot_cmdline(mode: BootMode, extra: &[String]) -> Result<String, CmdlineError> {
    let kernel = &contract().kernel;
    let mut tokens: Vec<String> = kernel
        .cmdline(mode, &[])?
        .split_whitespace()
        .map(str::to_string)
        .collect();

    for (prefix, flag) in SERIAL_FLAGS {
        if !tokens.iter().any(|t| t.starts_with(prefix)) {
            tokens.push(flag.to_string());
        }
    }
    for param in extra {
        tokens.extend(param.split_whitespace().map(str::to_string));
    }

    let line = tokens.join(" ");
    kernel.validate(&line)?;
    Ok(line)
}

pub fn kvm_available() -> bool {
    Path::new("/dev/kvm").exists()
}

/// Emulator arguments: direct kernel boot, serial console on stdio.
pub fn emulator_args(config: &BootConfig, cmdline: &str, kvm: bool) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-kernel".into(),
        config.kernel.clone().into_os_string(),
        "-initrd".into(),
        config.archive.clone().into_os_string(),
        "-m".into(),
        format!("{}M", config.memory_mb).into(),
        "-nographic".into(),
        "-no-reboot".into(),
        "-append".into(),
        cmdline.into(),
    ];
    if kvm {
        args.extend(["-enable-kvm".into(), "-cpu".into(), "host".into()]);
    }
    args
}

/// Run one boot trial. `on_chunk` sees console output as it arrives and is
/// never called once the child has been killed.
pub async fn run_boot_trial<F>(config: &BootConfig, mut on_chunk: F) -> Result<BootTrial, BootError>
where
    F: FnMut(&[u8]),
{
    if !config.kernel.is_file() {
        return Err(BootError::MissingInput {
            what: "kernel",
            path: config.kernel.clone(),
        });
    }
    if !config.archive.is_file() {
        return Err(BootError::MissingInput {
            what: "archive",
            path: config.archive.clone(),
        });
    }

    let cmdline = boot_cmdline(config.mode, &config.extra_params)?;
    let program = which::which(&config.emulator).map_err(|e| {
        BootError::HostNotCapable(format!("{} not found: {}", config.emulator, e))
    })?;
    let kvm = config.kvm.unwrap_or_else(kvm_available);
    let args = emulator_args(config, &cmdline, kvm);
    info!("boot trial: {} (kvm: {}, timeout: {:?})", program.display(), kvm, config.timeout);
    debug!("cmdline: {}", cmdline);

    let mut child = Command::new(&program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| BootError::Spawn {
            program: program.display().to_string(),
            source,
        })?;

    let (tx, mut rx) = mpsc::channel::<(Stream, Vec<u8>)>(CHANNEL_CAPACITY);
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, Stream::Console, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, Stream::Emulator, tx.clone()));
    }
    drop(tx);

    let start = Instant::now();
    let deadline = start + config.timeout;
    let mut stop_at = deadline;
    let mut transcript = Vec::new();
    let mut scanner = ConsoleScanner::default();

    loop {
        match timeout_at(stop_at, rx.recv()).await {
            Ok(Some((stream, chunk))) => {
                on_chunk(&chunk);
                transcript.extend_from_slice(&chunk);
                if stream != Stream::Console {
                    continue;
                }
                let before = scanner.verdict();
                match scanner.feed(&chunk) {
                    Some((BootOutcome::Failed, _)) => break,
                    Some((BootOutcome::Success, _))
                        if !matches!(before, Some((BootOutcome::Success, _))) =>
                    {
                        stop_at = deadline.min(Instant::now() + config.grace);
                    }
                    _ => {}
                }
            }
            // Both streams closed: the emulator exited.
            Ok(None) => break,
            Err(_) => {
                debug!("boot trial stopped waiting after {:?}", start.elapsed());
                break;
            }
        }
    }

    rx.close();
    for reader in &readers {
        reader.abort();
    }
    let killed = match child.try_wait() {
        Ok(Some(_)) => false,
        _ => {
            let _ = child.start_kill();
            true
        }
    };
    let _ = child.wait().await;

    let (outcome, marker) = match scanner.verdict() {
        Some((outcome, marker)) => (outcome, Some(marker.to_string())),
        None => (BootOutcome::Inconclusive, None),
    };
    Ok(BootTrial {
        outcome,
        marker,
        cmdline,
        elapsed_ms: start.elapsed().as_millis() as u64,
        killed,
        transcript: String::from_utf8_lossy(&transcript).into_owned(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    /// Guest serial console.
    Console,
    /// Emulator diagnostics.
    Emulator,
}

fn spawn_reader<R>(mut reader: R, stream: Stream, tx: mpsc::Sender<(Stream, Vec<u8>)>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send((stream, buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}
