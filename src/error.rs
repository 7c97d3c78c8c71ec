use std::path::PathBuf;
use thiserror::Error;

/// Failures while provisioning the nebula executables.
#[derive(Error, Debug)]
pub enum InstallError {
    #[error("unsupported platform: {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    #[error("failed to download {url}: {reason}")]
    Download { url: String, reason: String },

    #[error("failed to extract {archive}: {reason}")]
    Extract { archive: String, reason: String },

    #[error("'{0}' not found in archive")]
    BinaryNotFound(String),

    #[error("another installation is already in progress")]
    Busy,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the daemon process controller.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("nebula configuration incomplete in {}", .0.display())]
    ConfigMissing(PathBuf),

    #[error("nebula binary not found at {}", .0.display())]
    BinaryMissing(PathBuf),

    #[error("nebula is already running (PID {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("nebula is not running")]
    NotRunning,

    #[error("failed to spawn nebula: {0}")]
    Spawn(#[source] std::io::Error),

    /// Supervision ended but the stop signal could not be delivered.
    #[error("stop signal for PID {pid} not delivered: {reason}")]
    StopWarning { pid: u32, reason: String },

    #[error("nebula -version failed: {0}")]
    Version(String),
}

impl ProcessError {
    /// Warnings leave the controller in a consistent state.
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::StopWarning { .. })
    }
}

/// Reasons a single lighthouse poll counts as disconnected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PollError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected status {0}")]
    UnexpectedStatus(u16),

    #[error("failed to decode status document: {0}")]
    Decode(String),
}

/// Failures while removing the config bundle.
#[derive(Error, Debug)]
pub enum BundleError {
    #[error("failed to remove {} bundle file(s): {}", .failures.len(), format_failures(.failures))]
    PartialDelete { failures: Vec<(PathBuf, String)> },
}

fn format_failures(failures: &[(PathBuf, String)]) -> String {
    failures
        .iter()
        .map(|(path, reason)| format!("{}: {}", path.display(), reason))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failures while redeeming an invite code against the lighthouse.
#[derive(Error, Debug)]
pub enum InviteError {
    #[error("must be connected to the lighthouse to redeem an invite code")]
    NotConnected,

    #[error("no invite code configured")]
    EmptyCode,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invite rejected ({status}): {detail}")]
    Rejected { status: u16, detail: String },

    #[error("invalid config archive: {0}")]
    Archive(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
