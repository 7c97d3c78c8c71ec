use std::path::PathBuf;
use std::time::Duration;

/// Environment variables understood by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvVar {
    ConfigDir,
    DownloadUrl,
    PollIntervalSecs,
}

impl EnvVar {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigDir => "NEBULA_TOWER_CONFIG_DIR",
            Self::DownloadUrl => "NEBULA_TOWER_DOWNLOAD_URL",
            Self::PollIntervalSecs => "NEBULA_TOWER_POLL_INTERVAL_SECS",
        }
    }
}

const FALLBACK_CONFIG_DIR: &str = "~/.config";
const APP_SUBDIR: &str = "nebula-tower";
const DEFAULT_DOWNLOAD_URL: &str = "https://github.com/NebulaOSS/nebula-nightly/releases/latest/download";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_or(name: &str, default: &str) -> String {
    env_opt(name).unwrap_or_else(|| default.to_string())
}

/// App directory ($NEBULA_TOWER_CONFIG_DIR or ~/.config/nebula-tower)
pub fn config_dir() -> PathBuf {
    let dir = env_opt(EnvVar::ConfigDir.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_DIR))
                .join(APP_SUBDIR)
        });
    tracing::trace!(dir = %dir.display(), "Resolved config directory");
    dir
}

/// Settings file (<config_dir>/config.toml)
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Installed executables (<config_dir>/bin)
pub fn bin_dir() -> PathBuf {
    config_dir().join("bin")
}

/// Nebula config bundle (<config_dir>/nebula)
pub fn bundle_dir() -> PathBuf {
    config_dir().join("nebula")
}

/// Archive base URL ($NEBULA_TOWER_DOWNLOAD_URL or the nightly release page)
pub fn download_base_url() -> String {
    let url = env_or(EnvVar::DownloadUrl.as_str(), DEFAULT_DOWNLOAD_URL);
    tracing::trace!(url = %url, "Download base URL");
    url
}

/// Poll and reconcile period ($NEBULA_TOWER_POLL_INTERVAL_SECS or 5s)
pub fn poll_interval() -> Duration {
    let secs = env_opt(EnvVar::PollIntervalSecs.as_str())
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|s| *s > 0)
        .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
    tracing::trace!(secs, "Poll interval");
    Duration::from_secs(secs)
}
