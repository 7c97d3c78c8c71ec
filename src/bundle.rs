//! Config bundle presence and certificate introspection.

use async_trait::async_trait;
use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::BundleError;
use crate::installer::BinarySet;
use crate::monitor::ConfigRefresher;
use crate::state::SupervisorState;

pub const CONFIG_FILE: &str = "config.yaml";
pub const CA_CERT_FILE: &str = "ca.crt";
pub const HOST_CERT_FILE: &str = "host.crt";
pub const HOST_KEY_FILE: &str = "host.key";

/// Upper bound on a single `nebula-cert` invocation.
pub const CERT_TOOL_TIMEOUT: Duration = Duration::from_secs(5);

/// Every file the daemon needs, in a fixed order.
pub const BUNDLE_FILES: [&str; 4] = [CONFIG_FILE, CA_CERT_FILE, HOST_CERT_FILE, HOST_KEY_FILE];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigBundle {
    dir: PathBuf,
}

impl ConfigBundle {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    pub fn host_cert(&self) -> PathBuf {
        self.dir.join(HOST_CERT_FILE)
    }

    pub fn paths(&self) -> impl Iterator<Item = PathBuf> + '_ {
        BUNDLE_FILES.iter().map(|name| self.dir.join(name))
    }

    /// True iff every bundle file exists.
    pub fn check_complete(&self) -> bool {
        self.paths().all(|p| p.is_file())
    }

    pub fn missing(&self) -> Vec<&'static str> {
        BUNDLE_FILES
            .iter()
            .copied()
            .filter(|name| !self.dir.join(name).is_file())
            .collect()
    }

    /// Removes every bundle file; already-absent files are fine.
    pub fn delete(&self) -> Result<(), BundleError> {
        let mut failures = Vec::new();

        for path in self.paths() {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed bundle file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => failures.push((path, e.to_string())),
            }
        }

        if failures.is_empty() {
            info!(dir = %self.dir.display(), "Config bundle removed");
            Ok(())
        } else {
            Err(BundleError::PartialDelete { failures })
        }
    }
}

#[derive(Debug, Deserialize)]
struct CertDescriptor {
    details: CertDetails,
}

#[derive(Debug, Deserialize)]
struct CertDetails {
    #[serde(default)]
    networks: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CertPrint {
    Many(Vec<CertDescriptor>),
    One(CertDescriptor),
}

/// First network of the first certificate, without its prefix length.
pub(crate) fn parse_assigned_address(json: &str) -> Option<String> {
    let printed: CertPrint = match serde_json::from_str(json) {
        Ok(printed) => printed,
        Err(e) => {
            warn!("Failed to parse nebula-cert output: {}", e);
            return None;
        }
    };

    let first = match printed {
        CertPrint::Many(certs) => certs.into_iter().next()?,
        CertPrint::One(cert) => cert,
    };

    let network = first.details.networks.into_iter().next()?;
    let address = network.split('/').next().unwrap_or_default().trim();
    (!address.is_empty()).then(|| address.to_string())
}

/// Runs `nebula-cert print -path host.crt -json`. Every failure is soft.
pub async fn extract_assigned_address(bundle: &ConfigBundle, cert_tool: &Path) -> Option<String> {
    extract_assigned_address_within(bundle, cert_tool, CERT_TOOL_TIMEOUT).await
}

/// A tool still running after `timeout` is killed and treated as a soft failure.
pub async fn extract_assigned_address_within(
    bundle: &ConfigBundle,
    cert_tool: &Path,
    timeout: Duration,
) -> Option<String> {
    let host_cert = bundle.host_cert();
    if !host_cert.is_file() {
        debug!(path = %host_cert.display(), "Host certificate missing");
        return None;
    }
    if !cert_tool.is_file() {
        debug!(path = %cert_tool.display(), "nebula-cert not installed");
        return None;
    }

    let mut cmd = Command::new(cert_tool);
    cmd.arg("print")
        .arg("-path")
        .arg(&host_cert)
        .arg("-json")
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!("Failed to execute nebula-cert print: {}", e);
            return None;
        }
        Err(_) => {
            warn!(?timeout, "nebula-cert print timed out");
            return None;
        }
    };

    if !output.status.success() {
        warn!(
            status = ?output.status.code(),
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "nebula-cert print failed"
        );
        return None;
    }

    let address = parse_assigned_address(String::from_utf8_lossy(&output.stdout).trim());
    if address.is_none() {
        warn!("Host certificate lists no networks");
    }
    address
}

/// Recomputes bundle completeness and the assigned address into the shared state.
///
/// Checks are serialized so a slow check can never overwrite a newer result.
pub struct PresenceProbe {
    bundle: ConfigBundle,
    binaries: BinarySet,
    state: Arc<SupervisorState>,
    cert_timeout: Duration,
    checking: Mutex<()>,
}

impl PresenceProbe {
    pub fn new(bundle: ConfigBundle, binaries: BinarySet, state: Arc<SupervisorState>) -> Self {
        Self {
            bundle,
            binaries,
            state,
            cert_timeout: CERT_TOOL_TIMEOUT,
            checking: Mutex::new(()),
        }
    }

    pub fn with_cert_timeout(mut self, timeout: Duration) -> Self {
        self.cert_timeout = timeout;
        self
    }

    /// `force` re-reads the certificate even when an address is already known.
    pub async fn check(&self, force: bool) -> bool {
        let _guard = self.checking.lock().await;

        let complete = self.bundle.check_complete();
        let address = if !complete {
            None
        } else if force || self.state.assigned_address().is_none() {
            extract_assigned_address_within(&self.bundle, &self.binaries.cert_tool, self.cert_timeout)
                .await
        } else {
            self.state.assigned_address()
        };

        self.state.set_config_presence(complete, address);
        complete
    }
}

#[async_trait]
impl ConfigRefresher for PresenceProbe {
    async fn refresh(&self) {
        self.check(false).await;
    }
}
