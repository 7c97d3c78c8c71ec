//! Top-level facade over the installer, process controller and monitors.
//!
//! Presentation layers (the CLI today) talk only to [`Supervisor`] and read
//! everything else from [`SupervisorState`].

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bundle::{ConfigBundle, PresenceProbe};
use crate::clienv;
use crate::daemon::{ProcessController, Reconciler};
use crate::error::{BundleError, InstallError, InviteError, ProcessError};
use crate::installer::{current_target, BinarySet, Installer};
use crate::invite::InviteClient;
use crate::monitor::{ConnectivityMonitor, HttpStatusSource, StatusSource, REQUEST_TIMEOUT};
use crate::state::SupervisorState;
use crate::user_config::{SharedConfig, UserConfig};

const FALLBACK_HOST_NAME: &str = "nebula-client";

/// Filesystem and network locations the supervisor works with.
#[derive(Debug, Clone)]
pub struct SupervisorPaths {
    pub bin_dir: PathBuf,
    pub bundle_dir: PathBuf,
    pub config_file: PathBuf,
    pub download_base_url: String,
}

impl SupervisorPaths {
    pub fn from_env() -> Self {
        Self {
            bin_dir: clienv::bin_dir(),
            bundle_dir: clienv::bundle_dir(),
            config_file: clienv::config_file(),
            download_base_url: clienv::download_base_url(),
        }
    }
}

pub struct Supervisor {
    state: Arc<SupervisorState>,
    settings: SharedConfig,
    paths: SupervisorPaths,
    bundle: ConfigBundle,
    controller: Arc<ProcessController>,
    installer: Installer,
    probe: Arc<PresenceProbe>,
    source: Arc<dyn StatusSource>,
    interval: Duration,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(paths: SupervisorPaths, settings: UserConfig) -> Result<Self> {
        let source = HttpStatusSource::new(REQUEST_TIMEOUT).context("Failed to create status client")?;
        let installer = Installer::new().context("Failed to create installer")?;

        let state = Arc::new(SupervisorState::new());
        let binaries = BinarySet::in_dir(&paths.bin_dir);
        let bundle = ConfigBundle::new(&paths.bundle_dir);
        let controller = Arc::new(ProcessController::new(
            Arc::clone(&state),
            binaries.clone(),
            bundle.clone(),
        ));
        let probe = Arc::new(PresenceProbe::new(bundle.clone(), binaries, Arc::clone(&state)));

        Ok(Self {
            state,
            settings: settings.into_shared(),
            paths,
            bundle,
            controller,
            installer,
            probe,
            source: Arc::new(source),
            interval: clienv::poll_interval(),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Loads settings from disk and resolves paths from the environment.
    pub fn from_env() -> Result<Self> {
        let paths = SupervisorPaths::from_env();
        let settings = UserConfig::load_from(&paths.config_file)?;
        Self::new(paths, settings)
    }

    pub fn with_status_source(mut self, source: Arc<dyn StatusSource>) -> Self {
        self.source = source;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn state(&self) -> &Arc<SupervisorState> {
        &self.state
    }

    pub fn controller(&self) -> &Arc<ProcessController> {
        &self.controller
    }

    pub fn bundle(&self) -> &ConfigBundle {
        &self.bundle
    }

    pub fn binaries(&self) -> &BinarySet {
        self.controller.binaries()
    }

    pub fn settings(&self) -> UserConfig {
        self.settings.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Starts the connectivity monitor and the process reconciler.
    pub fn spawn_background(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            warn!("Background tasks already running");
            return;
        }

        let monitor = self.monitor();
        let cancel = self.cancel.clone();
        tasks.push(tokio::spawn(async move { monitor.run(cancel).await }));

        let reconciler = Reconciler::new(Arc::clone(&self.controller)).with_interval(self.interval);
        let cancel = self.cancel.clone();
        tasks.push(tokio::spawn(async move { reconciler.run(cancel).await }));

        info!(interval = ?self.interval, "Supervisor background tasks started");
    }

    fn monitor(&self) -> ConnectivityMonitor {
        ConnectivityMonitor::new(
            Arc::clone(&self.state),
            Arc::clone(&self.settings),
            Arc::clone(&self.source),
        )
        .with_refresher(self.probe.clone())
        .with_interval(self.interval)
    }

    /// A single connectivity cycle outside the background loop.
    pub async fn poll_lighthouse(&self) -> bool {
        self.monitor().poll_once().await
    }

    /// Cancels background work, then stops the daemon within `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        info!("Shutting down supervisor");
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        let deadline = tokio::time::Instant::now() + timeout;
        for task in tasks {
            match tokio::time::timeout_at(deadline, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Background task failed: {}", e),
                Err(_) => warn!("Background task did not stop in time"),
            }
        }

        match self.controller.stop_and_wait(timeout).await {
            Ok(()) | Err(ProcessError::NotRunning) => {}
            Err(e) => warn!("{}", e),
        }
        info!("Supervisor stopped");
    }

    /// Recomputes bundle completeness and the assigned address.
    pub async fn refresh_config(&self) -> bool {
        self.probe.check(true).await
    }

    pub async fn install(&self) -> Result<BinarySet, InstallError> {
        let target = current_target(&self.paths.download_base_url)?;
        let result = self.installer.install(&target, &self.paths.bin_dir).await;
        self.refresh_config().await;
        result
    }

    pub async fn start(&self) -> Result<u32, ProcessError> {
        self.refresh_config().await;
        self.controller.start().await
    }

    pub async fn stop(&self) -> Result<(), ProcessError> {
        self.controller.stop().await
    }

    pub async fn delete_config(&self) -> Result<(), BundleError> {
        let result = self.bundle.delete();
        self.refresh_config().await;
        result
    }

    /// Redeems the configured invite code for a fresh config bundle.
    pub async fn redeem_invite(&self, name: Option<&str>, tags: &[String]) -> Result<(), InviteError> {
        if !self.state.is_connected() {
            return Err(InviteError::NotConnected);
        }

        let settings = self.settings();
        let name = name
            .map(str::to_string)
            .or(settings.host_name.clone())
            .unwrap_or_else(default_host_name);

        let client = InviteClient::new()?;
        let result = client
            .redeem(
                &settings.tower_address,
                &settings.invite_code,
                &name,
                tags,
                &self.bundle,
            )
            .await;
        self.refresh_config().await;
        result.map(|_| ())
    }

    pub fn set_tower_address(&self, address: &str) -> Result<()> {
        let address = address.trim().to_string();
        self.update_settings(|s| s.tower_address = address)?;
        info!(address = %self.settings().tower_address, "Tower address updated");
        Ok(())
    }

    /// Storing an invite code requires a live lighthouse connection.
    pub fn set_invite_code(&self, code: &str) -> Result<(), InviteError> {
        if !self.state.is_connected() {
            return Err(InviteError::NotConnected);
        }
        let code = code.trim().to_string();
        self.update_settings(|s| s.invite_code = code)
            .map_err(|e| InviteError::Io(std::io::Error::other(format!("{:#}", e))))?;
        info!("Invite code saved");
        Ok(())
    }

    fn update_settings<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut UserConfig),
    {
        let updated = {
            let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
            f(&mut settings);
            settings.clone()
        };
        debug!(path = %self.paths.config_file.display(), "Persisting settings");
        updated.save_to(&self.paths.config_file)
    }
}

fn default_host_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.trim().is_empty()))
        .unwrap_or_else(|| FALLBACK_HOST_NAME.to_string())
}
