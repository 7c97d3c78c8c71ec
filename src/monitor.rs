//! Lighthouse connectivity monitor.
//!
//! Polls `http://<tower>/client/api/info` on a fixed interval. Every failure
//! degrades the state to disconnected; nothing escapes the loop.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::PollError;
use crate::state::{LighthouseStatus, StateEvent, SupervisorState};
use crate::user_config::SharedConfig;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
pub const INFO_PATH: &str = "/client/api/info";

/// Status document served by the lighthouse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InfoResponse {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub company_name: String,
    #[serde(default)]
    pub public_ip: String,
    #[serde(default)]
    pub nebula_ip: String,
    #[serde(default)]
    pub lighthouse_is_running: bool,
}

impl InfoResponse {
    fn into_status(self) -> LighthouseStatus {
        LighthouseStatus {
            message: self.message,
            company_name: self.company_name,
            public_ip: self.public_ip,
            nebula_ip: self.nebula_ip,
            lighthouse_is_running: self.lighthouse_is_running,
            connected: true,
            updated_at: Some(Utc::now()),
        }
    }
}

/// Where lighthouse status documents come from.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch(&self, address: &str) -> Result<InfoResponse, PollError>;
}

/// Re-checks on-disk configuration after each poll.
#[async_trait]
pub trait ConfigRefresher: Send + Sync {
    async fn refresh(&self);
}

/// `http://` is assumed when the address carries no scheme.
pub fn coordinator_url(address: &str, path: &str) -> String {
    let address = address.trim().trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        format!("{}{}", address, path)
    } else {
        format!("http://{}{}", address, path)
    }
}

pub struct HttpStatusSource {
    client: reqwest::Client,
}

impl HttpStatusSource {
    pub fn new(timeout: Duration) -> Result<Self, PollError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PollError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    async fn fetch(&self, address: &str) -> Result<InfoResponse, PollError> {
        let url = coordinator_url(address, INFO_PATH);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PollError::Transport(e.to_string()))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(PollError::UnexpectedStatus(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| PollError::Transport(e.to_string()))?;
        serde_json::from_str(&body).map_err(|e| PollError::Decode(e.to_string()))
    }
}

pub struct ConnectivityMonitor {
    state: Arc<SupervisorState>,
    settings: SharedConfig,
    source: Arc<dyn StatusSource>,
    refresher: Option<Arc<dyn ConfigRefresher>>,
    interval: Duration,
}

impl ConnectivityMonitor {
    pub fn new(
        state: Arc<SupervisorState>,
        settings: SharedConfig,
        source: Arc<dyn StatusSource>,
    ) -> Self {
        Self {
            state,
            settings,
            source,
            refresher: None,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn ConfigRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    fn tower_address(&self) -> String {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .tower_address
            .trim()
            .to_string()
    }

    /// One poll cycle. Returns whether the lighthouse answered.
    pub async fn poll_once(&self) -> bool {
        let address = self.tower_address();

        let connected = if address.is_empty() {
            debug!("Lighthouse address not configured");
            self.state.mark_disconnected();
            false
        } else {
            match self.source.fetch(&address).await {
                Ok(info) => {
                    debug!(?info, "Lighthouse status received");
                    if self.state.apply_lighthouse(info.into_status()) {
                        info!(address = %address, "Connected to lighthouse");
                    }
                    true
                }
                Err(e) => {
                    let was_connected = self.state.is_connected();
                    warn!(address = %address, "Lighthouse poll failed: {}", e);
                    self.state.mark_disconnected();
                    if was_connected {
                        info!(address = %address, "Lost connection to lighthouse");
                    }
                    false
                }
            }
        };

        if let Some(refresher) = &self.refresher {
            refresher.refresh().await;
        }
        self.state.notify(StateEvent::Refreshed);

        connected
    }

    /// Polls until `cancel` fires. Cycles never overlap.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(interval = ?self.interval, "Connectivity monitor started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.poll_once() => {}
            }
        }

        info!("Connectivity monitor stopped");
    }
}
