//! Shared supervisor state.
//!
//! Every component writes through [`SupervisorState`]; readers only ever see
//! whole [`Snapshot`]s. Changes are published on a broadcast channel so a
//! presentation layer can refresh without polling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock};
use tokio::sync::broadcast;
use tracing::trace;

const EVENT_CAPACITY: usize = 64;

/// The daemon process currently under supervision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessHandle {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// Last known lighthouse status. Always replaced as a whole.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LighthouseStatus {
    pub message: String,
    pub company_name: String,
    pub public_ip: String,
    pub nebula_ip: String,
    pub lighthouse_is_running: bool,
    /// Derived by the monitor, never read from the payload.
    pub connected: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub config_complete: bool,
    pub process: Option<ProcessHandle>,
    pub lighthouse: Option<LighthouseStatus>,
    pub assigned_address: Option<String>,
}

impl Snapshot {
    pub fn is_running(&self) -> bool {
        self.process.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.lighthouse.as_ref().is_some_and(|l| l.connected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateEvent {
    ConfigPresenceChanged { complete: bool },
    AssignedAddressChanged(Option<String>),
    ProcessStarted { pid: u32 },
    ProcessStopped { pid: u32 },
    /// The daemon died without being asked to stop.
    ProcessExited { pid: u32 },
    ConnectivityChanged { connected: bool },
    LighthouseUpdated,
    /// Disconnected -> connected transition.
    Reconnected,
    /// A monitor cycle finished; emitted every cycle.
    Refreshed,
}

pub struct SupervisorState {
    inner: RwLock<Snapshot>,
    events: broadcast::Sender<StateEvent>,
}

impl SupervisorState {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: RwLock::new(Snapshot::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn config_complete(&self) -> bool {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).config_complete
    }

    pub fn process(&self) -> Option<ProcessHandle> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).process.clone()
    }

    pub fn lighthouse(&self) -> Option<LighthouseStatus> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).lighthouse.clone()
    }

    pub fn assigned_address(&self) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .assigned_address
            .clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).is_connected()
    }

    /// Publish an event; having no subscribers is fine.
    pub fn notify(&self, event: StateEvent) {
        trace!(?event, "State event");
        let _ = self.events.send(event);
    }

    /// Mutate under the write lock, then publish whatever `f` returned.
    fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut Snapshot) -> Vec<StateEvent>,
    {
        let events = {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            f(&mut inner)
        };
        for event in events {
            self.notify(event);
        }
    }

    pub fn set_config_presence(&self, complete: bool, assigned_address: Option<String>) {
        self.update(|s| {
            let mut events = Vec::new();
            if s.config_complete != complete {
                s.config_complete = complete;
                events.push(StateEvent::ConfigPresenceChanged { complete });
            }
            if s.assigned_address != assigned_address {
                s.assigned_address = assigned_address.clone();
                events.push(StateEvent::AssignedAddressChanged(assigned_address));
            }
            events
        });
    }

    pub fn process_started(&self, handle: ProcessHandle) {
        self.update(|s| {
            let pid = handle.pid;
            s.process = Some(handle);
            vec![StateEvent::ProcessStarted { pid }]
        });
    }

    /// Clears the handle after an explicit stop.
    pub fn process_stopped(&self, pid: u32) {
        self.clear_process(pid, StateEvent::ProcessStopped { pid });
    }

    /// Clears the handle after reconciliation found the process dead.
    pub fn process_exited(&self, pid: u32) {
        self.clear_process(pid, StateEvent::ProcessExited { pid });
    }

    fn clear_process(&self, pid: u32, event: StateEvent) {
        self.update(|s| match &s.process {
            Some(handle) if handle.pid == pid => {
                s.process = None;
                vec![event]
            }
            _ => Vec::new(),
        });
    }

    /// Stores a freshly decoded status. Returns whether this was a reconnect.
    pub fn apply_lighthouse(&self, status: LighthouseStatus) -> bool {
        let mut reconnected = false;
        self.update(|s| {
            let was_connected = s.is_connected();
            let mut events = Vec::new();
            if s.lighthouse.as_ref() != Some(&status) {
                events.push(StateEvent::LighthouseUpdated);
            }
            if was_connected != status.connected {
                events.push(StateEvent::ConnectivityChanged {
                    connected: status.connected,
                });
                if status.connected {
                    reconnected = true;
                    events.push(StateEvent::Reconnected);
                }
            }
            s.lighthouse = Some(status);
            events
        });
        reconnected
    }

    /// Flips `connected` off, keeping the last known metadata.
    pub fn mark_disconnected(&self) {
        self.update(|s| {
            let mut status = s.lighthouse.clone().unwrap_or_default();
            let was_connected = status.connected;
            status.connected = false;
            s.lighthouse = Some(status);
            if was_connected {
                vec![StateEvent::ConnectivityChanged { connected: false }]
            } else {
                Vec::new()
            }
        });
    }
}

impl Default for SupervisorState {
    fn default() -> Self {
        Self::new()
    }
}
