pub mod bundle;
pub mod clienv;
pub mod daemon;
pub mod error;
pub mod installer;
pub mod invite;
pub mod monitor;
pub mod state;
pub mod supervisor;
pub mod user_config;

#[cfg(test)]
mod test_support;

pub use error::{BundleError, InstallError, InviteError, PollError, ProcessError};
pub use state::{LighthouseStatus, ProcessHandle, Snapshot, StateEvent, SupervisorState};
pub use supervisor::{Supervisor, SupervisorPaths};
pub use user_config::UserConfig;
