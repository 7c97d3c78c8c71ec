use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "nebula-tower")]
#[command(version)]
#[command(about = "Supervisor for the Nebula overlay daemon", long_about = None)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Supervise nebula until interrupted
    Run {
        /// Start the daemon as soon as the config bundle is complete
        #[arg(long)]
        auto_start: bool,
    },

    /// Download and install the nebula binaries for this platform
    Install,

    /// Show binaries, config bundle and lighthouse status
    Status,

    /// Show or change settings
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },

    /// Redeem the configured invite code for a config bundle
    Redeem {
        /// Host name to register (defaults to the configured or system host name)
        #[arg(long)]
        name: Option<String>,

        /// Tags to attach to the host
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Delete the config bundle
    Reset,

    /// Show supervisor and nebula versions
    Version,
}

#[derive(Subcommand)]
pub(crate) enum ConfigCommands {
    /// Show current settings
    Show,

    /// Set the lighthouse (tower) address
    SetTower {
        /// Address as host:port
        address: String,
    },

    /// Store an invite code (requires a lighthouse connection)
    SetInvite {
        /// Invite code
        code: String,
    },
}
