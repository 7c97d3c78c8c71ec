mod args;
mod cmd_config;
mod cmd_install;
mod cmd_redeem;
mod cmd_reset;
mod cmd_run;
mod cmd_status;
mod cmd_version;
mod output;

use args::{Cli, Commands};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { auto_start } => cmd_run::cmd_run(auto_start).await?,
        Commands::Install => cmd_install::cmd_install().await?,
        Commands::Status => cmd_status::cmd_status().await?,
        Commands::Config { command } => cmd_config::cmd_config(command).await?,
        Commands::Redeem { name, tags } => cmd_redeem::cmd_redeem(name, tags).await?,
        Commands::Reset => cmd_reset::cmd_reset().await?,
        Commands::Version => cmd_version::cmd_version().await?,
    }

    Ok(())
}
