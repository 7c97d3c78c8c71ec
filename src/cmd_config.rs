use nebula_tower::{InviteError, Supervisor, UserConfig};

use crate::args::ConfigCommands;
use crate::output;

pub(crate) async fn cmd_config(command: Option<ConfigCommands>) -> anyhow::Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => cmd_config_show(),
        Some(ConfigCommands::SetTower { address }) => {
            let supervisor = Supervisor::from_env()?;
            supervisor.set_tower_address(&address)?;
            output::success(format!(
                "Tower address set to {}",
                supervisor.settings().tower_address
            ));
            Ok(())
        }
        Some(ConfigCommands::SetInvite { code }) => cmd_config_set_invite(&code).await,
    }
}

fn cmd_config_show() -> anyhow::Result<()> {
    let config_path = UserConfig::config_path();
    let config = UserConfig::load_from(&config_path)?;

    output::section("Configuration");

    let invite = if config.invite_code.is_empty() {
        output::muted("not set")
    } else {
        "********".to_string()
    };
    let host_name = config
        .host_name
        .clone()
        .unwrap_or_else(|| output::muted("system default"));

    output::key_values(&[
        ("Tower address", config.tower_address.clone()),
        ("Invite code", invite),
        ("Host name", host_name),
        ("Config file", output::muted(config_path.display())),
    ]);
    Ok(())
}

async fn cmd_config_set_invite(code: &str) -> anyhow::Result<()> {
    let supervisor = Supervisor::from_env()?;

    let pb = output::create_spinner("Contacting lighthouse...");
    supervisor.poll_lighthouse().await;
    pb.finish_and_clear();

    match supervisor.set_invite_code(code) {
        Ok(()) => {
            output::success("Invite code saved");
            Ok(())
        }
        Err(InviteError::NotConnected) => {
            output::failure(format!(
                "Must be connected to the lighthouse at {} to save an invite code",
                supervisor.settings().tower_address
            ));
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}
