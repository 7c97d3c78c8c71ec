use nebula_tower::{InviteError, Supervisor};

use crate::output;

pub(crate) async fn cmd_redeem(name: Option<String>, tags: Vec<String>) -> anyhow::Result<()> {
    let supervisor = Supervisor::from_env()?;

    let pb = output::create_spinner("Contacting lighthouse...");
    supervisor.poll_lighthouse().await;
    pb.set_message("Redeeming invite code...");
    let result = supervisor.redeem_invite(name.as_deref(), &tags).await;
    pb.finish_and_clear();

    match result {
        Ok(()) => {
            output::success(format!(
                "Config bundle installed to {}",
                supervisor.bundle().dir().display()
            ));
            if let Some(address) = supervisor.state().assigned_address() {
                output::success(format!("Overlay address: {}", address));
            }
            if !supervisor.binaries().is_complete() {
                output::warning("Nebula binaries are not installed yet; run `nebula-tower install`");
            }
            Ok(())
        }
        Err(InviteError::NotConnected) => {
            output::failure(format!(
                "Cannot reach the lighthouse at {}",
                supervisor.settings().tower_address
            ));
            std::process::exit(1);
        }
        Err(InviteError::EmptyCode) => {
            output::failure("No invite code configured; run `nebula-tower config set-invite <code>`");
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}
