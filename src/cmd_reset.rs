use nebula_tower::Supervisor;

use crate::output;

pub(crate) async fn cmd_reset() -> anyhow::Result<()> {
    let supervisor = Supervisor::from_env()?;
    supervisor.delete_config().await?;
    output::success(format!(
        "Config bundle removed from {}",
        supervisor.bundle().dir().display()
    ));
    Ok(())
}
