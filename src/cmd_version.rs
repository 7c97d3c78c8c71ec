use nebula_tower::daemon::daemon_version;
use nebula_tower::Supervisor;

use crate::output;

pub(crate) async fn cmd_version() -> anyhow::Result<()> {
    let supervisor = Supervisor::from_env()?;

    let nebula = match daemon_version(supervisor.binaries()).await {
        Ok(version) => version,
        Err(e) => output::muted(e),
    };

    output::key_values(&[
        ("nebula-tower", format!("v{}", env!("CARGO_PKG_VERSION"))),
        ("nebula", nebula),
    ]);
    Ok(())
}
