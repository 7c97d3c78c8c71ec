use nebula_tower::Supervisor;

use crate::output;

pub(crate) async fn cmd_install() -> anyhow::Result<()> {
    let supervisor = Supervisor::from_env()?;

    let pb = output::create_spinner("Downloading nebula...");
    let result = supervisor.install().await;
    pb.finish_and_clear();

    let binaries = result?;
    output::success("Nebula binaries installed");
    output::key_values(&[
        ("nebula", output::muted(binaries.daemon.display())),
        ("nebula-cert", output::muted(binaries.cert_tool.display())),
    ]);
    Ok(())
}
