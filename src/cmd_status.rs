use nebula_tower::Supervisor;

use crate::output;

pub(crate) async fn cmd_status() -> anyhow::Result<()> {
    let supervisor = Supervisor::from_env()?;
    let settings = supervisor.settings();

    let pb = output::create_spinner("Checking lighthouse...");
    supervisor.refresh_config().await;
    supervisor.poll_lighthouse().await;
    pb.finish_and_clear();

    let snapshot = supervisor.state().snapshot();
    let binaries = supervisor.binaries();

    output::section("Nebula");
    let mut rows = vec![
        ("Binaries installed", output::yes_no(binaries.is_complete())),
        ("Config bundle", output::yes_no(snapshot.config_complete)),
        (
            "Overlay address",
            snapshot
                .assigned_address
                .clone()
                .unwrap_or_else(|| output::muted("unknown")),
        ),
        ("Bundle dir", output::muted(supervisor.bundle().dir().display())),
    ];
    let missing = supervisor.bundle().missing();
    if !missing.is_empty() {
        rows.push(("Missing files", output::muted(missing.join(", "))));
    }
    output::key_values(&rows);
    println!();

    output::section("Lighthouse");
    let mut rows = vec![
        ("Address", settings.tower_address.clone()),
        ("Connected", output::yes_no(snapshot.is_connected())),
    ];
    if let Some(status) = snapshot.lighthouse.filter(|s| s.connected) {
        rows.push(("Organization", status.company_name));
        rows.push(("Public IP", status.public_ip));
        rows.push(("Lighthouse IP", status.nebula_ip));
        rows.push(("Lighthouse running", output::yes_no(status.lighthouse_is_running)));
        if !status.message.is_empty() {
            rows.push(("Message", status.message));
        }
    }
    output::key_values(&rows);

    Ok(())
}
