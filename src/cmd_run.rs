use nebula_tower::daemon::controller::DEFAULT_STOP_GRACE;
use nebula_tower::{StateEvent, Supervisor};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub(crate) async fn cmd_run(auto_start: bool) -> anyhow::Result<()> {
    let supervisor = Supervisor::from_env()?;
    let mut events = supervisor.state().subscribe();

    let complete = supervisor.refresh_config().await;
    if !supervisor.binaries().is_complete() {
        warn!("Nebula binaries not installed; run `nebula-tower install`");
    }
    if auto_start && complete {
        try_start(&supervisor).await;
    }

    supervisor.spawn_background();

    let shutdown = CancellationToken::new();
    watch_signals(shutdown.clone())?;
    info!("Nebula supervisor ready");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => {
                    log_event(&supervisor, &event);
                    if auto_start
                        && event == (StateEvent::ConfigPresenceChanged { complete: true })
                    {
                        try_start(&supervisor).await;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "State events dropped"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    supervisor.shutdown(DEFAULT_STOP_GRACE).await;
    Ok(())
}

async fn try_start(supervisor: &Supervisor) {
    if supervisor.state().snapshot().is_running() {
        return;
    }
    if let Err(e) = supervisor.start().await {
        error!("Failed to start nebula: {}", e);
    }
}

fn log_event(supervisor: &Supervisor, event: &StateEvent) {
    match event {
        StateEvent::ConfigPresenceChanged { complete } => info!(complete, "Config bundle presence changed"),
        StateEvent::AssignedAddressChanged(Some(address)) => info!(address = %address, "Overlay address assigned"),
        StateEvent::AssignedAddressChanged(None) => info!("Overlay address cleared"),
        StateEvent::ProcessStarted { pid } => info!(pid, "Nebula started"),
        StateEvent::ProcessStopped { pid } => info!(pid, "Nebula stopped"),
        StateEvent::ProcessExited { pid } => {
            warn!(pid, "Nebula exited unexpectedly");
            for line in supervisor.controller().log_buffer().tail(10) {
                warn!(target: "nebula", "{}", line);
            }
        }
        StateEvent::ConnectivityChanged { connected } => info!(connected, "Lighthouse connectivity changed"),
        StateEvent::LighthouseUpdated => {
            if let Some(status) = supervisor.state().lighthouse() {
                info!(
                    company = %status.company_name,
                    public_ip = %status.public_ip,
                    nebula_ip = %status.nebula_ip,
                    lighthouse_running = status.lighthouse_is_running,
                    "Lighthouse status updated"
                );
            }
        }
        StateEvent::Reconnected | StateEvent::Refreshed => {}
    }
}

fn watch_signals(shutdown: CancellationToken) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
            }
            shutdown.cancel();
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Received Ctrl+C");
            shutdown.cancel();
        });
    }

    Ok(())
}
