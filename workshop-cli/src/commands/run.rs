use clap::Args;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use workshop::{LifecycleController, Status};

use crate::cli::GlobalFlags;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Wipe persistent guest data and forget the projects directory before booting
    #[arg(long)]
    pub reset: bool,
}

pub async fn execute(args: RunArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let options = global.options();
    options.validate()?;
    let layout = options.layout();
    let _log_guard = workshop::util::init_logging_for(&layout, true)?;

    let controller = global.create_controller(&options)?;
    if args.reset {
        controller.reset().await?;
    }
    let printer = spawn_status_printer(controller.subscribe());

    if let Err(e) = controller.start().await {
        let failed = controller.status();
        // Release whatever the failed start left behind, keeping the instance.
        if let Err(stop_err) = controller.stop_default().await {
            tracing::warn!("Cleanup after failed start also failed: {}", stop_err);
        }
        printer.abort();
        anyhow::bail!("failed to start workshop VM ({}): {}", failed, e);
    }
    if let Some(addr) = controller.relay_addr() {
        println!("relay listening on {}", addr);
    }

    wait_for_shutdown(&controller).await?;

    let result = controller.quit().await;
    printer.abort();
    result?;
    Ok(())
}

fn spawn_status_printer(mut statuses: broadcast::Receiver<Status>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match statuses.recv().await {
                Ok(status) => println!("status: {}", status),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_restart(controller: &LifecycleController, reset: bool) {
    let controller = controller.clone();
    tokio::spawn(async move {
        controller.arm_restart();
        if let Err(e) = controller.restart(reset).await {
            eprintln!("Error: restart failed: {}", e);
        }
    });
}

/// Block until asked to quit. SIGHUP restarts, SIGUSR1 restarts with a reset.
#[cfg(unix)]
async fn wait_for_shutdown(controller: &LifecycleController) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut reset = signal(SignalKind::user_defined1())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = terminate.recv() => break,
            _ = hangup.recv() => spawn_restart(controller, false),
            _ = reset.recv() => spawn_restart(controller, true),
        }
    }
    tracing::info!("Shutdown requested");
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_controller: &LifecycleController) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    Ok(())
}
