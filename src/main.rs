use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::sync::Arc;
use stockroom::{
    AppConfig, BackupManager, Clock, SystemClock, UpdateOrchestrator, init_tracing, run_daemon,
    spawn_backup_loop,
};
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "stockroom-updater")]
#[command(about = "Checks for a new service version and redeploys it safely")]
struct Cli {
    /// Run one update check and exit (default)
    #[arg(long, conflicts_with = "daemon")]
    check: bool,

    /// Run the weekly update check and the data backup schedule until stopped
    #[arg(long)]
    daemon: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::from_env().context("failed to load updater configuration")?;
    init_tracing(&config).context("failed to initialise logging")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let orchestrator = Arc::new(UpdateOrchestrator::from_config(&config, Arc::clone(&clock)));

    if cli.check || !cli.daemon {
        let report = orchestrator.run_update_check().await;
        if report.is_aborted() {
            return Err(anyhow!("update run aborted: {}", report.outcome));
        }
        return Ok(());
    }

    info!(
        update_schedule = %config.update_schedule,
        backup_schedule = %config.backup_schedule,
        "updater daemon started"
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let backups = Arc::new(BackupManager::new(&config, Arc::clone(&clock)));
    let backup_loop = spawn_backup_loop(
        backups,
        config.backup_schedule,
        config.backup_retention,
        Arc::clone(&clock),
        config.poll_interval,
        shutdown_rx.clone(),
    );

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    run_daemon(
        orchestrator,
        config.update_schedule,
        clock,
        config.poll_interval,
        shutdown_rx,
    )
    .await;

    if let Err(err) = backup_loop.await {
        error!(error = %err, "backup loop terminated abnormally");
    }
    info!("updater daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "unable to install Ctrl+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "unable to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
