use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use workload_autoscaler::{AutoscaleError, Config, Group, GroupOptions, PlanPrinter, Snapshot};

/// Loads the current files, builds the group and applies its changes.
async fn run_pass(cli: &Config) -> Result<(), AutoscaleError> {
    let mut options = GroupOptions::load(&cli.options)?;
    if cli.dry_run {
        options.dry_run = true;
    }
    let snapshot = Snapshot::load(&cli.snapshot)?;
    let group = Group::build(
        cli.group.as_str(),
        options,
        &snapshot.workers,
        &snapshot.requirements,
        Arc::new(PlanPrinter),
        Arc::new(snapshot.catalog),
    )?;
    let report = group.apply(cli.max_wait()).await;
    if report.timed_out {
        info!(group = cli.group.as_str(), "Stopped waiting for dispatched changes");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), AutoscaleError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Config::parse();

    if !cli.daemon {
        return run_pass(&cli).await;
    }

    info!(group = cli.group.as_str(), poll_period = cli.poll_period, "Running in daemon mode");
    let period = Duration::from_secs(cli.poll_period);
    loop {
        // a failed pass only cancels this pass
        if let Err(e) = run_pass(&cli).await {
            error!(group = cli.group.as_str(), error = %e, "group canceled");
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            _ = tokio::time::sleep(period) => {}
        }
    }
    Ok(())
}
