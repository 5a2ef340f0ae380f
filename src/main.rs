//! Searcherr entry point
//!
//! Wires the media manager client, disk probe and sweep orchestrator
//! together, registers the scheduler and HTTP services and runs until
//! Ctrl-C or SIGTERM.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use searcherr::app::AppState;
use searcherr::config::{Config, DiskSpaceSource};
use searcherr::jobs::{
    Scheduler, SchedulerConfig, SearchSweepOrchestrator, StalledDownloadDetector, SweepRunState,
    SweepSettings,
};
use searcherr::services::logging::init_tracing;
use searcherr::services::{
    ArrClient, DiskSpaceProbe, HttpServerService, LocalDiskProbe, MediaManager, ServicesManager,
    UpstreamDiskProbe,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = Arc::new(Config::from_env()?);
    init_tracing(&config)?;

    tracing::info!(
        media_manager = config.media_manager.as_str(),
        url = %config.media_manager_url,
        "Starting Searcherr"
    );
    for var in &config.deprecated_vars {
        tracing::warn!(
            variable = var,
            "{} is deprecated and ignored; use SCHEDULER_INTERVAL_HOURS",
            var
        );
    }

    let shutdown = CancellationToken::new();

    let client = Arc::new(ArrClient::from_config(&config)?);
    let manager: Arc<dyn MediaManager> = client.clone();
    let disk_probe: Arc<dyn DiskSpaceProbe> = match config.disk_space_source {
        DiskSpaceSource::Local => Arc::new(LocalDiskProbe::new(config.disk_probe_timeout)),
        DiskSpaceSource::Upstream => Arc::new(UpstreamDiskProbe::new(
            client.clone(),
            config.disk_probe_timeout,
        )),
    };

    let detector = StalledDownloadDetector::new(manager.clone(), config.stalled_threshold_hours);
    let orchestrator = Arc::new(SearchSweepOrchestrator::new(
        detector,
        manager,
        disk_probe,
        SweepRunState::new(),
        SweepSettings {
            library_path: config.library_path.clone(),
            min_free_space_gb: config.min_free_space_gb,
            search_delay: config.search_delay(),
        },
        shutdown.clone(),
    ));

    let services = Arc::new(ServicesManager::new());

    let scheduler = if config.enable_scheduler {
        let scheduler = Arc::new(Scheduler::new(
            orchestrator.clone(),
            SchedulerConfig {
                interval: config.scheduler_interval(),
                run_on_startup: config.scheduler_run_on_startup,
            },
            shutdown.clone(),
        ));
        services.register(scheduler.clone()).await;
        Some(scheduler)
    } else {
        tracing::info!("Scheduler disabled, searches run only on POST /search");
        None
    };

    let state = AppState {
        config: config.clone(),
        orchestrator,
        scheduler,
        services: services.clone(),
        shutdown: shutdown.clone(),
        sweeps: TaskTracker::new(),
    };
    services
        .register(Arc::new(HttpServerService::new(state)))
        .await;

    services.start_all().await?;

    wait_for_signal().await;
    tracing::info!("Shutdown signal received, stopping services");

    shutdown.cancel();
    services.stop_all().await?;

    tracing::info!("Searcherr stopped");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
