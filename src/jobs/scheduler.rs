//! Background sweep scheduler
//!
//! `Stopped -> Waiting -> Running -> Waiting -> ... -> Stopped`
//!
//! The next fire time is measured from the end of the previous sweep, so a
//! slow sweep shifts the whole schedule instead of causing catch-up runs. A
//! tick whose sweep was skipped (a manual sweep held the lock) still counts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::search_sweep::{SkipReason, SweepResult, SweepRunner};
use crate::services::manager::{Service, ServiceHealth};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerPhase {
    Stopped,
    Waiting,
    Running,
}

/// Snapshot of the scheduler, exposed on `/status`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerState {
    pub phase: SchedulerPhase,
    pub interval_hours: f64,
    pub run_on_startup: bool,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub last_skip_reason: Option<SkipReason>,
    /// Completed ticks since start
    pub ticks: u64,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub run_on_startup: bool,
}

struct SchedulerRuntime {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Scheduler {
    runner: Arc<dyn SweepRunner>,
    config: SchedulerConfig,
    state: Arc<RwLock<SchedulerState>>,
    /// Process-wide token; the loop runs on a child of it
    shutdown: CancellationToken,
    runtime: Mutex<Option<SchedulerRuntime>>,
}

impl Scheduler {
    pub fn new(
        runner: Arc<dyn SweepRunner>,
        config: SchedulerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let state = SchedulerState {
            phase: SchedulerPhase::Stopped,
            interval_hours: config.interval.as_secs_f64() / 3600.0,
            run_on_startup: config.run_on_startup,
            next_fire_at: None,
            last_started_at: None,
            last_completed_at: None,
            last_skip_reason: None,
            ticks: 0,
        };
        Self {
            runner,
            config,
            state: Arc::new(RwLock::new(state)),
            shutdown,
            runtime: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state.read().clone()
    }

    pub fn is_started(&self) -> bool {
        self.runtime.lock().is_some()
    }

    /// Spawn the scheduler loop. Returns false if it is already running.
    pub fn start(&self) -> bool {
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            warn!(service = "scheduler", "Scheduler is already running");
            return false;
        }

        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(run_loop(
            self.runner.clone(),
            self.config.clone(),
            self.state.clone(),
            cancel.clone(),
        ));
        *runtime = Some(SchedulerRuntime { cancel, handle });

        info!(
            service = "scheduler",
            interval_hours = self.config.interval.as_secs_f64() / 3600.0,
            run_on_startup = self.config.run_on_startup,
            "Started search scheduler"
        );
        true
    }

    /// Cancel the timer (and any running sweep's wait) and join the loop
    pub async fn shutdown(&self) {
        let runtime = self.runtime.lock().take();
        let Some(runtime) = runtime else {
            return;
        };
        runtime.cancel.cancel();
        if let Err(e) = runtime.handle.await {
            warn!(service = "scheduler", error = %e, "Scheduler task ended abnormally");
            self.state.write().phase = SchedulerPhase::Stopped;
        }
        info!(service = "scheduler", "Stopped search scheduler");
    }
}

async fn run_loop(
    runner: Arc<dyn SweepRunner>,
    config: SchedulerConfig,
    state: Arc<RwLock<SchedulerState>>,
    cancel: CancellationToken,
) {
    let mut fire_now = config.run_on_startup;
    if fire_now {
        info!(service = "scheduler", "Running initial search on startup");
    }

    loop {
        if !fire_now {
            let deadline = tokio::time::Instant::now() + config.interval;
            let next_fire_at = chrono::Duration::from_std(config.interval)
                .ok()
                .and_then(|d| Utc::now().checked_add_signed(d));
            {
                let mut s = state.write();
                s.phase = SchedulerPhase::Waiting;
                s.next_fire_at = next_fire_at;
            }
            info!(
                service = "scheduler",
                next_fire_at = ?next_fire_at,
                "Next scheduled search in {} hours",
                config.interval.as_secs_f64() / 3600.0
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
        fire_now = false;

        {
            let mut s = state.write();
            s.phase = SchedulerPhase::Running;
            s.next_fire_at = None;
            s.last_started_at = Some(Utc::now());
        }
        info!(service = "scheduler", "Triggering scheduled search");

        let result = runner.run_sweep(cancel.clone()).await;
        log_tick(&result);

        {
            let mut s = state.write();
            s.last_completed_at = Some(Utc::now());
            s.last_skip_reason = result.reason;
            s.ticks += 1;
        }

        if cancel.is_cancelled() {
            break;
        }
    }

    let mut s = state.write();
    s.phase = SchedulerPhase::Stopped;
    s.next_fire_at = None;
}

fn log_tick(result: &SweepResult) {
    let blocklisted = result
        .stalled_downloads
        .as_ref()
        .map(|r| r.blocklisted_count)
        .unwrap_or_default();
    match result.reason {
        Some(SkipReason::AlreadyRunning) => info!(
            service = "scheduler",
            "Scheduled search skipped, a manual search is already running"
        ),
        Some(reason) => warn!(
            service = "scheduler",
            reason = %reason,
            blocklisted,
            "Scheduled search skipped: {}",
            reason
        ),
        None => info!(
            service = "scheduler",
            missing = result.count,
            searched = result.searched_count,
            blocklisted,
            cancelled = result.cancelled,
            "Scheduled search finished: {} missing items searched, {} stalled downloads blocklisted",
            result.searched_count,
            blocklisted
        ),
    }
}

#[async_trait]
impl Service for Scheduler {
    fn name(&self) -> &str {
        "scheduler"
    }

    async fn start(&self) -> Result<()> {
        Scheduler::start(self);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.shutdown().await;
        Ok(())
    }

    async fn health(&self) -> Result<ServiceHealth> {
        let finished = self
            .runtime
            .lock()
            .as_ref()
            .map(|r| r.handle.is_finished());
        Ok(match finished {
            Some(false) => ServiceHealth::healthy(),
            Some(true) => ServiceHealth::unhealthy("scheduler loop exited"),
            None => ServiceHealth::degraded("scheduler not started"),
        })
    }
}
