//! Interval scheduler for the recurring tasks.
//!
//! One worker per task name. A tick that finds the previous run still going
//! gets `TaskAlreadyRunning` from the coordinator and is skipped; nothing is
//! retried inside a tick.

use std::time::Duration;

use tally_common::{TallyError, TaskName};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use crate::state::AppState;
use crate::tasks;

/// Spawn a worker for every task
pub fn spawn_all(
    state: &AppState,
    shutdown: &broadcast::Sender<()>,
) -> Vec<tokio::task::JoinHandle<()>> {
    TaskName::ALL
        .into_iter()
        .map(|task| {
            let state = state.clone();
            let shutdown = shutdown.subscribe();
            tokio::spawn(async move { task_worker(state, task, shutdown).await })
        })
        .collect()
}

fn interval_for(state: &AppState, task: TaskName) -> Duration {
    let secs = match task {
        TaskName::RecalculateSolutions => state.config.schedule.recalculate_interval_secs,
        TaskName::StoreCommitmentsExternal => state.config.schedule.export_interval_secs,
    };
    Duration::from_secs(secs)
}

/// Run `task` every interval until shutdown
pub async fn task_worker(
    state: AppState,
    task: TaskName,
    mut shutdown: broadcast::Receiver<()>,
) {
    let period = interval_for(&state, task);
    tracing::info!(task = %task, interval_secs = period.as_secs(), "Task worker started");

    let start = if state.config.schedule.run_on_start {
        tokio::time::Instant::now()
    } else {
        tokio::time::Instant::now() + period
    };
    let mut ticker = tokio::time::interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_once(&state, task).await;
            }
            _ = shutdown.recv() => {
                tracing::info!(task = %task, "Task worker shutting down...");
                break;
            }
        }
    }
}

/// One scheduled tick. Errors are already on the task record, so only log.
async fn run_once(state: &AppState, task: TaskName) {
    match tasks::run_task(state, task).await {
        Ok(_) => {}
        Err(TallyError::TaskAlreadyRunning(_)) => {
            tracing::warn!(task = %task, "Previous run still active, skipping tick");
        }
        Err(e) => {
            tracing::error!(
                task = %task,
                error = %e,
                retryable = e.is_retryable(),
                "Scheduled run failed"
            );
        }
    }
}
