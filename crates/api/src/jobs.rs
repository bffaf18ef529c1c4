//! Periodic background jobs: retry queue drain and the full reconciliation sweep.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use store::Store;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::AppState;
use crate::config::Config;

/// Spawns the scheduled jobs. They stop when `shutdown` flips to `true`.
pub fn spawn<S: Store + Clone>(
    state: Arc<AppState<S>>,
    config: &Config,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let drain_state = state.clone();
    let drain = tokio::spawn(run_periodic(
        "retry_drain",
        config.retry_drain_interval,
        shutdown.clone(),
        move || {
            let state = drain_state.clone();
            async move {
                if let Err(e) = state.queue.process_pending_tasks(state.retry_batch_size).await {
                    tracing::error!(error = %e, "retry queue drain failed");
                }
            }
        },
    ));

    let sweep = tokio::spawn(run_periodic(
        "reconciliation_sweep",
        config.reconciliation_interval,
        shutdown,
        move || {
            let state = state.clone();
            async move {
                if let Err(e) = state.sweep.run_full_sweep().await {
                    tracing::error!(error = %e, "reconciliation sweep failed");
                }
            }
        },
    ));

    vec![drain, sweep]
}

/// Runs `job` every `period`, starting one period from now.
async fn run_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut job: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!(job = name, period_secs = period.as_secs(), "scheduled job started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                tracing::debug!(job = name, "scheduled job running");
                job().await;
                metrics::counter!("scheduled_job_runs_total", "job" => name).increment(1);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::info!(job = name, "scheduled job stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_job_runs_each_period_until_shutdown() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = watch::channel(false);
        let counter = runs.clone();
        let handle = tokio::spawn(run_periodic("test", Duration::from_secs(10), rx, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        tokio::time::sleep(Duration::from_secs(25)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
