use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Body of a periodic job
pub type PeriodicTask = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Runs background work on a fixed cadence
pub trait JobScheduler: Send + Sync {
    /// Run `task` every `period`, first after one full period. A run never
    /// overlaps the previous run of the same job.
    fn schedule(&self, name: &str, period: Duration, task: PeriodicTask) -> PeriodicJob;
}

/// Handle for one scheduled job
pub struct PeriodicJob {
    name: String,
    cancel: CancellationToken,
    join_handle: Option<JoinHandle<()>>,
}

impl PeriodicJob {
    pub fn new<S: Into<String>>(name: S, cancel: CancellationToken, join_handle: Option<JoinHandle<()>>) -> Self {
        Self {
            name: name.into(),
            cancel,
            join_handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop future runs; an in-flight run completes
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel and wait for an in-flight run to finish
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.join_handle.take() {
            if let Err(e) = handle.await {
                debug!("periodic job {} ended abnormally: {}", self.name, e);
            }
        }
    }
}

/// Scheduler backed by tokio tasks
#[derive(Debug, Clone, Default)]
pub struct TokioJobScheduler;

impl TokioJobScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl JobScheduler for TokioJobScheduler {
    fn schedule(&self, name: &str, period: Duration, task: PeriodicTask) -> PeriodicJob {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let job_name = name.to_string();

        info!("Scheduling {} every {:?}", job_name, period);

        let join_handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        debug!("Running {}", job_name);
                        (task)().await;
                    }
                }
            }
            debug!("{} stopped", job_name);
        });

        PeriodicJob::new(name, cancel, Some(join_handle))
    }
}

/// Scheduler that never runs anything; jobs are driven by hand (for testing)
#[derive(Debug, Clone, Default)]
pub struct ManualJobScheduler {
    scheduled: Arc<parking_lot::Mutex<Vec<(String, Duration, CancellationToken)>>>,
}

impl ManualJobScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of jobs that are scheduled and not cancelled
    pub fn active_jobs(&self) -> Vec<String> {
        self.scheduled
            .lock()
            .iter()
            .filter(|(_, _, token)| !token.is_cancelled())
            .map(|(name, _, _)| name.clone())
            .collect()
    }

    pub fn period_of(&self, name: &str) -> Option<Duration> {
        self.scheduled
            .lock()
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, period, _)| *period)
    }
}

impl JobScheduler for ManualJobScheduler {
    fn schedule(&self, name: &str, period: Duration, _task: PeriodicTask) -> PeriodicJob {
        let cancel = CancellationToken::new();
        self.scheduled
            .lock()
            .push((name.to_string(), period, cancel.clone()));
        PeriodicJob::new(name, cancel, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn job_runs_each_period_until_cancelled() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let task: PeriodicTask = Arc::new(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        });

        let job = TokioJobScheduler::new().schedule("tick", Duration::from_secs(5), task);

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        job.shutdown().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn manual_scheduler_tracks_cancellation() {
        let scheduler = ManualJobScheduler::new();
        let task: PeriodicTask = Arc::new(|| async {}.boxed());
        let job = scheduler.schedule("flush", Duration::from_secs(5), task);

        assert_eq!(scheduler.active_jobs(), vec!["flush".to_string()]);
        assert_eq!(scheduler.period_of("flush"), Some(Duration::from_secs(5)));

        job.cancel();
        assert!(scheduler.active_jobs().is_empty());
    }
}
