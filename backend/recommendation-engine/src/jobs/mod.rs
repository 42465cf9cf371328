//! Background jobs
//!
//! One loop per job kind, driven by `tokio::time::interval`. Each tick runs
//! the job under a timeout; a failed or timed-out run is retried on the next
//! tick, with backoff after repeated failures. Every job is idempotent and
//! publishes its result atomically, so an abandoned run leaves nothing
//! half-visible.

pub mod clustering;
pub mod model_snapshot;
pub mod similarity_rebuild;

pub use clustering::ClusteringJob;
pub use model_snapshot::ModelSnapshotJob;
pub use similarity_rebuild::SimilarityRebuildJob;

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

/// Failures in a row before backoff kicks in
const BACKOFF_AFTER: u32 = 3;
const MAX_BACKOFF_EXPONENT: u32 = 5;

#[async_trait]
pub trait ScheduledJob: Send + Sync {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    async fn run(&self) -> Result<()>;

    /// Called after a run exceeded the timeout and was dropped
    fn on_timeout(&self) {}
}

/// Outcome of one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Completed,
    /// Another instance holds the job; not a failure
    Skipped,
    Failed,
    TimedOut,
}

/// Run `job` once under `timeout`
pub async fn run_once(job: &dyn ScheduledJob, timeout: Duration) -> TickOutcome {
    let start = Instant::now();
    info!(job_name = job.name(), "Starting job run");

    match tokio::time::timeout(timeout, job.run()).await {
        Ok(Ok(())) => {
            info!(
                job_name = job.name(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Job run completed"
            );
            TickOutcome::Completed
        }
        Ok(Err(EngineError::JobAlreadyRunning(_))) => {
            info!(job_name = job.name(), "Job already running elsewhere, skipping tick");
            TickOutcome::Skipped
        }
        Ok(Err(e)) => {
            error!(job_name = job.name(), error = %e, "Job run failed");
            TickOutcome::Failed
        }
        Err(_) => {
            warn!(
                job_name = job.name(),
                timeout_secs = timeout.as_secs(),
                "Job run timed out, will retry on next interval"
            );
            job.on_timeout();
            TickOutcome::TimedOut
        }
    }
}

/// Timed loop for one job; exits when `shutdown` flips to true
pub async fn run_job_loop(job: Arc<dyn ScheduledJob>, timeout: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut timer = interval(job.interval());
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut consecutive_failures = 0u32;

    info!(
        job_name = job.name(),
        interval_secs = job.interval().as_secs(),
        "Starting job loop"
    );

    loop {
        tokio::select! {
            _ = timer.tick() => {
                match run_once(job.as_ref(), timeout).await {
                    TickOutcome::Completed | TickOutcome::Skipped => {
                        if consecutive_failures > 0 {
                            info!(
                                job_name = job.name(),
                                recovered_after = consecutive_failures,
                                "Job recovered after failures"
                            );
                            consecutive_failures = 0;
                        }
                    }
                    TickOutcome::Failed | TickOutcome::TimedOut => {
                        consecutive_failures += 1;
                        if consecutive_failures >= BACKOFF_AFTER {
                            let backoff_secs = 2u64.pow(consecutive_failures.min(MAX_BACKOFF_EXPONENT));
                            info!(
                                job_name = job.name(),
                                backoff_secs = backoff_secs,
                                consecutive_failures = consecutive_failures,
                                "Applying backoff after consecutive failures"
                            );
                            tokio::select! {
                                _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                                _ = shutdown.changed() => break,
                            }
                        }
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(job_name = job.name(), "Received shutdown signal, stopping job loop");
                    break;
                }
            }
        }
    }

    info!(job_name = job.name(), "Job loop stopped");
}

/// Owns the job loops and their shutdown channel
pub struct JobScheduler {
    jobs: Vec<Arc<dyn ScheduledJob>>,
    timeout: Duration,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl JobScheduler {
    pub fn new(timeout: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            jobs: Vec::new(),
            timeout,
            shutdown,
            handles: Vec::new(),
        }
    }

    pub fn register(&mut self, job: Arc<dyn ScheduledJob>) -> &mut Self {
        self.jobs.push(job);
        self
    }

    pub fn job_names(&self) -> Vec<&'static str> {
        self.jobs.iter().map(|j| j.name()).collect()
    }

    /// Spawn one loop per registered job
    pub fn start(&mut self) {
        for job in &self.jobs {
            let rx = self.shutdown.subscribe();
            self.handles
                .push(tokio::spawn(run_job_loop(job.clone(), self.timeout, rx)));
        }
        info!(jobs = self.jobs.len(), "Job scheduler started");
    }

    /// Signal every loop and wait for them to finish their current tick
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Job loop panicked");
            }
        }
        info!("Job scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct CountingJob {
        runs: AtomicUsize,
        delay: Duration,
        fail: bool,
        timed_out: AtomicBool,
    }

    impl CountingJob {
        fn new(delay: Duration, fail: bool) -> Self {
            Self {
                runs: AtomicUsize::new(0),
                delay,
                fail,
                timed_out: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ScheduledJob for CountingJob {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn run(&self) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                Err(EngineError::InsufficientData("nothing to do".into()))
            } else {
                Ok(())
            }
        }

        fn on_timeout(&self) {
            self.timed_out.store(true, Ordering::SeqCst);
        }
    }

    struct LockedJob;

    #[async_trait]
    impl ScheduledJob for LockedJob {
        fn name(&self) -> &'static str {
            "locked"
        }

        fn interval(&self) -> Duration {
            Duration::from_secs(60)
        }

        async fn run(&self) -> Result<()> {
            Err(EngineError::JobAlreadyRunning("locked".into()))
        }
    }

    #[tokio::test]
    async fn test_run_once_outcomes() {
        let ok = CountingJob::new(Duration::ZERO, false);
        assert_eq!(run_once(&ok, Duration::from_secs(1)).await, TickOutcome::Completed);

        let failing = CountingJob::new(Duration::ZERO, true);
        assert_eq!(run_once(&failing, Duration::from_secs(1)).await, TickOutcome::Failed);

        assert_eq!(run_once(&LockedJob, Duration::from_secs(1)).await, TickOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_timeout_calls_hook() {
        let slow = CountingJob::new(Duration::from_secs(5), false);
        let outcome = run_once(&slow, Duration::from_millis(20)).await;
        assert_eq!(outcome, TickOutcome::TimedOut);
        assert!(slow.timed_out.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_scheduler_runs_and_stops() {
        let job = Arc::new(CountingJob::new(Duration::ZERO, false));
        let mut scheduler = JobScheduler::new(Duration::from_secs(1));
        scheduler.register(job.clone());
        assert_eq!(scheduler.job_names(), vec!["counting"]);

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.shutdown().await;

        let runs = job.runs.load(Ordering::SeqCst);
        assert!(runs >= 1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), runs);
    }
}
