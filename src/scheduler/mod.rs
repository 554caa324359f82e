// =============================================================================
// Scheduler Module — background jobs with start / stop / status / run-now
// =============================================================================
//
// A `Job` is one unit of periodic work exposing `run_once()`. `JobHandle`
// owns the Tokio loop around it:
//
//   start()    spawn the loop (no-op if already running)
//   stop()     signal the loop to exit after the current tick
//   status()   counters + last report
//   run_now()  wake the running loop for an extra tick, or run one tick
//              inline when stopped
//
// Tick failures are logged and counted; they never stop the loop and never
// reach request-serving paths.
// =============================================================================

pub mod refresh;
pub mod warmup;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub use refresh::RefreshJob;
pub use warmup::WarmupJob;

/// Counters produced by one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub scanned: usize,
    pub triggered: usize,
    pub skipped_fresh: usize,
    pub skipped_in_flight: usize,
    /// Near-expiry keys left for the next tick by the per-tick cap.
    pub deferred: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub pruned: usize,
}

#[async_trait]
pub trait Job: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn interval(&self) -> Duration;
    async fn run_once(&self) -> anyhow::Result<TickReport>;
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub name: String,
    pub running: bool,
    pub interval_ms: u64,
    pub ticks: u64,
    pub failures: u64,
    pub last_tick_at: Option<String>,
    pub last_report: Option<TickReport>,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct Counters {
    ticks: u64,
    failures: u64,
    last_tick_at: Option<String>,
    last_report: Option<TickReport>,
    last_error: Option<String>,
}

struct Running {
    task: JoinHandle<()>,
    stop: Arc<Notify>,
}

pub struct JobHandle {
    job: Arc<dyn Job>,
    counters: Arc<Mutex<Counters>>,
    wake: Arc<Notify>,
    running: Mutex<Option<Running>>,
}

impl JobHandle {
    pub fn new(job: Arc<dyn Job>) -> Self {
        Self {
            job,
            counters: Arc::new(Mutex::new(Counters::default())),
            wake: Arc::new(Notify::new()),
            running: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.job.name()
    }

    fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Spawn the loop. Returns false when it was already running.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return false;
        }

        let job = self.job.clone();
        let counters = self.counters.clone();
        let wake = self.wake.clone();
        let stop = Arc::new(Notify::new());
        let stop_signal = stop.clone();
        // `interval` panics on a zero period.
        let period = job.interval().max(Duration::from_millis(1));

        info!(job = job.name(), interval_ms = period.as_millis() as u64, "job started");

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop_signal.notified() => break,
                    _ = ticker.tick() => {}
                    _ = wake.notified() => debug!(job = job.name(), "out-of-band tick"),
                }
                run_tick(job.as_ref(), &counters).await;
            }
            info!(job = job.name(), "job stopped");
        });
        *running = Some(Running { task, stop });
        true
    }

    /// Ask the loop to exit. Returns false when it was not running.
    pub fn stop(&self) -> bool {
        match self.running.lock().take() {
            Some(r) if !r.task.is_finished() => {
                r.stop.notify_one();
                true
            }
            _ => false,
        }
    }

    /// Force a cycle. When the loop is running it is woken and `None` is
    /// returned; otherwise the tick runs inline and its report is returned.
    pub async fn run_now(&self) -> Option<TickReport> {
        if self.is_running() {
            self.wake.notify_one();
            return None;
        }
        run_tick(self.job.as_ref(), &self.counters).await
    }

    pub fn status(&self) -> JobStatus {
        let c = self.counters.lock();
        JobStatus {
            name: self.job.name().to_string(),
            running: self.is_running(),
            interval_ms: self.job.interval().as_millis() as u64,
            ticks: c.ticks,
            failures: c.failures,
            last_tick_at: c.last_tick_at.clone(),
            last_report: c.last_report.clone(),
            last_error: c.last_error.clone(),
        }
    }
}

async fn run_tick(job: &dyn Job, counters: &Mutex<Counters>) -> Option<TickReport> {
    let result = job.run_once().await;

    let mut c = counters.lock();
    c.ticks += 1;
    c.last_tick_at = Some(Utc::now().to_rfc3339());
    match result {
        Ok(report) => {
            debug!(
                job = job.name(),
                scanned = report.scanned,
                triggered = report.triggered,
                failed = report.failed,
                "job tick complete"
            );
            c.last_report = Some(report.clone());
            c.last_error = None;
            Some(report)
        }
        Err(e) => {
            c.failures += 1;
            warn!(job = job.name(), error = %e, failures = c.failures, "job tick failed");
            c.last_error = Some(e.to_string());
            None
        }
    }
}
