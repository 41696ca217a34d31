//! Periodic background jobs.
//!
//! CAs register their maintenance jobs with a [`Scheduler`]. The daemon
//! uses the [`TokioScheduler`], tests use the [`ManualScheduler`] to run
//! jobs exactly when they want to.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// A job run by a scheduler. Jobs deal with their own errors.
pub type Job = Arc<dyn Fn() + Send + Sync>;

//------------ Scheduler -----------------------------------------------------

pub trait Scheduler: Send + Sync {
    /// Runs `job` after `initial_delay` and then every `period`.
    ///
    /// A run that is due while the previous run is still going is skipped.
    fn schedule(&self, name: &str, initial_delay: Duration, period: Duration, job: Job) -> JobHandle;
}

//------------ JobHandle -----------------------------------------------------

/// Cancels a scheduled job. Dropping the handle leaves the job running.
pub struct JobHandle {
    name: String,
    cancel: Box<dyn FnOnce() + Send>,
}

impl JobHandle {
    pub fn new(name: &str, cancel: impl FnOnce() + Send + 'static) -> Self {
        JobHandle {
            name: name.to_string(),
            cancel: Box::new(cancel),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel(self) {
        debug!("Cancelling background job '{}'", self.name);
        (self.cancel)()
    }
}

//------------ TokioScheduler ------------------------------------------------

/// Runs jobs on a tokio runtime, each run as a blocking task.
#[derive(Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        TokioScheduler { handle }
    }

    /// Uses the runtime of the current context. Panics outside a runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, name: &str, initial_delay: Duration, period: Duration, job: Job) -> JobHandle {
        let job_name = name.to_string();
        let handle = self.handle.clone();
        let task = self.handle.spawn(async move {
            tokio::time::sleep(initial_delay).await;

            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            let mut running: Option<JoinHandle<()>> = None;
            loop {
                ticker.tick().await;
                if running.as_ref().map(|run| !run.is_finished()).unwrap_or(false) {
                    warn!("Previous background job '{job_name}' is still running, will skip");
                    continue;
                }
                let job = job.clone();
                running = Some(handle.spawn_blocking(move || job()));
            }
        });

        JobHandle::new(name, move || task.abort())
    }
}

//------------ ManualScheduler -----------------------------------------------

/// Keeps jobs until they are run explicitly.
#[derive(Default)]
pub struct ManualScheduler {
    jobs: Mutex<Vec<ManualJob>>,
}

struct ManualJob {
    name: String,
    initial_delay: Duration,
    period: Duration,
    job: Job,
    cancelled: Arc<AtomicBool>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs every live job with the given name, returns how many ran.
    pub fn run(&self, name: &str) -> usize {
        let jobs: Vec<Job> = self
            .jobs
            .lock()
            .expect("poisoned lock")
            .iter()
            .filter(|job| job.name == name && !job.cancelled.load(Ordering::SeqCst))
            .map(|job| job.job.clone())
            .collect();
        for job in &jobs {
            job();
        }
        jobs.len()
    }

    /// Names of all jobs that have not been cancelled.
    pub fn job_names(&self) -> Vec<String> {
        self.jobs
            .lock()
            .expect("poisoned lock")
            .iter()
            .filter(|job| !job.cancelled.load(Ordering::SeqCst))
            .map(|job| job.name.clone())
            .collect()
    }

    /// Initial delay and period of a live job.
    pub fn timing(&self, name: &str) -> Option<(Duration, Duration)> {
        self.jobs
            .lock()
            .expect("poisoned lock")
            .iter()
            .find(|job| job.name == name && !job.cancelled.load(Ordering::SeqCst))
            .map(|job| (job.initial_delay, job.period))
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, name: &str, initial_delay: Duration, period: Duration, job: Job) -> JobHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.jobs.lock().expect("poisoned lock").push(ManualJob {
            name: name.to_string(),
            initial_delay,
            period,
            job,
            cancelled: cancelled.clone(),
        });
        JobHandle::new(name, move || cancelled.store(true, Ordering::SeqCst))
    }
}

//------------ RunFlag -------------------------------------------------------

/// Makes sure that only one run of something happens at a time.
///
/// Contenders do not wait: [`RunFlag::try_run`] returns `None` while
/// another run holds the flag.
#[derive(Debug, Default)]
pub struct RunFlag {
    running: AtomicBool,
}

impl RunFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_run(&self) -> Option<RunGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard { flag: self })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Releases its [`RunFlag`] when dropped.
pub struct RunGuard<'a> {
    flag: &'a RunFlag,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.running.store(false, Ordering::Release);
    }
}

//------------ Tests ---------------------------------------------------------
