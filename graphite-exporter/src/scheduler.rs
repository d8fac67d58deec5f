//! Periodic execution of refresh jobs.
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::jobs::{Job, JobFn};

/// Runs callbacks on a fixed interval.
pub trait Scheduler {
    /// Runs `job` now, and then every `interval`.
    fn every(&self, name: &str, interval: Duration, job: JobFn);

    /// Schedules every job at its own interval.
    fn schedule_all(&self, jobs: Vec<Job>) {
        for job in jobs {
            let interval = job.interval();
            self.every(&job.name, interval, job.callback);
        }
    }
}

/// A [`Scheduler`] running each job in its own Tokio task.
///
/// A job is never run concurrently with itself: if a run takes longer than the interval, the next
/// run starts as soon as it finishes and later runs are pushed back accordingly.
pub struct TokioScheduler {
    handle: Handle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TokioScheduler {
    /// Creates a scheduler spawning its tasks on `handle`.
    pub fn new(handle: Handle) -> Self {
        Self { handle, tasks: Mutex::new(Vec::new()) }
    }

    /// Number of scheduled jobs.
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Whether no job has been scheduled.
    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Stops every scheduled job. Runs that are in flight are cancelled.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Scheduler for TokioScheduler {
    fn every(&self, name: &str, interval: Duration, job: JobFn) {
        if interval.is_zero() {
            warn!(job = name, "refusing to schedule job with a zero interval");
            return;
        }

        let name = name.to_owned();
        let task = self.handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                debug!(job = %name, "running job");
                job().await;
            }
        });

        self.tasks.lock().push(task);
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
