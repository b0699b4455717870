// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::*;

use crate::semaphore::WaitError;
use crate::tracked::Tracked;

/// How often `wait` re-inspects the state.
const WAIT_POLL: Duration = Duration::from_millis(50);

/// Progress deltas below this are not worth a notification.
const PROGRESS_EPSILON: f64 = 0.01;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Initializing,
    Pending,
    Finished,
    Stopped,
    Error,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobState::Initializing | JobState::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Initializing => "Initializing",
            JobState::Pending => "Pending",
            JobState::Finished => "Finished",
            JobState::Stopped => "Stopped",
            JobState::Error => "Error",
        }
    }
}

/// Why the notify callback fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Notify {
    StateChanged,
    Progress,
}

pub type NotifyFn = Box<dyn Fn(Notify, &Job) + Send + Sync>;

struct Inner {
    title: String,
    state: Mutex<JobState>,
    progress: Mutex<f64>,
    error_code: AtomicI32,
    notify: Option<NotifyFn>,
    tracked: Tracked,
}

/// A background worker wrapped in a small state machine.
///
/// Construction spawns the worker thread, which moves the job to `Pending`
/// and runs the supplied function. The function owns the terminal transition:
/// `Finished` on success, `Error` on failure; it is also expected to watch
/// for an advisory [`Job::cancel`] (state `Stopped`) and bail out.
///
/// Handles are cheap clones; the job lives until the last handle (including
/// the worker's own) is gone.
#[derive(Clone)]
pub struct Job {
    inner: Arc<Inner>,
}

impl Job {
    /// Spawn a job running `worker` on its own thread.
    ///
    /// An empty title gets a generated one. `notify` fires on every state
    /// transition and on progress movement.
    pub fn spawn(
        title: &str,
        notify: Option<NotifyFn>,
        worker: impl FnOnce(&Job) + Send + 'static,
    ) -> Job {
        static ANONYMOUS: AtomicU64 = AtomicU64::new(1);

        let tracked = Tracked::new("Job");

        let title = if title.is_empty() {
            format!("anonymous job #{}", ANONYMOUS.fetch_add(1, Ordering::Relaxed))
        } else {
            title.to_string()
        };

        let job = Job {
            inner: Arc::new(Inner {
                title,
                state: Mutex::new(JobState::Initializing),
                progress: Mutex::new(0.0),
                error_code: AtomicI32::new(0),
                notify,
                tracked,
            }),
        };

        job.notify(Notify::StateChanged);

        let worker_handle = job.clone();
        thread::Builder::new()
            .name(format!("job: {}", job.title()))
            .spawn(move || {
                worker_handle.set_state(JobState::Pending);
                worker(&worker_handle);
            })
            .expect("failed to spawn job worker thread");

        job
    }

    pub fn title(&self) -> &str {
        &self.inner.title
    }

    pub fn state(&self) -> JobState {
        match self.inner.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Move the state machine and fire the notify callback.
    pub fn set_state(&self, state: JobState) {
        self.inner.tracked.assert_live();

        {
            let mut guard = match self.inner.state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = state;
        }

        match state {
            JobState::Finished => info!("{}: finished with success", self.title()),
            JobState::Stopped => info!("{}: stopped", self.title()),
            JobState::Error => info!("{}: finished with error", self.title()),
            _ => debug!("{}: changed state to {}", self.title(), state.as_str()),
        }

        self.notify(Notify::StateChanged);
    }

    /// Ask the worker to stop. Advisory: the worker function must observe
    /// the `Stopped` state (see [`Job::is_cancelled`]) and return.
    pub fn cancel(&self) {
        self.set_state(JobState::Stopped);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == JobState::Stopped
    }

    /// Block until the job reaches a terminal state, polling every 50 ms.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<(), WaitError> {
        let mut left = timeout;

        while !self.state().is_terminal() {
            thread::sleep(WAIT_POLL);

            if let Some(budget) = left {
                let budget = budget.saturating_sub(WAIT_POLL);
                if budget.is_zero() {
                    error!("timeout while waiting for job '{}'", self.title());
                    return Err(WaitError::Timeout);
                }
                left = Some(budget);
            }
        }

        Ok(())
    }

    pub fn progress(&self) -> f64 {
        match self.inner.progress.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Update the completion meter (0-100). Notifies only when the value
    /// actually moved.
    pub fn set_progress(&self, percent: f64) {
        let moved = {
            let mut guard = match self.inner.progress.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let moved = (*guard - percent).abs() > PROGRESS_EPSILON;
            *guard = percent;
            moved
        };

        if moved {
            self.notify(Notify::Progress);
        }
    }

    pub fn error_code(&self) -> i32 {
        self.inner.error_code.load(Ordering::Relaxed)
    }

    /// Out-of-band detail for the `Error` state.
    pub fn set_error_code(&self, code: i32) {
        self.inner.error_code.store(code, Ordering::Relaxed);
    }

    fn notify(&self, why: Notify) {
        if let Some(callback) = &self.inner.notify {
            callback(why, self);
        }
    }
}
