// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use log::*;

/// The ways a timed wait can come back without acquiring.
#[derive(Debug, PartialEq, Eq)]
pub enum WaitError {
    /// The timeout elapsed before the counter became non-zero.
    Timeout,

    /// A thread panicked while holding the internal lock. This is the
    /// "system error" arm: the counter value can no longer be trusted.
    Poisoned,
}

impl std::error::Error for WaitError {}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timed out waiting for semaphore"),
            Self::Poisoned => write!(f, "semaphore lock poisoned"),
        }
    }
}

/// A counting semaphore: a non-negative counter where `wait` blocks until it
/// can decrement and `signal` increments, waking one waiter.
///
/// The name is carried for diagnostics only; it appears in log output and
/// nowhere else.
pub struct Semaphore {
    name: String,
    count: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: u32, name: &str) -> Semaphore {
        trace!("created semaphore '{name}' with initial count {initial}");

        Semaphore {
            name: name.to_string(),
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until the counter is non-zero, then decrement it.
    ///
    /// `timeout` of `None` waits forever. With a timeout the wait tracks a
    /// deadline, so spurious wakeups do not extend it.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<(), WaitError> {
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut count = self.count.lock().map_err(|_| WaitError::Poisoned)?;

        while *count == 0 {
            match deadline {
                None => {
                    count = self.cond.wait(count).map_err(|_| WaitError::Poisoned)?;
                }
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        debug!("semaphore '{}': wait timed out", self.name);
                        return Err(WaitError::Timeout);
                    }

                    let (guard, result) = self
                        .cond
                        .wait_timeout(count, left)
                        .map_err(|_| WaitError::Poisoned)?;
                    count = guard;

                    if result.timed_out() && *count == 0 {
                        debug!("semaphore '{}': wait timed out", self.name);
                        return Err(WaitError::Timeout);
                    }
                }
            }
        }

        *count -= 1;
        Ok(())
    }

    /// Increment the counter and wake one waiter.
    pub fn signal(&self) {
        let mut count = match self.count.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        *count += 1;
        self.cond.notify_one();
    }

    /// Decrement without blocking. Returns whether a unit was taken.
    pub fn try_wait(&self) -> bool {
        let mut count = match self.count.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if *count == 0 {
            return false;
        }

        *count -= 1;
        true
    }

    /// Drain the counter to zero, returning how many units were taken.
    pub fn unwind(&self) -> u32 {
        let mut count = match self.count.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let drained = *count;
        *count = 0;

        if drained > 0 {
            debug!("semaphore '{}': unwound {drained} units", self.name);
        }

        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn signalled_wait_returns() {
        let sem = Arc::new(Semaphore::new(0, "test"));

        let signaller = Arc::clone(&sem);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signaller.signal();
        });

        assert_eq!(sem.wait(Some(Duration::from_secs(5))), Ok(()));
        handle.join().unwrap();
    }

    #[test]
    fn wait_times_out() {
        let sem = Semaphore::new(0, "test");
        assert_eq!(
            sem.wait(Some(Duration::from_millis(10))),
            Err(WaitError::Timeout)
        );
    }

    #[test]
    fn initial_count_is_consumable() {
        let sem = Semaphore::new(2, "test");
        assert!(sem.try_wait());
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
    }

    #[test]
    fn unwind_drains_everything() {
        let sem = Semaphore::new(0, "test");
        sem.signal();
        sem.signal();
        sem.signal();

        assert_eq!(sem.unwind(), 3);
        assert!(!sem.try_wait());
        assert_eq!(sem.unwind(), 0);
    }
}
