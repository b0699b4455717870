// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use log::*;

use crate::semaphore::{Semaphore, WaitError};
use crate::tracked::Tracked;

/// Pool size used when the caller asks for something nonsensical.
pub const DEFAULT_POOL_SIZE: usize = 16;

#[derive(Debug, PartialEq, Eq)]
pub enum PoolError {
    /// No request with that id is in flight.
    UnknownId(i32),

    /// A request with that id is already in flight.
    DuplicateId(i32),

    /// Every slot is occupied.
    Exhausted,

    /// The wait timed out. The slot has been freed regardless.
    Timeout,

    /// Internal lock poisoned by a panicking thread.
    Poisoned,
}

impl std::error::Error for PoolError {}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnknownId(id) => write!(f, "request id {id} does not exist"),
            Self::DuplicateId(id) => write!(f, "request id {id} already in use"),
            Self::Exhausted => write!(f, "too many in-flight requests"),
            Self::Timeout => write!(f, "timed out waiting for request"),
            Self::Poisoned => write!(f, "request pool lock poisoned"),
        }
    }
}

struct SlotData<I, O> {
    input: Option<I>,
    output: Option<O>,
}

struct Slot<I, O> {
    served: Semaphore,
    data: Mutex<SlotData<I, O>>,
}

/// A fixed-size table of in-flight request slots.
///
/// One thread `push`es a request under a caller-chosen integer id and `wait`s
/// for it; another thread fills in the reply (see [`RequestPool::with_data`])
/// and `serve`s the id. At most one thread may wait on a given id, and every
/// `push` must be paired with exactly one `serve`.
///
/// The table never grows: a pool of size N holds at most N in-flight
/// requests, and ids currently in use are unique across the pool.
pub struct RequestPool<I, O> {
    name: String,
    /// Slot-index -> request id, -1 meaning free. Guarded by the pool lock;
    /// this is the only place ids live.
    ids: Mutex<Vec<i32>>,
    slots: Vec<Slot<I, O>>,
    tracked: Tracked,
}

impl<I, O> RequestPool<I, O> {
    pub fn new(size: usize, name: &str) -> RequestPool<I, O> {
        let size = if size < 1 {
            warn!("request pool '{name}': size 0 requested, defaulting to {DEFAULT_POOL_SIZE}");
            DEFAULT_POOL_SIZE
        } else {
            size
        };

        let slots = (0..size)
            .map(|i| Slot {
                served: Semaphore::new(0, &format!("{name}#{i}")),
                data: Mutex::new(SlotData {
                    input: None,
                    output: None,
                }),
            })
            .collect();

        RequestPool {
            name: name.to_string(),
            ids: Mutex::new(vec![-1; size]),
            slots,
            tracked: Tracked::new("RequestPool"),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a new in-flight request. Fails on a duplicate id or a full
    /// table, in which case nothing is stored.
    pub fn push(&self, id: i32, input: I, output: O) -> Result<(), PoolError> {
        self.tracked.assert_live();

        let mut ids = self.ids.lock().map_err(|_| PoolError::Poisoned)?;

        if ids.contains(&id) {
            error!("request pool '{}': id {id} already in use", self.name);
            return Err(PoolError::DuplicateId(id));
        }

        let Some(free) = ids.iter().position(|slot_id| *slot_id == -1) else {
            error!("request pool '{}': too many requests", self.name);
            return Err(PoolError::Exhausted);
        };

        let mut data = self.slots[free].data.lock().map_err(|_| PoolError::Poisoned)?;
        data.input = Some(input);
        data.output = Some(output);
        drop(data);

        ids[free] = id;

        debug!("request pool '{}': pushed request id {id}", self.name);
        Ok(())
    }

    /// Block until another thread serves `id`, then free the slot and hand
    /// the payloads back.
    ///
    /// The slot is freed on timeout as well; a serve arriving after that
    /// reports an unknown id.
    pub fn wait(
        &self,
        id: i32,
        timeout: Option<Duration>,
    ) -> Result<(Option<I>, Option<O>), PoolError> {
        self.tracked.assert_live();

        let slot = self.find(id)?;

        debug!("request pool '{}': waiting for request id {id}", self.name);

        let wait_result = self.slots[slot].served.wait(timeout);

        // Free the slot whatever happened to the wait.
        let payloads = self.free(slot)?;

        match wait_result {
            Ok(()) => Ok(payloads),
            Err(WaitError::Timeout) => {
                error!("request pool '{}': timeout waiting for id {id}", self.name);
                Err(PoolError::Timeout)
            }
            Err(WaitError::Poisoned) => Err(PoolError::Poisoned),
        }
    }

    /// Mark the request as served, waking the waiter. Each push is served
    /// exactly once.
    pub fn serve(&self, id: i32) -> Result<(), PoolError> {
        self.tracked.assert_live();

        let slot = self.find(id)?;
        self.slots[slot].served.signal();

        debug!("request pool '{}': served request id {id}", self.name);
        Ok(())
    }

    /// Run `f` over the request's payloads under the slot's data lock.
    /// This is how the serving side fills in the reply before `serve`.
    pub fn with_data<R>(
        &self,
        id: i32,
        f: impl FnOnce(&mut Option<I>, &mut Option<O>) -> R,
    ) -> Result<R, PoolError> {
        self.tracked.assert_live();

        // Hold the pool lock across the callback so the waiter cannot free
        // the slot out from under it.
        let ids = self.ids.lock().map_err(|_| PoolError::Poisoned)?;

        let Some(slot) = ids.iter().position(|slot_id| *slot_id == id) else {
            error!("request pool '{}': id {id} does not exist", self.name);
            return Err(PoolError::UnknownId(id));
        };

        let mut data = self.slots[slot].data.lock().map_err(|_| PoolError::Poisoned)?;
        let SlotData { input, output } = &mut *data;
        Ok(f(input, output))
    }

    fn find(&self, id: i32) -> Result<usize, PoolError> {
        let ids = self.ids.lock().map_err(|_| PoolError::Poisoned)?;

        ids.iter()
            .position(|slot_id| *slot_id == id)
            .ok_or_else(|| {
                error!("request pool '{}': id {id} does not exist", self.name);
                PoolError::UnknownId(id)
            })
    }

    fn free(&self, slot: usize) -> Result<(Option<I>, Option<O>), PoolError> {
        let mut ids = self.ids.lock().map_err(|_| PoolError::Poisoned)?;
        ids[slot] = -1;

        // A serve that raced the timeout may have left a stale unit behind;
        // drain it so the recycled slot starts clean.
        self.slots[slot].served.unwind();

        let mut data = self.slots[slot].data.lock().map_err(|_| PoolError::Poisoned)?;
        Ok((data.input.take(), data.output.take()))
    }
}
