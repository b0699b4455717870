// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Thread-side primitives shared by the multiplexer and its callers: a named
//! counting semaphore, a fixed-size request/reply pool, a background job
//! runner, and a debug-build registry that validates object lifecycles.

pub mod job;
pub mod request_pool;
pub mod semaphore;
pub mod tracked;

pub use job::{Job, JobState, Notify};
pub use request_pool::RequestPool;
pub use semaphore::{Semaphore, WaitError};
pub use tracked::Tracked;
