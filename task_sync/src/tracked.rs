// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use log::*;

/// Process-wide registry of live instances, kept per class name.
///
/// Long-lived shared objects (the mixer, jobs, request pools) embed a
/// [`Tracked`] guard. In debug builds the guard registers itself on
/// construction and unregisters on drop, so a method running on an object
/// that was never constructed, or already torn down, can be reported loudly
/// instead of silently corrupting state. Release builds keep only the token
/// counter; every probe answers "live".
struct Registry {
    live: HashMap<&'static str, HashSet<u64>>,
    created: HashMap<&'static str, u64>,
    destroyed: HashMap<&'static str, u64>,
}

static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

fn registry() -> &'static Mutex<Registry> {
    REGISTRY.get_or_init(|| {
        Mutex::new(Registry {
            live: HashMap::new(),
            created: HashMap::new(),
            destroyed: HashMap::new(),
        })
    })
}

fn lock() -> std::sync::MutexGuard<'static, Registry> {
    match registry().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Lifecycle guard for one instance of `class`.
pub struct Tracked {
    class: &'static str,
    token: u64,
}

impl Tracked {
    pub fn new(class: &'static str) -> Tracked {
        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);

        if cfg!(debug_assertions) {
            let mut reg = lock();
            reg.live.entry(class).or_default().insert(token);
            *reg.created.entry(class).or_default() += 1;
        }

        trace!("{class}: instance #{token} created");

        Tracked { class, token }
    }

    pub fn class(&self) -> &'static str {
        self.class
    }

    /// Is this instance still registered? Always true in release builds.
    pub fn is_live(&self) -> bool {
        if !cfg!(debug_assertions) {
            return true;
        }

        lock()
            .live
            .get(self.class)
            .is_some_and(|set| set.contains(&self.token))
    }

    /// Validate the receiver at a public entry point. A miss means the caller
    /// holds something that was never constructed or has been destroyed.
    pub fn assert_live(&self) {
        if !self.is_live() {
            error!(
                "{}: instance #{} used after destruction (or never constructed)",
                self.class, self.token
            );
            debug_assert!(false, "{}: use of untracked instance", self.class);
        }
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        if !cfg!(debug_assertions) {
            return;
        }

        let mut reg = lock();

        let removed = reg
            .live
            .get_mut(self.class)
            .is_some_and(|set| set.remove(&self.token));

        // An unregistered drop is reported, never followed: it means a second
        // teardown of the same instance.
        if !removed {
            error!(
                "{}: destroying instance #{} which is not registered",
                self.class, self.token
            );
            return;
        }

        *reg.destroyed.entry(self.class).or_default() += 1;
    }
}

/// Number of currently registered instances of `class` (0 in release builds).
pub fn live_count(class: &str) -> usize {
    lock().live.get(class).map_or(0, |set| set.len())
}

pub fn created_count(class: &str) -> u64 {
    lock().created.get(class).copied().unwrap_or(0)
}

pub fn destroyed_count(class: &str) -> u64 {
    lock().destroyed.get(class).copied().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_create_and_destroy() {
        let before = live_count("tracked_test");

        let a = Tracked::new("tracked_test");
        let b = Tracked::new("tracked_test");
        assert!(a.is_live());
        assert!(b.is_live());
        assert_eq!(live_count("tracked_test"), before + 2);

        drop(a);
        assert_eq!(live_count("tracked_test"), before + 1);
        assert!(b.is_live());

        drop(b);
        assert_eq!(live_count("tracked_test"), before);
        assert!(created_count("tracked_test") >= 2);
        assert!(destroyed_count("tracked_test") >= 2);
    }
}
