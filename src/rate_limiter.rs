// Copyright 2026 Palisade Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Admission control for bursty event streams.
//!
//! A sliding one-second window bounds how many security events may be
//! emitted per second. Rejected calls are dropped and logged, never
//! queued or blocked on.

use crate::config::LimiterScope;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

const WINDOW: Duration = Duration::from_secs(1);

/// Sliding-window limiter for a single key. Insertion is append-only
/// and time is monotonic, so the oldest timestamps are always at the
/// front of the window.
#[derive(Debug)]
pub struct RateLimiter {
    rate_per_second: u32,
    timestamps: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(rate_per_second: u32) -> Self {
        Self {
            rate_per_second,
            timestamps: VecDeque::new(),
        }
    }

    /// Admits or rejects one event at the current instant.
    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&mut self, now: Instant) -> bool {
        while let Some(front) = self.timestamps.front() {
            if now.duration_since(*front) > WINDOW {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
        self.timestamps.push_back(now);
        self.timestamps.len() <= self.rate_per_second as usize
    }
}

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static THREAD_LIMITERS: RefCell<HashMap<(u64, String), RateLimiter>> =
        RefCell::new(HashMap::new());
}

/// Named-limiter registry. One limiter is lazily constructed per key;
/// the budget is either shared process-wide or owned by each calling
/// thread, depending on the configured scope.
pub struct RateLimiters {
    id: u64,
    rate_per_second: u32,
    scope: LimiterScope,
    global: Mutex<HashMap<String, RateLimiter>>,
}

impl RateLimiters {
    pub fn new(rate_per_second: u32, scope: LimiterScope) -> Self {
        Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            rate_per_second,
            scope,
            global: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `f` only if the event under `key` is admitted, returning
    /// `None` when the rate budget is exhausted.
    pub fn limit<F, R>(&self, key: &str, f: F) -> Option<R>
    where
        F: FnOnce() -> R,
    {
        if self.allow(key) {
            Some(f())
        } else {
            debug!(key, rate = self.rate_per_second, "event dropped by rate limiter");
            None
        }
    }

    fn allow(&self, key: &str) -> bool {
        match self.scope {
            LimiterScope::Global => {
                let mut limiters = match self.global.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                limiters
                    .entry(key.to_string())
                    .or_insert_with(|| RateLimiter::new(self.rate_per_second))
                    .allow()
            }
            LimiterScope::PerThread => THREAD_LIMITERS.with(|cell| {
                cell.borrow_mut()
                    .entry((self.id, key.to_string()))
                    .or_insert_with(|| RateLimiter::new(self.rate_per_second))
                    .allow()
            }),
        }
    }
}
