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

//! Reference-counted holder of the current evaluation handle.
//!
//! `(current, refcounts, retiring)` form one atomic unit behind a
//! single mutex. Splitting them into independently locked fields would
//! reintroduce the swap-then-release race this design exists to
//! prevent. A handle is finalized only when it has been superseded and
//! its refcount has drained to zero; the handle equal to `current` is
//! never finalized regardless of refcount.

use crate::engine::handle::Handle;
use crate::errors::RegistryError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error};

#[derive(Default)]
struct RegistryState {
    current: Option<Arc<Handle>>,
    /// Active holders per handle identity; entries are removed when
    /// they drain to zero, so every stored count is positive.
    refcounts: HashMap<usize, usize>,
    /// Superseded handles still awaiting their last release.
    retiring: Vec<Arc<Handle>>,
}

fn identity(handle: &Arc<Handle>) -> usize {
    Arc::as_ptr(handle) as usize
}

pub struct HandleRegistry {
    state: Mutex<RegistryState>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self { state: Mutex::new(RegistryState::default()) }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Increments the refcount of `current` and returns it. O(1) and
    /// never blocks on I/O. Two acquisitions around the same instant
    /// may observe different handles across a swap; rotation is
    /// eventually consistent by design.
    pub fn acquire_current(&self) -> Result<Arc<Handle>, RegistryError> {
        let mut state = self.lock();
        let current = state
            .current
            .clone()
            .ok_or(RegistryError::NoCurrentHandle)?;
        *state.refcounts.entry(identity(&current)).or_insert(0) += 1;
        Ok(current)
    }

    /// Drops one reference. If the handle has been superseded and this
    /// was the last holder, native resources are released here. That
    /// teardown is a plain call, no blocking I/O.
    ///
    /// Releasing a handle with no tracked references is a programming
    /// error: it panics in development builds and is error-logged and
    /// surfaced in release builds, never silently clamped.
    pub fn release(&self, handle: &Arc<Handle>) -> Result<(), RegistryError> {
        let mut state = self.lock();
        let key = identity(handle);

        let Some(count) = state.refcounts.get_mut(&key) else {
            debug_assert!(false, "release of a handle with no active references");
            error!("handle released with no active references");
            return Err(RegistryError::ContractViolation);
        };

        *count -= 1;
        if *count == 0 {
            state.refcounts.remove(&key);
            if let Some(position) = state.retiring.iter().position(|h| identity(h) == key) {
                let retired = state.retiring.swap_remove(position);
                debug!("finalizing retired handle after last release");
                retired.finalize_native();
            }
        }
        Ok(())
    }

    /// Installs `new` as the handle handed to new acquisitions. The
    /// previous current moves to the retiring set; it is finalized by
    /// the release that drains its refcount, so in-flight evaluations
    /// against it finish safely. Swaps are totally ordered by the
    /// critical section: when two rebuilds race, the loser's handle is
    /// retired possibly before any reader ever saw it.
    pub fn swap(&self, new: Arc<Handle>) {
        let mut state = self.lock();
        if let Some(old) = state.current.replace(new) {
            state.retiring.push(old);
        }
    }

    /// Tears down the registry: the current handle and every retired
    /// handle without active references are finalized. Called once at
    /// engine shutdown, after no more runners will be created.
    pub fn finalize(&self) {
        let mut state = self.lock();
        if let Some(current) = state.current.take() {
            state.retiring.push(current);
        }

        let mut still_referenced = Vec::new();
        for handle in std::mem::take(&mut state.retiring) {
            if state.refcounts.contains_key(&identity(&handle)) {
                // Teardown deferred to the last release.
                still_referenced.push(handle);
            } else {
                handle.finalize_native();
            }
        }
        state.retiring = still_referenced;
    }

    #[cfg(test)]
    fn refcount(&self, handle: &Arc<Handle>) -> usize {
        self.lock()
            .refcounts
            .get(&identity(handle))
            .copied()
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn retiring_len(&self) -> usize {
        self.lock().retiring.len()
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
