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

//! Immutable wrapper around one built native engine instance.

use crate::native::{Diagnostics, NativeContext, NativeHandle};
use std::sync::atomic::{AtomicBool, Ordering};

/// One built, immutable evaluation unit plus its build metadata.
/// Created by the engine, destroyed only after the registry proves
/// zero active references.
pub struct Handle {
    native: Box<dyn NativeHandle>,
    diagnostics: Diagnostics,
    known_addresses: Vec<String>,
    finalized: AtomicBool,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("diagnostics", &self.diagnostics)
            .field("known_addresses", &self.known_addresses)
            .field("finalized", &self.finalized)
            .finish_non_exhaustive()
    }
}

impl Handle {
    pub(crate) fn new(native: Box<dyn NativeHandle>, diagnostics: Diagnostics) -> Self {
        let known_addresses = native.known_addresses();
        Self {
            native,
            diagnostics,
            known_addresses,
            finalized: AtomicBool::new(false),
        }
    }

    /// Input-field names the loaded configuration can consume; callers
    /// use this to decide what data to collect before a run.
    pub fn known_addresses(&self) -> &[String] {
        &self.known_addresses
    }

    /// Build report of what loaded or failed. Informational only.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn ruleset_version(&self) -> Option<&str> {
        self.diagnostics.ruleset_version.as_deref()
    }

    pub(crate) fn new_context(&self) -> Box<dyn NativeContext> {
        self.native.new_context()
    }

    /// Releases native resources at most once. The registry only calls
    /// this after the refcount has drained, so no context derived from
    /// this handle can still be live.
    pub(crate) fn finalize_native(&self) {
        if !self.finalized.swap(true, Ordering::AcqRel) {
            self.native.finalize();
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        // Safety net for handles that never went through the registry.
        self.finalize_native();
    }
}
