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

//! Native engine boundary.
//!
//! The pattern-matching engine is opaque to the coordination layer.
//! Call sites depend only on the traits here, never on a concrete
//! binding: the shipped implementation is [`builtin::BuiltinBinding`],
//! and an FFI-backed binding implements the same four traits.

pub mod builtin;

use crate::config::ObfuscatorConfig;
use crate::errors::NativeError;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::time::Duration;

/// Address-keyed evaluation inputs.
pub type InputMap = HashMap<String, Value>;

/// Status codes a native evaluation can return. Anything other than
/// `Ok`/`Match` is classified as an evaluation error by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunStatus {
    #[default]
    Ok,
    Match,
    ErrInternal,
    ErrInvalidObject,
    ErrInvalidArgument,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Ok => "ok",
            RunStatus::Match => "match",
            RunStatus::ErrInternal => "err_internal",
            RunStatus::ErrInvalidObject => "err_invalid_object",
            RunStatus::ErrInvalidArgument => "err_invalid_argument",
        }
    }
}

/// Raw response of one native evaluation call, before classification.
#[derive(Debug, Clone, Default)]
pub struct RawRunOutcome {
    pub status: RunStatus,
    pub events: Vec<Value>,
    pub actions: HashMap<String, Value>,
    pub attributes: HashMap<String, Value>,
    pub timed_out: bool,
    pub keep: bool,
    pub input_truncated: bool,
    pub duration_ns: u64,
}

/// Per-section report of what loaded or failed while merging one
/// configuration blob.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SectionReport {
    pub loaded: Vec<String>,
    pub failed: Vec<String>,
    /// Item-level errors: message to offending identifiers.
    pub errors: BTreeMap<String, Vec<String>>,
    /// Section-level error (e.g. wrong type for the whole section).
    pub error: Option<String>,
}

/// Diagnostics produced while loading one configuration blob.
/// Informational only: the derived handle is the source of truth.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Diagnostics {
    pub ruleset_version: Option<String>,
    pub sections: BTreeMap<String, SectionReport>,
    /// Set when the blob was rejected wholesale.
    pub top_level_error: Option<String>,
}

impl Diagnostics {
    /// Number of item-level failures across all sections.
    pub fn item_error_count(&self) -> usize {
        self.sections.values().map(|s| s.failed.len()).sum()
    }

    /// Whether any section was rejected wholesale.
    pub fn has_section_errors(&self) -> bool {
        self.sections.values().any(|s| s.error.is_some())
    }
}

/// Entry point of a native engine implementation.
pub trait NativeBinding: Send + Sync {
    /// Version string reported in telemetry tags.
    fn version(&self) -> &str;

    /// Constructs a long-lived configuration builder parameterized by
    /// obfuscation rules.
    fn new_builder(
        &self,
        obfuscator: &ObfuscatorConfig,
    ) -> Result<Box<dyn NativeBuilder>, NativeError>;
}

/// Long-lived native object accumulating configuration by path key and
/// producing handles on demand. Not internally thread-safe; callers
/// serialize access.
pub trait NativeBuilder: Send {
    /// Merges (last-write-wins) the configuration at `path`.
    fn add_or_update_config(&mut self, blob: &Value, path: &str)
        -> Result<Diagnostics, NativeError>;

    /// Removes the configuration at `path`, reporting whether it was
    /// present.
    fn remove_config(&mut self, path: &str) -> bool;

    /// Derives a new evaluation handle from the accumulated
    /// configuration.
    fn build_handle(&mut self) -> Result<Box<dyn NativeHandle>, NativeError>;

    /// Releases builder resources. The builder is unusable afterwards.
    fn finalize(&mut self);
}

/// One built, immutable native evaluation unit.
pub trait NativeHandle: Send + Sync {
    /// Input-field names the loaded configuration can consume.
    fn known_addresses(&self) -> Vec<String>;

    /// Derives a per-evaluation context. Contexts are not safe for
    /// concurrent calls.
    fn new_context(&self) -> Box<dyn NativeContext>;

    /// Releases native resources. Callers guarantee this is invoked at
    /// most once and only after the last context is done.
    fn finalize(&self);
}

/// Per-evaluation native object derived from a handle.
pub trait NativeContext: Send {
    /// Runs one evaluation. The native layer honors `timeout` itself
    /// and reports deadline overruns via `timed_out` rather than a
    /// cancellation signal.
    fn run(
        &mut self,
        persistent: &InputMap,
        ephemeral: &InputMap,
        timeout: Duration,
    ) -> Result<RawRunOutcome, NativeError>;

    /// Releases the context.
    fn finalize(&mut self);
}
