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

//! Per-request evaluation façade.
//!
//! A runner is bound to the handle reference it acquired at creation
//! time and owns one native context. Every native failure inside `run`
//! is folded into a [`RunResult`] value; nothing raises past this
//! boundary except debug-build assertions on caller contract
//! violations.

use crate::engine::handle::Handle;
use crate::engine::registry::HandleRegistry;
use crate::native::builtin::PROCESSOR_ADDRESS;
use crate::native::{InputMap, NativeContext, RunStatus};
use crate::result::{EvaluationFailure, EvaluationOutput, RunResult};
use crate::telemetry::TelemetrySink;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// External decision source for schema extraction, consulted once per
/// `extract_schema` call.
pub trait SchemaSampler: Send + Sync {
    fn sample(&self) -> bool;
}

/// Deterministic sampler admitting roughly `rate` of all calls by
/// spacing admissions evenly (first call is always admitted for any
/// non-zero rate).
pub struct IntervalSampler {
    every: u64,
    counter: AtomicU64,
}

impl IntervalSampler {
    pub fn new(rate: f64) -> Self {
        let every = if rate <= 0.0 {
            0
        } else {
            (1.0 / rate.min(1.0)).round().max(1.0) as u64
        };
        Self { every, counter: AtomicU64::new(0) }
    }
}

impl SchemaSampler for IntervalSampler {
    fn sample(&self) -> bool {
        if self.every == 0 {
            return false;
        }
        self.counter.fetch_add(1, Ordering::Relaxed) % self.every == 0
    }
}

enum ContextState {
    Active(Box<dyn NativeContext>),
    Finalized,
}

/// One-per-caller evaluation façade. Not intended for concurrent calls
/// by multiple callers without external serialization; an internal
/// lock enforces the single-native-context-per-call constraint of the
/// underlying engine.
pub struct Runner {
    registry: Arc<HandleRegistry>,
    handle: Arc<Handle>,
    context: Mutex<ContextState>,
    telemetry: Arc<dyn TelemetrySink>,
    sampler: Arc<dyn SchemaSampler>,
    waf_timeout: Duration,
}

impl Runner {
    pub(crate) fn new(
        registry: Arc<HandleRegistry>,
        handle: Arc<Handle>,
        telemetry: Arc<dyn TelemetrySink>,
        sampler: Arc<dyn SchemaSampler>,
        waf_timeout: Duration,
    ) -> Self {
        let context = Mutex::new(ContextState::Active(handle.new_context()));
        Self { registry, handle, context, telemetry, sampler, waf_timeout }
    }

    /// Input-field names the bound handle can consume.
    pub fn known_addresses(&self) -> &[String] {
        self.handle.known_addresses()
    }

    pub fn ruleset_version(&self) -> Option<&str> {
        self.handle.ruleset_version()
    }

    /// Executes one evaluation. Empty and nil values are stripped from
    /// both input maps before the call; booleans are never stripped,
    /// `false` is signal rather than absence. The native layer honors
    /// `timeout` itself and reports overruns via the timeout flag.
    pub fn run(&self, persistent: InputMap, ephemeral: InputMap, timeout: Duration) -> RunResult {
        let mut guard = match self.context.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let ContextState::Active(context) = &mut *guard else {
            // Contract violation: asserts in development builds and is
            // contained as a result value in release builds.
            debug_assert!(false, "run called on a finalized runner");
            error!("run called on a finalized runner");
            self.telemetry.error("security engine run called after finalize");
            return RunResult::Error(EvaluationFailure::default());
        };

        let persistent = strip_empty(persistent);
        let ephemeral = strip_empty(ephemeral);

        let started = Instant::now();
        let outcome = context.run(&persistent, &ephemeral, timeout);
        let duration_ext_ns = started.elapsed().as_nanos() as u64;

        match outcome {
            Ok(raw) => {
                let output = EvaluationOutput {
                    events: raw.events,
                    actions: raw.actions,
                    attributes: raw.attributes,
                    duration_ns: raw.duration_ns,
                    duration_ext_ns,
                    timed_out: raw.timed_out,
                    keep: raw.keep,
                    input_truncated: raw.input_truncated,
                };
                match raw.status {
                    RunStatus::Ok => RunResult::Ok(output),
                    RunStatus::Match => RunResult::Match(output),
                    status => {
                        self.telemetry.error(&format!(
                            "security engine method:run execution error: {}",
                            status.as_str()
                        ));
                        RunResult::Error(EvaluationFailure {
                            duration_ext_ns,
                            input_truncated: output.input_truncated,
                        })
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "native evaluation call failed");
                self.telemetry
                    .report(&err, "security engine low-level error");
                RunResult::Error(EvaluationFailure {
                    duration_ext_ns,
                    input_truncated: false,
                })
            }
        }
    }

    /// Schema-extraction variant of `run`. When sampling declines, no
    /// native call is made at all and an immediate empty `Ok` with
    /// zero-cost timings is returned.
    pub fn extract_schema(&self) -> RunResult {
        if !self.sampler.sample() {
            return RunResult::Ok(EvaluationOutput::default());
        }

        let ephemeral = InputMap::from([(
            PROCESSOR_ADDRESS.to_string(),
            json!({ "extract-schema": true }),
        )]);
        self.run(InputMap::new(), ephemeral, self.waf_timeout)
    }

    /// Releases the native context and returns this runner's handle
    /// reference to the registry. Idempotent; `run` after `finalize`
    /// panics in development builds and yields `RunResult::Error` in
    /// release builds.
    pub fn finalize(&self) {
        let mut guard = match self.context.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let ContextState::Active(mut context) =
            std::mem::replace(&mut *guard, ContextState::Finalized)
        {
            context.finalize();
            if let Err(err) = self.registry.release(&self.handle) {
                error!(error = %err, "runner release failed");
            }
        }
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// Removes entries whose values carry no signal: nil, empty strings,
/// empty arrays, empty maps. Booleans always survive.
fn strip_empty(map: InputMap) -> InputMap {
    map.into_iter().filter(|(_, v)| !is_empty(v)).collect()
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}
