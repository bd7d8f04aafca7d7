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

//! Evaluation outcomes.
//!
//! One evaluation call produces exactly one [`RunResult`] variant. The
//! `is_match`/`is_error` predicates are mutually exclusive and together
//! exhaustive by construction of the enum.

use serde_json::Value;
use std::collections::HashMap;

/// Payload shared by the `Ok` and `Match` variants.
#[derive(Debug, Clone, Default)]
pub struct EvaluationOutput {
    /// Security events produced by matched rules.
    pub events: Vec<Value>,
    /// Actions requested by matched rules, keyed by action name.
    pub actions: HashMap<String, Value>,
    /// Derived data extracted from the request (e.g. API schemas).
    pub attributes: HashMap<String, Value>,
    /// Pure match time as reported by the native engine.
    pub duration_ns: u64,
    /// Wall-clock time around the native call, marshaling included.
    pub duration_ext_ns: u64,
    /// Whether the native engine hit its evaluation deadline.
    pub timed_out: bool,
    /// Sampling-priority hint: the trace carrying this result should be
    /// retained.
    pub keep: bool,
    /// Whether some input exceeded native processing limits and was
    /// partially ignored.
    pub input_truncated: bool,
}

/// Payload of the `Error` variant. No events or actions are trustworthy
/// after a failed call.
#[derive(Debug, Clone, Default)]
pub struct EvaluationFailure {
    pub duration_ext_ns: u64,
    pub input_truncated: bool,
}

/// Classified outcome of one evaluation call.
#[derive(Debug, Clone)]
pub enum RunResult {
    /// No rule matched.
    Ok(EvaluationOutput),
    /// At least one rule matched.
    Match(EvaluationOutput),
    /// The native call failed or returned an unrecognized status.
    Error(EvaluationFailure),
}

impl RunResult {
    pub fn is_match(&self) -> bool {
        matches!(self, RunResult::Match(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RunResult::Error(_))
    }

    pub fn timed_out(&self) -> bool {
        match self {
            RunResult::Ok(out) | RunResult::Match(out) => out.timed_out,
            RunResult::Error(_) => false,
        }
    }

    pub fn keep(&self) -> bool {
        match self {
            RunResult::Ok(out) | RunResult::Match(out) => out.keep,
            RunResult::Error(_) => false,
        }
    }

    pub fn input_truncated(&self) -> bool {
        match self {
            RunResult::Ok(out) | RunResult::Match(out) => out.input_truncated,
            RunResult::Error(failure) => failure.input_truncated,
        }
    }

    pub fn events(&self) -> &[Value] {
        match self {
            RunResult::Ok(out) | RunResult::Match(out) => &out.events,
            RunResult::Error(_) => &[],
        }
    }

    pub fn actions(&self) -> Option<&HashMap<String, Value>> {
        match self {
            RunResult::Ok(out) | RunResult::Match(out) => Some(&out.actions),
            RunResult::Error(_) => None,
        }
    }

    pub fn attributes(&self) -> Option<&HashMap<String, Value>> {
        match self {
            RunResult::Ok(out) | RunResult::Match(out) => Some(&out.attributes),
            RunResult::Error(_) => None,
        }
    }

    /// Native-reported match time; zero for errors.
    pub fn duration_ns(&self) -> u64 {
        match self {
            RunResult::Ok(out) | RunResult::Match(out) => out.duration_ns,
            RunResult::Error(_) => 0,
        }
    }

    pub fn duration_ext_ns(&self) -> u64 {
        match self {
            RunResult::Ok(out) | RunResult::Match(out) => out.duration_ext_ns,
            RunResult::Error(failure) => failure.duration_ext_ns,
        }
    }
}
