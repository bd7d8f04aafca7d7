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

//! Domain error types.
//!
//! Construction-time failures (`EngineError`) are recoverable at the
//! engine level: the caller decides whether to disable inspection or
//! keep the previous configuration. Per-call failures are never raised
//! past the runner boundary; they are folded into `RunResult::Error`.

use thiserror::Error;

/// Errors produced while building or reconfiguring the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The native binding could not be loaded for this platform.
    /// Fatal to the engine, non-fatal to the host process.
    #[error("native binding unavailable: {reason}")]
    BindingUnavailable { reason: String },

    /// The configuration builder could not be constructed.
    #[error("builder construction failed: {reason}")]
    BuilderConstructionFailed { reason: String },

    /// A configuration blob was rejected wholesale. On rebuild the
    /// previous handle is left untouched.
    #[error("configuration load failed at '{path}': {reason}")]
    ConfigLoadFailed { path: String, reason: String },

    /// The builder could not derive a new handle from its accumulated
    /// configuration.
    #[error("handle build failed: {reason}")]
    HandleBuildFailed { reason: String },

    /// The engine was finalized; no further runners or rebuilds.
    #[error("engine has been finalized")]
    Finalized,
}

/// Registry programming-contract violations.
///
/// These indicate a caller bug (double release, release of a handle
/// that was never acquired), not an environmental failure. They fire a
/// `debug_assert!` in development builds and are surfaced as errors in
/// release builds.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("handle released with no active references")]
    ContractViolation,

    #[error("registry has no current handle")]
    NoCurrentHandle,
}

/// Failures reported by the native boundary.
#[derive(Error, Debug)]
pub enum NativeError {
    /// The binding refused to load (missing library, unsupported
    /// platform).
    #[error("binding unavailable: {0}")]
    BindingUnavailable(String),

    /// A configuration blob or obfuscator pattern was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A low-level evaluation call failed outright.
    #[error("native call failed: {0}")]
    CallFailed(String),
}
