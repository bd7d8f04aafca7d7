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

//! Top-level engine owner.
//!
//! Builds the native configuration builder, loads the initial rule
//! configuration, installs the first handle into the registry, and
//! exposes rebuild and runner creation. A failed build leaves the
//! engine unusable: the caller disables inspection entirely rather
//! than operating in a partial state. The host request path must
//! never crash or degrade because of this subsystem.

pub mod handle;
pub mod registry;
pub mod runner;

use crate::config::EngineConfig;
use crate::errors::{EngineError, NativeError};
use crate::native::{Diagnostics, NativeBinding, NativeBuilder, NativeHandle};
use crate::telemetry::{TelemetrySink, METRICS_NAMESPACE};
use handle::Handle;
use registry::HandleRegistry;
use runner::{IntervalSampler, Runner, SchemaSampler};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{error, info, warn};

/// Path under which the base ruleset is loaded into the builder.
pub const DEFAULT_RULESET_PATH: &str = "ASM_DD/default";

/// Owner of the builder, registry, and telemetry plumbing.
///
/// Shared across request threads and the control plane. Native handles
/// do not survive a process fork; after forking, drop the old engine
/// and `build` a fresh one.
pub struct Engine {
    /// Long-lived; accumulates configuration by path across rebuilds.
    /// Builders are not internally thread-safe, so every access is
    /// serialized through this lock.
    builder: Mutex<Option<Box<dyn NativeBuilder>>>,
    registry: Arc<HandleRegistry>,
    telemetry: Arc<dyn TelemetrySink>,
    sampler: Arc<dyn SchemaSampler>,
    waf_timeout: Duration,
    binding_version: String,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("waf_timeout", &self.waf_timeout)
            .field("binding_version", &self.binding_version)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Builds the engine: constructs the configuration builder, loads
    /// the default ruleset and any bundled configuration sources,
    /// derives the first handle, and installs it.
    ///
    /// On failure the engine is unusable; the caller should disable
    /// the security feature (with a logged warning) rather than fail
    /// host requests.
    pub fn build(
        config: &EngineConfig,
        binding: Arc<dyn NativeBinding>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Result<Self, EngineError> {
        let binding_version = binding.version().to_string();

        let mut builder = match binding.new_builder(&config.obfuscator) {
            Ok(builder) => builder,
            Err(err) => {
                let mapped = match err {
                    NativeError::BindingUnavailable(reason) => {
                        EngineError::BindingUnavailable { reason }
                    }
                    other => EngineError::BuilderConstructionFailed { reason: other.to_string() },
                };
                error!(error = %mapped, "security engine failed to initialize");
                telemetry.report(&mapped, "security engine failed to initialize");
                report_init(&telemetry, &binding_version, "", false);
                return Err(mapped);
            }
        };

        let built = load_and_build(&mut *builder, &telemetry, &binding_version, config);
        let (native_handle, diagnostics) = match built {
            Ok(built) => built,
            Err(err) => {
                // The builder will never produce a handle; release its
                // native resources before surfacing the failure.
                builder.finalize();
                error!(error = %err, "security engine failed to initialize");
                telemetry.report(&err, "security engine failed to initialize");
                report_init(&telemetry, &binding_version, "", false);
                return Err(err);
            }
        };

        let handle = Arc::new(Handle::new(native_handle, diagnostics));
        let ruleset_version = handle.ruleset_version().unwrap_or_default().to_string();
        report_init(&telemetry, &binding_version, &ruleset_version, true);
        info!(ruleset_version, "security engine initialized");

        let registry = Arc::new(HandleRegistry::new());
        registry.swap(handle);

        Ok(Self {
            builder: Mutex::new(Some(builder)),
            registry,
            sampler: Arc::new(IntervalSampler::new(config.schema_sample_rate)),
            waf_timeout: config.waf_timeout,
            binding_version,
            telemetry,
        })
    }

    /// Merges the configuration at `path` and atomically swaps in a
    /// handle built from the updated state. All-or-nothing: on any
    /// failure the previous current handle stays untouched.
    pub fn rebuild(&self, blob: &Value, path: &str) -> Result<Diagnostics, EngineError> {
        let mut guard = self.lock_builder();
        let builder = guard.as_deref_mut().ok_or(EngineError::Finalized)?;

        let diagnostics = load_config(
            builder,
            &self.telemetry,
            &self.binding_version,
            blob,
            path,
            "update",
        )?;
        self.swap_from_builder(builder, diagnostics)
    }

    /// Removes the configuration at `path` and swaps in a handle built
    /// without it. Returns `Ok(None)` when the path was not present.
    pub fn remove_config(&self, path: &str) -> Result<Option<Diagnostics>, EngineError> {
        let mut guard = self.lock_builder();
        let builder = guard.as_deref_mut().ok_or(EngineError::Finalized)?;

        if !builder.remove_config(path) {
            return Ok(None);
        }
        info!(path, "configuration removed");
        self.swap_from_builder(builder, Diagnostics::default())
            .map(Some)
    }

    /// Creates a runner bound to the current handle. The handle
    /// reference is held until the runner is finalized.
    pub fn new_runner(&self) -> Result<Runner, EngineError> {
        let handle = self
            .registry
            .acquire_current()
            .map_err(|_| EngineError::Finalized)?;
        Ok(Runner::new(
            Arc::clone(&self.registry),
            handle,
            Arc::clone(&self.telemetry),
            Arc::clone(&self.sampler),
            self.waf_timeout,
        ))
    }

    /// Input-field names the current configuration can consume.
    pub fn known_addresses(&self) -> Vec<String> {
        match self.registry.acquire_current() {
            Ok(handle) => {
                let addresses = handle.known_addresses().to_vec();
                if self.registry.release(&handle).is_err() {
                    warn!("inconsistent registry state while reading addresses");
                }
                addresses
            }
            Err(_) => Vec::new(),
        }
    }

    pub fn ruleset_version(&self) -> Option<String> {
        match self.registry.acquire_current() {
            Ok(handle) => {
                let version = handle.ruleset_version().map(str::to_string);
                if self.registry.release(&handle).is_err() {
                    warn!("inconsistent registry state while reading version");
                }
                version
            }
            Err(_) => None,
        }
    }

    /// Tears down the builder and the registry. Safe to call once,
    /// after no more runners will be created; idempotent in practice
    /// (subsequent calls are no-ops).
    pub fn finalize(&self) {
        if let Some(mut builder) = self.lock_builder().take() {
            builder.finalize();
        }
        self.registry.finalize();
    }

    fn lock_builder(&self) -> MutexGuard<'_, Option<Box<dyn NativeBuilder>>> {
        match self.builder.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn swap_from_builder(
        &self,
        builder: &mut dyn NativeBuilder,
        diagnostics: Diagnostics,
    ) -> Result<Diagnostics, EngineError> {
        match builder.build_handle() {
            Ok(native_handle) => {
                let handle = Arc::new(Handle::new(native_handle, diagnostics.clone()));
                self.registry.swap(handle);
                self.report_update(true);
                info!(
                    ruleset_version = diagnostics.ruleset_version.as_deref().unwrap_or_default(),
                    "security engine reconfigured"
                );
                Ok(diagnostics)
            }
            Err(err) => {
                let mapped = EngineError::HandleBuildFailed { reason: err.to_string() };
                warn!(error = %mapped, "reconfiguration failed; previous handle kept");
                self.telemetry.report(&mapped, "security engine reconfiguration failed");
                self.report_update(false);
                Err(mapped)
            }
        }
    }

    fn report_update(&self, success: bool) {
        // On a failed swap this reports the version still in force.
        let ruleset_version = self.ruleset_version().unwrap_or_default();
        self.telemetry.inc(
            METRICS_NAMESPACE,
            "waf.updates",
            1,
            &[
                ("waf_version", self.binding_version.as_str()),
                ("event_rules_version", ruleset_version.as_str()),
                ("success", if success { "true" } else { "false" }),
            ],
        );
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// Loads the default ruleset plus all bundled configuration sources
/// and derives the first handle. The default ruleset provides the
/// handle's build metadata; bundled sources (denylists, passlists,
/// scanners, processors) only merge additional configuration.
fn load_and_build(
    builder: &mut dyn NativeBuilder,
    telemetry: &Arc<dyn TelemetrySink>,
    binding_version: &str,
    config: &EngineConfig,
) -> Result<(Box<dyn NativeHandle>, Diagnostics), EngineError> {
    let diagnostics = load_config(
        builder,
        telemetry,
        binding_version,
        &config.default_ruleset,
        DEFAULT_RULESET_PATH,
        "init",
    )?;
    for source in &config.bundled_configs {
        load_config(builder, telemetry, binding_version, &source.blob, &source.path, "init")?;
    }

    let native_handle = builder
        .build_handle()
        .map_err(|err| EngineError::HandleBuildFailed { reason: err.to_string() })?;
    Ok((native_handle, diagnostics))
}

fn report_init(
    telemetry: &Arc<dyn TelemetrySink>,
    binding_version: &str,
    ruleset_version: &str,
    success: bool,
) {
    telemetry.inc(
        METRICS_NAMESPACE,
        "waf.init",
        1,
        &[
            ("waf_version", binding_version),
            ("event_rules_version", ruleset_version),
            ("success", if success { "true" } else { "false" }),
        ],
    );
}

/// Loads one configuration blob into the builder, reporting diagnostics
/// errors through telemetry. A top-level rejection is a
/// `ConfigLoadFailed`; item-level failures are reported but the valid
/// remainder still loads.
fn load_config(
    builder: &mut dyn NativeBuilder,
    telemetry: &Arc<dyn TelemetrySink>,
    binding_version: &str,
    blob: &Value,
    path: &str,
    action: &str,
) -> Result<Diagnostics, EngineError> {
    let diagnostics = builder.add_or_update_config(blob, path).map_err(|err| {
        EngineError::ConfigLoadFailed { path: path.to_string(), reason: err.to_string() }
    })?;

    let ruleset_version = diagnostics.ruleset_version.as_deref().unwrap_or_default();

    if let Some(reason) = &diagnostics.top_level_error {
        telemetry.error(reason);
        telemetry.inc(
            METRICS_NAMESPACE,
            "waf.config_errors",
            1,
            &[
                ("waf_version", binding_version),
                ("event_rules_version", ruleset_version),
                ("action", action),
                ("scope", "top-level"),
            ],
        );
        return Err(EngineError::ConfigLoadFailed {
            path: path.to_string(),
            reason: reason.clone(),
        });
    }

    for (section, report) in &diagnostics.sections {
        if let Some(reason) = &report.error {
            telemetry.error(reason);
            telemetry.inc(
                METRICS_NAMESPACE,
                "waf.config_errors",
                1,
                &[
                    ("waf_version", binding_version),
                    ("event_rules_version", ruleset_version),
                    ("action", action),
                    ("config_key", section.as_str()),
                    ("scope", "top-level"),
                ],
            );
            continue;
        }
        if !report.failed.is_empty() {
            for (message, ids) in &report.errors {
                telemetry.error(&format!("{message}: {ids:?}"));
            }
            telemetry.inc(
                METRICS_NAMESPACE,
                "waf.config_errors",
                report.failed.len() as u64,
                &[
                    ("waf_version", binding_version),
                    ("event_rules_version", ruleset_version),
                    ("action", action),
                    ("config_key", section.as_str()),
                    ("scope", "item"),
                ],
            );
        }
    }

    Ok(diagnostics)
}
