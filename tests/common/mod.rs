//! Shared test fixtures: a counting fake native layer that records
//! lifecycle ordering violations, and a capturing telemetry sink.

#![allow(dead_code)]

use palisade::config::ObfuscatorConfig;
use palisade::errors::NativeError;
use palisade::native::{
    Diagnostics, InputMap, NativeBinding, NativeBuilder, NativeContext, NativeHandle,
    RawRunOutcome, RunStatus,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Installs a subscriber honoring `RUST_LOG`; safe to call from every
/// test, later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Per-handle lifecycle counters recorded by the counting fake.
#[derive(Default)]
pub struct HandleStats {
    pub finalize_calls: AtomicUsize,
    pub live_contexts: AtomicUsize,
    pub runs: AtomicUsize,
    /// Runs attempted after the handle was finalized, double
    /// finalizations, and finalizations with live contexts. Any
    /// non-zero value means a native use-after-free would have
    /// occurred.
    pub violations: AtomicUsize,
}

/// Scriptable, counting implementation of the native boundary.
#[derive(Default)]
pub struct CountingBinding {
    handles: Arc<Mutex<Vec<Arc<HandleStats>>>>,
    builder_finalizes: Arc<AtomicUsize>,
}

impl CountingBinding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder_finalize_count(&self) -> usize {
        self.builder_finalizes.load(Ordering::SeqCst)
    }

    pub fn total_violations(&self) -> usize {
        self.handles
            .lock()
            .expect("stats lock")
            .iter()
            .map(|stats| stats.violations.load(Ordering::SeqCst))
            .sum()
    }

    pub fn handle_stats(&self) -> Vec<Arc<HandleStats>> {
        self.handles.lock().expect("stats lock").clone()
    }
}

impl NativeBinding for CountingBinding {
    fn version(&self) -> &str {
        "counting-fake/0.0.0"
    }

    fn new_builder(
        &self,
        _obfuscator: &ObfuscatorConfig,
    ) -> Result<Box<dyn NativeBuilder>, NativeError> {
        Ok(Box::new(CountingBuilder {
            handles: Arc::clone(&self.handles),
            finalizes: Arc::clone(&self.builder_finalizes),
            configs: BTreeMap::new(),
        }))
    }
}

struct CountingBuilder {
    handles: Arc<Mutex<Vec<Arc<HandleStats>>>>,
    finalizes: Arc<AtomicUsize>,
    configs: BTreeMap<String, Value>,
}

impl NativeBuilder for CountingBuilder {
    fn add_or_update_config(
        &mut self,
        blob: &Value,
        path: &str,
    ) -> Result<Diagnostics, NativeError> {
        if !blob.is_object() {
            return Ok(Diagnostics {
                top_level_error: Some("invalid configuration type, expected 'map'".to_string()),
                ..Diagnostics::default()
            });
        }
        self.configs.insert(path.to_string(), blob.clone());
        Ok(Diagnostics {
            ruleset_version: blob
                .get("metadata")
                .and_then(|m| m.get("rules_version"))
                .and_then(Value::as_str)
                .map(str::to_string),
            ..Diagnostics::default()
        })
    }

    fn remove_config(&mut self, path: &str) -> bool {
        self.configs.remove(path).is_some()
    }

    fn build_handle(&mut self) -> Result<Box<dyn NativeHandle>, NativeError> {
        if self.configs.is_empty() {
            return Err(NativeError::InvalidConfig("no configuration loaded".to_string()));
        }
        if self
            .configs
            .values()
            .any(|blob| blob.get("__fail_build").is_some())
        {
            return Err(NativeError::InvalidConfig("scripted build failure".to_string()));
        }

        let stats = Arc::new(HandleStats::default());
        self.handles
            .lock()
            .expect("stats lock")
            .push(Arc::clone(&stats));
        Ok(Box::new(CountingHandle { stats }))
    }

    fn finalize(&mut self) {
        self.finalizes.fetch_add(1, Ordering::SeqCst);
        self.configs.clear();
    }
}

struct CountingHandle {
    stats: Arc<HandleStats>,
}

impl NativeHandle for CountingHandle {
    fn known_addresses(&self) -> Vec<String> {
        vec!["user.id".to_string(), "force.status".to_string()]
    }

    fn new_context(&self) -> Box<dyn NativeContext> {
        self.stats.live_contexts.fetch_add(1, Ordering::SeqCst);
        Box::new(CountingContext {
            stats: Arc::clone(&self.stats),
            finalized: false,
        })
    }

    fn finalize(&self) {
        if self.stats.live_contexts.load(Ordering::SeqCst) != 0 {
            self.stats.violations.fetch_add(1, Ordering::SeqCst);
        }
        if self.stats.finalize_calls.fetch_add(1, Ordering::SeqCst) != 0 {
            self.stats.violations.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct CountingContext {
    stats: Arc<HandleStats>,
    finalized: bool,
}

impl NativeContext for CountingContext {
    fn run(
        &mut self,
        persistent: &InputMap,
        ephemeral: &InputMap,
        _timeout: Duration,
    ) -> Result<RawRunOutcome, NativeError> {
        if self.stats.finalize_calls.load(Ordering::SeqCst) != 0 {
            // The handle backing this context is gone.
            self.stats.violations.fetch_add(1, Ordering::SeqCst);
        }
        self.stats.runs.fetch_add(1, Ordering::SeqCst);

        let forced = persistent
            .get("force.status")
            .or_else(|| ephemeral.get("force.status"))
            .and_then(Value::as_str);
        let status = match forced {
            Some("match") => RunStatus::Match,
            Some("err_internal") => RunStatus::ErrInternal,
            Some("err_invalid_object") => RunStatus::ErrInvalidObject,
            _ => RunStatus::Ok,
        };

        Ok(RawRunOutcome {
            status,
            keep: status == RunStatus::Match,
            duration_ns: 1,
            ..RawRunOutcome::default()
        })
    }

    fn finalize(&mut self) {
        if !self.finalized {
            self.finalized = true;
            self.stats.live_contexts.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Telemetry sink that records everything it is handed.
#[derive(Default)]
pub struct CapturingTelemetry {
    pub errors: Mutex<Vec<String>>,
    pub reports: Mutex<Vec<String>>,
    pub metrics: Mutex<Vec<(String, u64, Vec<(String, String)>)>>,
}

impl CapturingTelemetry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn metric_total(&self, name: &str) -> u64 {
        self.metrics
            .lock()
            .expect("metrics lock")
            .iter()
            .filter(|(metric, _, _)| metric == name)
            .map(|(_, value, _)| value)
            .sum()
    }

    pub fn metric_tagged(&self, name: &str, tag: (&str, &str)) -> u64 {
        self.metrics
            .lock()
            .expect("metrics lock")
            .iter()
            .filter(|(metric, _, tags)| {
                metric == name && tags.iter().any(|(k, v)| k == tag.0 && v == tag.1)
            })
            .map(|(_, value, _)| value)
            .sum()
    }
}

impl palisade::telemetry::TelemetrySink for CapturingTelemetry {
    fn error(&self, message: &str) {
        self.errors.lock().expect("errors lock").push(message.to_string());
    }

    fn report(&self, error: &(dyn std::error::Error + 'static), description: &str) {
        self.reports
            .lock()
            .expect("reports lock")
            .push(format!("{description}: {error}"));
    }

    fn inc(&self, _namespace: &str, metric: &str, value: u64, tags: &[(&str, &str)]) {
        self.metrics.lock().expect("metrics lock").push((
            metric.to_string(),
            value,
            tags.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ));
    }
}
