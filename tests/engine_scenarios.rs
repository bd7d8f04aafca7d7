//! End-to-end scenarios against the builtin rule matcher.

mod common;

use common::CapturingTelemetry;
use palisade::config::{EngineConfig, LimiterScope, ObfuscatorConfig};
use palisade::engine::{Engine, DEFAULT_RULESET_PATH};
use palisade::errors::{EngineError, NativeError};
use palisade::native::builtin::BuiltinBinding;
use palisade::native::{InputMap, NativeBinding, NativeBuilder};
use palisade::rate_limiter::RateLimiters;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn attacker_ruleset() -> Value {
    json!({
        "version": "2.2",
        "metadata": { "rules_version": "1.0.0" },
        "rules": [{
            "id": "ua0-600-12x",
            "name": "Known attacker identifier",
            "tags": { "type": "block_user", "category": "security_response" },
            "conditions": [{
                "operator": "exact_match",
                "parameters": { "inputs": [{ "address": "user.id" }], "list": ["attacker"] }
            }],
            "on_match": ["block"]
        }]
    })
}

fn engine_with(config: EngineConfig) -> Engine {
    common::init_tracing();
    Engine::build(&config, Arc::new(BuiltinBinding::new()), CapturingTelemetry::new())
        .expect("engine builds")
}

fn attacker_engine() -> Engine {
    engine_with(EngineConfig {
        default_ruleset: attacker_ruleset(),
        ..EngineConfig::default()
    })
}

#[test]
fn matches_attacker_and_passes_alice() {
    let engine = attacker_engine();

    let runner = engine.new_runner().expect("runner");
    let result = runner.run(
        InputMap::from([("user.id".to_string(), json!("attacker"))]),
        InputMap::new(),
        Duration::from_micros(5_000_000),
    );
    assert!(result.is_match());
    assert!(!result.is_error());
    assert!(!result.events().is_empty());
    assert!(result.actions().is_some_and(|a| a.contains_key("block_request")));
    assert!(result.keep());
    runner.finalize();

    let runner = engine.new_runner().expect("runner");
    let result = runner.run(
        InputMap::from([("user.id".to_string(), json!("alice"))]),
        InputMap::new(),
        Duration::from_micros(5_000_000),
    );
    assert!(!result.is_match());
    assert!(!result.is_error());
    assert!(result.events().is_empty());
    runner.finalize();
}

#[test]
fn external_duration_includes_marshaling_overhead() {
    let engine = attacker_engine();
    let runner = engine.new_runner().expect("runner");
    let result = runner.run(
        InputMap::from([("user.id".to_string(), json!("attacker"))]),
        InputMap::new(),
        Duration::from_secs(1),
    );
    assert!(result.duration_ext_ns() >= result.duration_ns());
    assert!(result.duration_ext_ns() > 0);
    runner.finalize();
}

#[test]
fn failed_rebuild_keeps_the_previous_configuration() {
    let engine = attacker_engine();
    assert_eq!(engine.ruleset_version().as_deref(), Some("1.0.0"));
    let addresses_before = engine.known_addresses();

    // A non-map blob is rejected wholesale at the config-load stage.
    let err = engine.rebuild(&json!(""), "remote/broken").unwrap_err();
    assert!(matches!(err, EngineError::ConfigLoadFailed { .. }));

    assert_eq!(engine.ruleset_version().as_deref(), Some("1.0.0"));
    assert_eq!(engine.known_addresses(), addresses_before);

    // The engine still evaluates against the original rules.
    let runner = engine.new_runner().expect("runner");
    let result = runner.run(
        InputMap::from([("user.id".to_string(), json!("attacker"))]),
        InputMap::new(),
        Duration::from_secs(1),
    );
    assert!(result.is_match());
    runner.finalize();
}

#[test]
fn successful_rebuild_changes_evaluation_behavior() {
    let engine = attacker_engine();

    let mut updated = attacker_ruleset();
    updated["metadata"]["rules_version"] = json!("1.1.0");
    updated["rules"][0]["conditions"][0]["parameters"]["list"] = json!(["intruder"]);
    engine.rebuild(&updated, DEFAULT_RULESET_PATH).expect("rebuild");
    assert_eq!(engine.ruleset_version().as_deref(), Some("1.1.0"));

    let runner = engine.new_runner().expect("runner");
    let old = runner.run(
        InputMap::from([("user.id".to_string(), json!("attacker"))]),
        InputMap::new(),
        Duration::from_secs(1),
    );
    assert!(!old.is_match());
    runner.finalize();

    let runner = engine.new_runner().expect("runner");
    let new = runner.run(
        InputMap::from([("user.id".to_string(), json!("intruder"))]),
        InputMap::new(),
        Duration::from_secs(1),
    );
    assert!(new.is_match());
    runner.finalize();
}

#[test]
fn remove_config_reverts_to_remaining_sources() {
    let engine = attacker_engine();

    let mut extra = attacker_ruleset();
    extra["metadata"]["rules_version"] = json!("9.9.9");
    extra["rules"][0]["id"] = json!("extra-rule");
    extra["rules"][0]["conditions"][0]["parameters"]["list"] = json!(["mallory"]);
    engine.rebuild(&extra, "remote/extra").expect("rebuild");

    let runner = engine.new_runner().expect("runner");
    assert!(runner
        .run(
            InputMap::from([("user.id".to_string(), json!("mallory"))]),
            InputMap::new(),
            Duration::from_secs(1),
        )
        .is_match());
    runner.finalize();

    assert!(engine.remove_config("remote/extra").expect("remove").is_some());
    let runner = engine.new_runner().expect("runner");
    assert!(!runner
        .run(
            InputMap::from([("user.id".to_string(), json!("mallory"))]),
            InputMap::new(),
            Duration::from_secs(1),
        )
        .is_match());
    runner.finalize();

    // Unknown paths are reported as absent, nothing is swapped.
    assert!(engine.remove_config("remote/unknown").expect("remove").is_none());
}

#[test]
fn removing_the_last_ruleset_fails_and_keeps_current() {
    let engine = attacker_engine();

    let err = engine.remove_config(DEFAULT_RULESET_PATH).unwrap_err();
    assert!(matches!(err, EngineError::HandleBuildFailed { .. }));

    // Previous handle is untouched and still matching.
    let runner = engine.new_runner().expect("runner");
    assert!(runner
        .run(
            InputMap::from([("user.id".to_string(), json!("attacker"))]),
            InputMap::new(),
            Duration::from_secs(1),
        )
        .is_match());
    runner.finalize();
}

#[test]
fn schema_extraction_respects_sampling() {
    let always = engine_with(EngineConfig {
        default_ruleset: attacker_ruleset(),
        schema_sample_rate: 1.0,
        ..EngineConfig::default()
    });
    let runner = always.new_runner().expect("runner");
    runner.run(
        InputMap::from([("user.id".to_string(), json!("alice"))]),
        InputMap::new(),
        Duration::from_secs(1),
    );
    let result = runner.extract_schema();
    assert!(!result.is_error());
    assert!(result
        .attributes()
        .is_some_and(|attrs| attrs.contains_key("_dd.appsec.s.req")));
    runner.finalize();

    let never = engine_with(EngineConfig {
        default_ruleset: attacker_ruleset(),
        schema_sample_rate: 0.0,
        ..EngineConfig::default()
    });
    let runner = never.new_runner().expect("runner");
    let result = runner.extract_schema();
    assert!(!result.is_error());
    // Not sampled in: no native call, zero-cost timings.
    assert_eq!(result.duration_ext_ns(), 0);
    assert!(result.attributes().is_some_and(|attrs| attrs.is_empty()));
    runner.finalize();
}

#[test]
fn run_after_finalize_is_a_contract_violation() {
    let engine = attacker_engine();
    let runner = engine.new_runner().expect("runner");
    runner.finalize();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        runner.run(InputMap::new(), InputMap::new(), Duration::from_secs(1))
    }));
    match result {
        // Release builds: contained as an error result.
        Ok(outcome) => assert!(outcome.is_error()),
        // Debug builds: the debug_assert fired.
        Err(_) => {}
    }
    // Repeated finalize is a no-op.
    runner.finalize();
}

#[test]
fn runner_exposes_handle_metadata() {
    let engine = attacker_engine();
    let runner = engine.new_runner().expect("runner");
    assert_eq!(runner.ruleset_version(), Some("1.0.0"));
    assert!(runner.known_addresses().contains(&"user.id".to_string()));
    runner.finalize();
}

#[test]
fn build_failure_reports_telemetry_and_disables_the_feature() {
    let telemetry = CapturingTelemetry::new();
    let config = EngineConfig {
        // No usable rules: handle build fails.
        default_ruleset: json!({}),
        ..EngineConfig::default()
    };
    let err = Engine::build(
        &config,
        Arc::new(BuiltinBinding::new()),
        Arc::clone(&telemetry) as Arc<dyn palisade::telemetry::TelemetrySink>,
    )
    .unwrap_err();

    assert!(matches!(err, EngineError::HandleBuildFailed { .. }));
    assert_eq!(telemetry.metric_tagged("waf.init", ("success", "false")), 1);
    assert_eq!(telemetry.metric_tagged("waf.init", ("success", "true")), 0);
    assert!(!telemetry.reports.lock().expect("reports").is_empty());
}

#[test]
fn unavailable_binding_is_a_typed_fatal_error() {
    struct UnavailableBinding;

    impl NativeBinding for UnavailableBinding {
        fn version(&self) -> &str {
            "unavailable/0"
        }

        fn new_builder(
            &self,
            _obfuscator: &ObfuscatorConfig,
        ) -> Result<Box<dyn NativeBuilder>, NativeError> {
            Err(NativeError::BindingUnavailable(
                "no prebuilt library for this platform".to_string(),
            ))
        }
    }

    let err = Engine::build(
        &EngineConfig::default(),
        Arc::new(UnavailableBinding),
        CapturingTelemetry::new(),
    )
    .unwrap_err();
    assert!(matches!(err, EngineError::BindingUnavailable { .. }));
}

#[test]
fn successful_init_reports_rules_version() {
    let telemetry = CapturingTelemetry::new();
    Engine::build(
        &EngineConfig {
            default_ruleset: attacker_ruleset(),
            ..EngineConfig::default()
        },
        Arc::new(BuiltinBinding::new()),
        Arc::clone(&telemetry) as Arc<dyn palisade::telemetry::TelemetrySink>,
    )
    .expect("engine builds");

    assert_eq!(telemetry.metric_tagged("waf.init", ("success", "true")), 1);
    assert_eq!(
        telemetry.metric_tagged("waf.init", ("event_rules_version", "1.0.0")),
        1
    );
}

#[test]
fn update_metrics_carry_the_rules_version() {
    let telemetry = CapturingTelemetry::new();
    let engine = Engine::build(
        &EngineConfig {
            default_ruleset: attacker_ruleset(),
            ..EngineConfig::default()
        },
        Arc::new(BuiltinBinding::new()),
        Arc::clone(&telemetry) as Arc<dyn palisade::telemetry::TelemetrySink>,
    )
    .expect("engine builds");

    let mut updated = attacker_ruleset();
    updated["metadata"]["rules_version"] = json!("1.1.0");
    engine.rebuild(&updated, DEFAULT_RULESET_PATH).expect("rebuild");
    assert_eq!(
        telemetry.metric_tagged("waf.updates", ("event_rules_version", "1.1.0")),
        1
    );
    assert_eq!(telemetry.metric_tagged("waf.updates", ("success", "true")), 1);

    // A rejected blob carries no version of its own; the error metric
    // reports the diagnostics' empty version alongside the failure.
    engine.rebuild(&json!(""), "remote/broken").unwrap_err();
    assert_eq!(
        telemetry.metric_tagged("waf.config_errors", ("event_rules_version", "")),
        1
    );
}

#[test]
fn trace_emission_is_rate_limited() {
    let engine = attacker_engine();
    let limiters = RateLimiters::new(2, LimiterScope::Global);

    let mut emitted = 0;
    for _ in 0..5 {
        let runner = engine.new_runner().expect("runner");
        let result = runner.run(
            InputMap::from([("user.id".to_string(), json!("attacker"))]),
            InputMap::new(),
            Duration::from_secs(1),
        );
        if result.is_match() {
            if limiters.limit("security-traces", || ()).is_some() {
                emitted += 1;
            }
        }
        runner.finalize();
    }

    // Five matches inside one window, budget of two.
    assert_eq!(emitted, 2);
}
