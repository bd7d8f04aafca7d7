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

//! Engine configuration.
//!
//! All knobs are carried in an explicit struct handed to
//! [`crate::engine::Engine::build`]; nothing in the hot path reads
//! ambient global state.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::env;
use std::time::Duration;

/// Redaction patterns applied to match data before it leaves the
/// engine. Keys or values matching these regexes are replaced with a
/// `<Redacted>` marker in reported events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObfuscatorConfig {
    pub key_regex: String,
    pub value_regex: String,
}

impl Default for ObfuscatorConfig {
    fn default() -> Self {
        Self {
            key_regex: r"(?i)pass(word)?|pwd|secret|token|api[_-]?key|authorization|bearer"
                .to_string(),
            value_regex: r"(?i)bearer\s+[a-z0-9._\-]{8,}".to_string(),
        }
    }
}

/// Whether a keyed rate limiter budget is shared process-wide or kept
/// per calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum LimiterScope {
    Global,
    PerThread,
}

impl LimiterScope {
    pub fn parse_safe(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "per_thread" | "thread" => LimiterScope::PerThread,
            _ => LimiterScope::Global,
        }
    }
}

/// One configuration source merged into the builder at engine build
/// time: IP/user denylists, passlists, scanners, processors. Blobs are
/// opaque to this layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    pub path: String,
    pub blob: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Redaction patterns for reported match data.
    pub obfuscator: ObfuscatorConfig,
    /// Base ruleset loaded under the default configuration path.
    pub default_ruleset: Value,
    /// Additional configuration sources merged at build time.
    pub bundled_configs: Vec<ConfigSource>,
    /// Deadline handed to the native evaluation call.
    pub waf_timeout: Duration,
    /// Ceiling on security events attached to traces, per second.
    pub trace_rate_limit: u32,
    /// Whether rate limiter budgets are global or per thread.
    pub limiter_scope: LimiterScope,
    /// Fraction of schema-extraction calls that actually run the
    /// engine; the rest return immediately.
    pub schema_sample_rate: f64,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            waf_timeout: env::var("PALISADE_WAF_TIMEOUT_US")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_micros)
                .unwrap_or(defaults.waf_timeout),
            trace_rate_limit: env::var("PALISADE_TRACE_RATE_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.trace_rate_limit),
            limiter_scope: env::var("PALISADE_LIMITER_SCOPE")
                .map(|v| LimiterScope::parse_safe(&v))
                .unwrap_or(defaults.limiter_scope),
            schema_sample_rate: env::var("PALISADE_SCHEMA_SAMPLE_RATE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.schema_sample_rate),
            obfuscator: ObfuscatorConfig {
                key_regex: env::var("PALISADE_OBFUSCATOR_KEY_REGEX")
                    .unwrap_or(defaults.obfuscator.key_regex),
                value_regex: env::var("PALISADE_OBFUSCATOR_VALUE_REGEX")
                    .unwrap_or(defaults.obfuscator.value_regex),
            },
            default_ruleset: defaults.default_ruleset,
            bundled_configs: defaults.bundled_configs,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            obfuscator: ObfuscatorConfig::default(),
            default_ruleset: default_ruleset(),
            bundled_configs: Vec::new(),
            waf_timeout: Duration::from_micros(5_000),
            trace_rate_limit: 100,
            limiter_scope: LimiterScope::Global,
            schema_sample_rate: 0.1,
        }
    }
}

/// Minimal bundled ruleset used when no base rules are supplied by the
/// control plane.
pub fn default_ruleset() -> Value {
    json!({
        "version": "2.2",
        "metadata": { "rules_version": "1.0.0" },
        "rules": [
            {
                "id": "pal-blk-001",
                "name": "Blocked user identifier",
                "tags": { "type": "block_user", "category": "security_response" },
                "conditions": [
                    {
                        "operator": "exact_match",
                        "parameters": {
                            "inputs": [{ "address": "usr.id" }],
                            "list": ["blocked-user"]
                        }
                    }
                ],
                "on_match": ["block"]
            },
            {
                "id": "pal-ua-001",
                "name": "Security scanner user agent",
                "tags": { "type": "attack_tool", "category": "attack_attempt" },
                "conditions": [
                    {
                        "operator": "match_regex",
                        "parameters": {
                            "inputs": [{ "address": "server.request.headers.no_cookies" }],
                            "regex": "(?i)(nikto|sqlmap|nessus|arachni)"
                        }
                    }
                ],
                "on_match": []
            }
        ]
    })
}
