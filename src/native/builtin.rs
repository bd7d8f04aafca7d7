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

//! Built-in rule matcher.
//!
//! A small, self-contained implementation of the native boundary:
//! per-path configuration merging, `exact_match`/`phrase_match`/
//! `match_regex` operators over address-keyed inputs, obfuscation of
//! reported match data, and input truncation limits. It exists so the
//! crate has one production [`NativeBinding`] that works on every
//! platform; an FFI-backed binding would slot in behind the same
//! traits.

use crate::config::ObfuscatorConfig;
use crate::errors::NativeError;
use crate::native::{
    Diagnostics, InputMap, NativeBinding, NativeBuilder, NativeContext, NativeHandle,
    RawRunOutcome, RunStatus, SectionReport,
};
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Address reserved for processor activation inputs (e.g. schema
/// extraction); always part of the known addresses.
pub const PROCESSOR_ADDRESS: &str = "waf.context.processor";

/// Attribute key under which extracted request schemas are reported.
pub const SCHEMA_ATTRIBUTE: &str = "_dd.appsec.s.req";

const REDACTED: &str = "<Redacted>";

const MAX_STRING_LEN: usize = 4096;
const MAX_CONTAINER_SIZE: usize = 256;
const MAX_DEPTH: usize = 20;

const RULE_SECTIONS: [&str; 2] = ["rules", "custom_rules"];
const DATA_SECTIONS: [&str; 4] = ["exclusions", "rules_data", "scanners", "processors"];

pub struct BuiltinBinding;

impl BuiltinBinding {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BuiltinBinding {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeBinding for BuiltinBinding {
    fn version(&self) -> &str {
        "builtin/1.0.0"
    }

    fn new_builder(
        &self,
        obfuscator: &ObfuscatorConfig,
    ) -> Result<Box<dyn NativeBuilder>, NativeError> {
        let obfuscator = Obfuscator::compile(obfuscator)?;
        Ok(Box::new(BuiltinBuilder {
            obfuscator: Arc::new(obfuscator),
            configs: BTreeMap::new(),
        }))
    }
}

struct Obfuscator {
    key_regex: Regex,
    value_regex: Regex,
}

impl Obfuscator {
    fn compile(config: &ObfuscatorConfig) -> Result<Self, NativeError> {
        let key_regex = Regex::new(&config.key_regex)
            .map_err(|e| NativeError::InvalidConfig(format!("bad key obfuscation pattern: {e}")))?;
        let value_regex = Regex::new(&config.value_regex).map_err(|e| {
            NativeError::InvalidConfig(format!("bad value obfuscation pattern: {e}"))
        })?;
        Ok(Self { key_regex, value_regex })
    }

    fn redact(&self, address: &str, value: &str) -> String {
        if self.key_regex.is_match(address) || self.value_regex.is_match(value) {
            REDACTED.to_string()
        } else {
            value.to_string()
        }
    }
}

struct BuiltinBuilder {
    obfuscator: Arc<Obfuscator>,
    /// Accumulated configuration, keyed by path (last-write-wins).
    configs: BTreeMap<String, Value>,
}

impl NativeBuilder for BuiltinBuilder {
    fn add_or_update_config(
        &mut self,
        blob: &Value,
        path: &str,
    ) -> Result<Diagnostics, NativeError> {
        let Some(map) = blob.as_object() else {
            return Ok(Diagnostics {
                top_level_error: Some(format!(
                    "invalid configuration type, expected 'map', obtained '{}'",
                    json_type_name(blob)
                )),
                ..Diagnostics::default()
            });
        };

        let mut diagnostics = Diagnostics {
            ruleset_version: map
                .get("metadata")
                .and_then(|m| m.get("rules_version"))
                .and_then(Value::as_str)
                .map(str::to_string),
            ..Diagnostics::default()
        };

        for section in RULE_SECTIONS {
            if let Some(value) = map.get(section) {
                diagnostics
                    .sections
                    .insert(section.to_string(), validate_rule_section(value));
            }
        }
        for section in DATA_SECTIONS {
            if let Some(value) = map.get(section) {
                diagnostics
                    .sections
                    .insert(section.to_string(), validate_data_section(value));
            }
        }

        self.configs.insert(path.to_string(), blob.clone());
        Ok(diagnostics)
    }

    fn remove_config(&mut self, path: &str) -> bool {
        self.configs.remove(path).is_some()
    }

    fn build_handle(&mut self) -> Result<Box<dyn NativeHandle>, NativeError> {
        let mut rules: BTreeMap<String, CompiledRule> = BTreeMap::new();

        for blob in self.configs.values() {
            let Some(map) = blob.as_object() else { continue };
            for section in RULE_SECTIONS {
                let Some(items) = map.get(section).and_then(Value::as_array) else {
                    continue;
                };
                for item in items {
                    if let Some(rule) = CompiledRule::compile(item) {
                        rules.insert(rule.id.clone(), rule);
                    }
                }
            }
        }

        if rules.is_empty() {
            return Err(NativeError::InvalidConfig(
                "no usable rules in configuration".to_string(),
            ));
        }

        let mut addresses: BTreeSet<String> = rules
            .values()
            .flat_map(|r| r.conditions.iter())
            .flat_map(|c| c.addresses.iter().cloned())
            .collect();
        addresses.insert(PROCESSOR_ADDRESS.to_string());

        Ok(Box::new(BuiltinHandle {
            rules: Arc::new(rules.into_values().collect()),
            obfuscator: Arc::clone(&self.obfuscator),
            known_addresses: addresses.into_iter().collect(),
        }))
    }

    fn finalize(&mut self) {
        self.configs.clear();
    }
}

struct CompiledRule {
    id: String,
    name: String,
    tags: Value,
    conditions: Vec<CompiledCondition>,
    on_match: Vec<String>,
}

struct CompiledCondition {
    operator_name: String,
    addresses: Vec<String>,
    operator: Operator,
}

enum Operator {
    ExactMatch(Vec<String>),
    PhraseMatch(Vec<String>),
    MatchRegex(Regex),
}

impl Operator {
    fn matches(&self, candidate: &str) -> bool {
        match self {
            Operator::ExactMatch(list) => list.iter().any(|item| item == candidate),
            Operator::PhraseMatch(list) => list.iter().any(|item| candidate.contains(item)),
            Operator::MatchRegex(regex) => regex.is_match(candidate),
        }
    }
}

impl CompiledRule {
    /// Compiles one rule item; `None` for invalid items (already
    /// reported through diagnostics at load time).
    fn compile(item: &Value) -> Option<Self> {
        let map = item.as_object()?;
        let id = map.get("id")?.as_str()?.to_string();
        let conditions_raw = map.get("conditions")?.as_array()?;
        if conditions_raw.is_empty() {
            return None;
        }

        let mut conditions = Vec::with_capacity(conditions_raw.len());
        for condition in conditions_raw {
            conditions.push(CompiledCondition::compile(condition)?);
        }

        Some(Self {
            id,
            name: map
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            tags: map.get("tags").cloned().unwrap_or(Value::Null),
            conditions,
            on_match: map
                .get("on_match")
                .and_then(Value::as_array)
                .map(|actions| {
                    actions
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        })
    }
}

impl CompiledCondition {
    fn compile(condition: &Value) -> Option<Self> {
        let operator_name = condition.get("operator")?.as_str()?.to_string();
        let parameters = condition.get("parameters")?.as_object()?;
        let addresses: Vec<String> = collect_addresses(parameters);
        if addresses.is_empty() {
            return None;
        }

        let operator = match operator_name.as_str() {
            "exact_match" => Operator::ExactMatch(string_list(parameters.get("list")?)?),
            "phrase_match" => Operator::PhraseMatch(string_list(parameters.get("list")?)?),
            "match_regex" => {
                Operator::MatchRegex(Regex::new(parameters.get("regex")?.as_str()?).ok()?)
            }
            _ => return None,
        };

        Some(Self { operator_name, addresses, operator })
    }
}

/// Collects every `address` mentioned by a condition's parameters,
/// whatever the parameter key (`inputs`, `resource`, `params`, ...).
fn collect_addresses(parameters: &Map<String, Value>) -> Vec<String> {
    let mut addresses = Vec::new();
    for value in parameters.values() {
        if let Some(items) = value.as_array() {
            for item in items {
                if let Some(address) = item.get("address").and_then(Value::as_str) {
                    addresses.push(address.to_string());
                }
            }
        }
    }
    addresses
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    Some(
        value
            .as_array()?
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
    )
}

fn validate_rule_section(value: &Value) -> SectionReport {
    let Some(items) = value.as_array() else {
        return SectionReport {
            error: Some(format!(
                "bad cast, expected 'array', obtained '{}'",
                json_type_name(value)
            )),
            ..SectionReport::default()
        };
    };

    let mut report = SectionReport::default();
    for (index, item) in items.iter().enumerate() {
        let id = item
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("<unnamed:{index}>"));

        match rule_item_error(item) {
            None => report.loaded.push(id),
            Some(message) => {
                report.failed.push(id.clone());
                report.errors.entry(message).or_default().push(id);
            }
        }
    }
    report
}

fn rule_item_error(item: &Value) -> Option<String> {
    let map = item.as_object()?;
    if !map.contains_key("id") {
        return Some("missing key 'id'".to_string());
    }
    let Some(conditions) = map.get("conditions") else {
        return Some("missing key 'conditions'".to_string());
    };
    let Some(conditions) = conditions.as_array() else {
        return Some("bad cast, expected 'array' for key 'conditions'".to_string());
    };
    if conditions.is_empty() {
        return Some("missing key 'conditions'".to_string());
    }
    for condition in conditions {
        let Some(operator) = condition.get("operator").and_then(Value::as_str) else {
            return Some("missing key 'operator'".to_string());
        };
        let Some(parameters) = condition.get("parameters").and_then(Value::as_object) else {
            return Some("missing key 'parameters'".to_string());
        };
        if collect_addresses(parameters).is_empty() {
            return Some("missing key 'inputs'".to_string());
        }
        match operator {
            "exact_match" | "phrase_match" => {
                if parameters.get("list").and_then(Value::as_array).is_none() {
                    return Some("missing key 'list'".to_string());
                }
            }
            "match_regex" => match parameters.get("regex").and_then(Value::as_str) {
                None => return Some("missing key 'regex'".to_string()),
                Some(pattern) => {
                    if let Err(e) = Regex::new(pattern) {
                        return Some(format!("invalid regex: {e}"));
                    }
                }
            },
            other => return Some(format!("unknown operator '{other}'")),
        }
    }
    None
}

fn validate_data_section(value: &Value) -> SectionReport {
    let Some(items) = value.as_array() else {
        return SectionReport {
            error: Some(format!(
                "bad cast, expected 'array', obtained '{}'",
                json_type_name(value)
            )),
            ..SectionReport::default()
        };
    };

    let mut report = SectionReport::default();
    for (index, item) in items.iter().enumerate() {
        let id = item
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("<unnamed:{index}>"));
        report.loaded.push(id);
    }
    report
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "map",
    }
}

struct BuiltinHandle {
    rules: Arc<Vec<CompiledRule>>,
    obfuscator: Arc<Obfuscator>,
    known_addresses: Vec<String>,
}

impl NativeHandle for BuiltinHandle {
    fn known_addresses(&self) -> Vec<String> {
        self.known_addresses.clone()
    }

    fn new_context(&self) -> Box<dyn NativeContext> {
        Box::new(BuiltinContext {
            rules: Arc::clone(&self.rules),
            obfuscator: Arc::clone(&self.obfuscator),
            persistent: InputMap::new(),
            fired: HashSet::new(),
            finalized: false,
        })
    }

    fn finalize(&self) {
        // No OS-level resources to release.
    }
}

struct BuiltinContext {
    rules: Arc<Vec<CompiledRule>>,
    obfuscator: Arc<Obfuscator>,
    /// Persistent inputs accumulate across calls within one context.
    persistent: InputMap,
    /// Rules that already produced an event in this context.
    fired: HashSet<String>,
    finalized: bool,
}

impl NativeContext for BuiltinContext {
    fn run(
        &mut self,
        persistent: &InputMap,
        ephemeral: &InputMap,
        timeout: Duration,
    ) -> Result<RawRunOutcome, NativeError> {
        if self.finalized {
            return Err(NativeError::CallFailed("context already finalized".to_string()));
        }

        let started = Instant::now();
        let mut input_truncated = false;

        for (key, value) in persistent {
            let bounded = truncate_value(value, 0, &mut input_truncated);
            self.persistent.insert(key.clone(), bounded);
        }
        let mut ephemeral_view = InputMap::with_capacity(ephemeral.len());
        for (key, value) in ephemeral {
            let bounded = truncate_value(value, 0, &mut input_truncated);
            ephemeral_view.insert(key.clone(), bounded);
        }

        let mut events = Vec::new();
        let mut actions: HashMap<String, Value> = HashMap::new();
        let mut timed_out = false;

        for rule in self.rules.iter() {
            if started.elapsed() >= timeout {
                timed_out = true;
                break;
            }
            if self.fired.contains(&rule.id) {
                continue;
            }
            if let Some(matches) =
                evaluate_rule(rule, &ephemeral_view, &self.persistent, &self.obfuscator)
            {
                self.fired.insert(rule.id.clone());
                events.push(json!({
                    "rule": {
                        "id": rule.id,
                        "name": rule.name,
                        "tags": rule.tags,
                        "on_match": rule.on_match,
                    },
                    "rule_matches": matches,
                }));
                for action in &rule.on_match {
                    let (name, parameters) = action_parameters(action);
                    actions.insert(name, parameters);
                }
            }
        }

        let mut attributes = HashMap::new();
        if schema_extraction_requested(&ephemeral_view, &self.persistent) {
            attributes.insert(SCHEMA_ATTRIBUTE.to_string(), derive_schema(&self.persistent));
        }

        let matched = !events.is_empty();
        Ok(RawRunOutcome {
            status: if matched { RunStatus::Match } else { RunStatus::Ok },
            keep: matched,
            events,
            actions,
            attributes,
            timed_out,
            input_truncated,
            duration_ns: started.elapsed().as_nanos() as u64,
        })
    }

    fn finalize(&mut self) {
        self.persistent.clear();
        self.fired.clear();
        self.finalized = true;
    }
}

/// Ephemeral inputs shadow persistent ones under the same address.
fn lookup_address<'m>(
    ephemeral: &'m InputMap,
    persistent: &'m InputMap,
    address: &str,
) -> Option<&'m Value> {
    ephemeral.get(address).or_else(|| persistent.get(address))
}

/// All conditions must hold for a rule to match; a condition holds if
/// any of its addresses carries a matching value.
fn evaluate_rule(
    rule: &CompiledRule,
    ephemeral: &InputMap,
    persistent: &InputMap,
    obfuscator: &Obfuscator,
) -> Option<Vec<Value>> {
    let mut rule_matches = Vec::with_capacity(rule.conditions.len());
    for condition in &rule.conditions {
        let mut matched = None;
        for address in &condition.addresses {
            let Some(value) = lookup_address(ephemeral, persistent, address) else { continue };
            if let Some(hit) = first_matching_string(value, &condition.operator, 0) {
                matched = Some(json!({
                    "operator": condition.operator_name,
                    "parameters": [{
                        "address": address,
                        "value": obfuscator.redact(address, &hit),
                    }],
                }));
                break;
            }
        }
        rule_matches.push(matched?);
    }
    Some(rule_matches)
}

fn first_matching_string(value: &Value, operator: &Operator, depth: usize) -> Option<String> {
    if depth > MAX_DEPTH {
        return None;
    }
    match value {
        Value::String(s) => operator.matches(s).then(|| s.clone()),
        Value::Number(n) => {
            let rendered = n.to_string();
            operator.matches(&rendered).then_some(rendered)
        }
        Value::Array(items) => items
            .iter()
            .find_map(|item| first_matching_string(item, operator, depth + 1)),
        Value::Object(map) => map
            .values()
            .find_map(|item| first_matching_string(item, operator, depth + 1)),
        _ => None,
    }
}

fn action_parameters(action: &str) -> (String, Value) {
    if action == "block" {
        (
            "block_request".to_string(),
            json!({ "status_code": "403", "grpc_status_code": "10", "type": "auto" }),
        )
    } else {
        (action.to_string(), json!({}))
    }
}

fn schema_extraction_requested(ephemeral: &InputMap, persistent: &InputMap) -> bool {
    lookup_address(ephemeral, persistent, PROCESSOR_ADDRESS)
        .and_then(|v| v.get("extract-schema"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Maps every persistent address to a coarse type descriptor.
fn derive_schema(persistent: &InputMap) -> Value {
    let mut schema = Map::new();
    for (address, value) in persistent {
        if address == PROCESSOR_ADDRESS {
            continue;
        }
        schema.insert(address.clone(), Value::String(json_type_name(value).to_string()));
    }
    Value::Object(schema)
}

fn truncate_value(value: &Value, depth: usize, truncated: &mut bool) -> Value {
    if depth > MAX_DEPTH {
        *truncated = true;
        return Value::Null;
    }
    match value {
        Value::String(s) if s.chars().count() > MAX_STRING_LEN => {
            *truncated = true;
            Value::String(s.chars().take(MAX_STRING_LEN).collect())
        }
        Value::Array(items) => {
            if items.len() > MAX_CONTAINER_SIZE {
                *truncated = true;
            }
            Value::Array(
                items
                    .iter()
                    .take(MAX_CONTAINER_SIZE)
                    .map(|item| truncate_value(item, depth + 1, truncated))
                    .collect(),
            )
        }
        Value::Object(map) => {
            if map.len() > MAX_CONTAINER_SIZE {
                *truncated = true;
            }
            Value::Object(
                map.iter()
                    .take(MAX_CONTAINER_SIZE)
                    .map(|(k, v)| (k.clone(), truncate_value(v, depth + 1, truncated)))
                    .collect(),
            )
        }
        other => other.clone(),
    }
}
