//! Layered configuration loading for the loader control plane.
//!
//! YAML files are deep-merged in order, canonicalized to stable-key-order
//! JSON, and hashed so the resolved configuration can be logged/compared
//! without ever logging secret material (see [`secrets`]).

pub mod secrets;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;

/// Process-level engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "EngineConfig::default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
    #[serde(default = "EngineConfig::default_executor_pool_size")]
    pub executor_pool_size: usize,
    #[serde(default = "EngineConfig::default_executor_run_timeout_seconds")]
    pub executor_run_timeout_seconds: u64,
    #[serde(default = "EngineConfig::default_failure_auto_recovery_minutes")]
    pub failure_auto_recovery_minutes: u64,
    #[serde(default = "EngineConfig::default_zero_record_alert_threshold")]
    pub zero_record_alert_threshold: u64,
    #[serde(default = "EngineConfig::default_connection_acquire_timeout_seconds")]
    pub connection_acquire_timeout_seconds: u64,
}

impl EngineConfig {
    fn default_sweep_interval_seconds() -> u64 {
        30
    }
    fn default_executor_pool_size() -> usize {
        8
    }
    fn default_executor_run_timeout_seconds() -> u64 {
        300
    }
    fn default_failure_auto_recovery_minutes() -> u64 {
        20
    }
    fn default_zero_record_alert_threshold() -> u64 {
        100
    }
    fn default_connection_acquire_timeout_seconds() -> u64 {
        10
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sweep_interval_seconds: Self::default_sweep_interval_seconds(),
            executor_pool_size: Self::default_executor_pool_size(),
            executor_run_timeout_seconds: Self::default_executor_run_timeout_seconds(),
            failure_auto_recovery_minutes: Self::default_failure_auto_recovery_minutes(),
            zero_record_alert_threshold: Self::default_zero_record_alert_threshold(),
            connection_acquire_timeout_seconds: Self::default_connection_acquire_timeout_seconds(),
        }
    }
}

/// Load + merge YAML files in order, then canonicalize to JSON and hash.
/// Later files override earlier files via deep-merge.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for p in paths {
        let s = fs::read_to_string(p).with_context(|| format!("read config: {p}"))?;
        let yaml_val: serde_yaml::Value =
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml: {p}"))?;
        let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
        deep_merge(&mut merged, json_val);
    }

    let canonical = canonicalize_json(&merged);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    let config_json: Value =
        serde_json::from_str(&canonical).context("canonical json parse failed")?;

    let engine: EngineConfig = serde_json::from_value(config_json.clone())
        .context("config does not match EngineConfig shape")?;

    Ok(LoadedConfig {
        engine,
        config_json,
        canonical_json: canonical,
        config_hash: hash,
    })
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub engine: EngineConfig,
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

/// Deep-merge: objects merge recursively; arrays replaced; scalars overwritten.
fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

/// Canonicalize JSON by sorting all object keys recursively and emitting compact JSON.
fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_defaults_match_spec() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.sweep_interval_seconds, 30);
        assert_eq!(cfg.failure_auto_recovery_minutes, 20);
        assert_eq!(cfg.zero_record_alert_threshold, 100);
    }

    #[test]
    fn deep_merge_overrides_scalars_and_merges_objects() {
        let mut a = serde_json::json!({"sweep_interval_seconds": 30, "nested": {"x": 1}});
        let b = serde_json::json!({"sweep_interval_seconds": 45, "nested": {"y": 2}});
        deep_merge(&mut a, b);
        assert_eq!(a["sweep_interval_seconds"], 45);
        assert_eq!(a["nested"]["x"], 1);
        assert_eq!(a["nested"]["y"], 2);
    }

    #[test]
    fn canonicalize_json_sorts_keys() {
        let v = serde_json::json!({"b": 1, "a": 2});
        assert_eq!(canonicalize_json(&v), r#"{"a":2,"b":1}"#);
    }
}
