//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`Settings::default()`]
//! 2. If `~/.helm/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `HELM_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use helm_core::models::SelectedModel;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::Settings;

/// `~/.helm`, or `/tmp/.helm` without a home directory.
pub fn helm_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".helm")
}

/// Resolve the path to the settings file (`~/.helm/settings.json`).
pub fn settings_path() -> PathBuf {
    helm_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<Settings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<Settings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Defaults merged with the file at `path`, without env overrides.
pub fn load_file_layer(path: &Path) -> Result<Settings> {
    let defaults = serde_json::to_value(Settings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `HELM_*` environment variable overrides. Invalid values are logged
/// and ignored.
pub fn apply_env_overrides(settings: &mut Settings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Same as [`apply_env_overrides`] with an injectable lookup.
pub fn apply_overrides_from(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    let string = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    if let Some(v) = string("HELM_LARGE_MODEL") {
        match SelectedModel::parse(&v, &settings.models.large.provider) {
            Some(m) => settings.models.large = m,
            None => warn!(key = "HELM_LARGE_MODEL", value = %v, "invalid model env var, ignoring"),
        }
    }
    if let Some(v) = string("HELM_SMALL_MODEL") {
        match SelectedModel::parse(&v, &settings.models.small.provider) {
            Some(m) => settings.models.small = m,
            None => warn!(key = "HELM_SMALL_MODEL", value = %v, "invalid model env var, ignoring"),
        }
    }
    if let Some(v) = string("HELM_MAX_TURNS") {
        match parse_u32_range(&v, 1, 10_000) {
            Some(n) => settings.agent.max_turns = n,
            None => warn!(key = "HELM_MAX_TURNS", value = %v, "invalid u32 env var, ignoring"),
        }
    }
    if let Some(v) = string("HELM_DISABLE_AUTO_SUMMARIZE") {
        match parse_bool(&v) {
            Some(b) => settings.agent.disable_auto_summarize = b,
            None => {
                warn!(key = "HELM_DISABLE_AUTO_SUMMARIZE", value = %v, "invalid boolean env var, ignoring")
            }
        }
    }
    if let Some(v) = string("HELM_LOG_LEVEL") {
        match v.to_lowercase().as_str() {
            level @ ("trace" | "debug" | "info" | "warn" | "error") => {
                settings.logging.level = level.to_string();
            }
            _ => warn!(key = "HELM_LOG_LEVEL", value = %v, "invalid log level env var, ignoring"),
        }
    }
    if let Some(v) = string("HELM_LOG_JSON") {
        match parse_bool(&v) {
            Some(b) => settings.logging.json = b,
            None => warn!(key = "HELM_LOG_JSON", value = %v, "invalid boolean env var, ignoring"),
        }
    }
    if let Some(v) = string("HELM_DATA_DIR") {
        settings.data_dir = Some(v);
    }
    if let Some(v) = string("HELM_BASE_URL") {
        settings.provider.base_url = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use std::collections::HashMap;

    fn temp_settings(content: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("helm_settings_{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        std::fs::write(&path, content).unwrap();
        path
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"agent": {"maxTurns": 50, "toolTimeoutMs": 1}});
        let source = serde_json::json!({"agent": {"maxTurns": 5}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["agent"]["maxTurns"], 5);
        assert_eq!(merged["agent"]["toolTimeoutMs"], 1);
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"items": [1, 2, 3]});
        let source = serde_json::json!({"items": [4]});
        assert_eq!(deep_merge(target, source)["items"], serde_json::json!([4]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let target = serde_json::json!({"a": {"nested": true}});
        let source = serde_json::json!({"a": 42});
        assert_eq!(deep_merge(target, source)["a"], 42);
    }

    // ── file loading ────────────────────────────────────────────────

    #[test]
    fn missing_file_returns_defaults() {
        let settings = load_file_layer(Path::new("/nonexistent/helm/settings.json")).unwrap();
        assert_eq!(settings.agent.max_turns, Settings::default().agent.max_turns);
    }

    #[test]
    fn partial_file_overrides() {
        let path = temp_settings(
            r#"{"models": {"large": {"provider": "openrouter", "model": "x/y"}},
                "retry": {"maxRetries": 7},
                "subagents": [{"name": "reviewer", "description": "Reviews code"}]}"#,
        );
        let settings = load_file_layer(&path).unwrap();
        assert_eq!(settings.models.large, SelectedModel::new("openrouter", "x/y"));
        assert_eq!(settings.models.small, Settings::default().models.small);
        assert_eq!(settings.retry.max_retries, 7);
        assert_eq!(settings.retry.base_delay_ms, 1000);
        assert_eq!(settings.subagents.len(), 1);
    }

    #[test]
    fn invalid_json_returns_error() {
        let path = temp_settings("not valid json");
        assert!(matches!(load_file_layer(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn invalid_file_values_fail_validation() {
        let path = temp_settings(r#"{"agent": {"maxParallelTools": 0}}"#);
        let mut settings = load_file_layer(&path).unwrap();
        apply_overrides_from(&mut settings, env(&[]));
        assert!(settings.validate().is_err());
    }

    // ── env overrides ───────────────────────────────────────────────

    #[test]
    fn env_overrides_apply() {
        let mut s = Settings::default();
        apply_overrides_from(
            &mut s,
            env(&[
                ("HELM_LARGE_MODEL", "openrouter/anthropic/claude"),
                ("HELM_SMALL_MODEL", "gpt-4.1-nano"),
                ("HELM_MAX_TURNS", "12"),
                ("HELM_DISABLE_AUTO_SUMMARIZE", "yes"),
                ("HELM_LOG_LEVEL", "DEBUG"),
                ("HELM_LOG_JSON", "1"),
                ("HELM_DATA_DIR", "/var/helm"),
                ("HELM_BASE_URL", "http://localhost:4000/v1"),
            ]),
        );
        assert_eq!(s.models.large, SelectedModel::new("openrouter", "anthropic/claude"));
        assert_eq!(s.models.small, SelectedModel::new("openai", "gpt-4.1-nano"));
        assert_eq!(s.agent.max_turns, 12);
        assert!(s.agent.disable_auto_summarize);
        assert_eq!(s.logging.level, "debug");
        assert!(s.logging.json);
        assert_eq!(s.data_dir(), PathBuf::from("/var/helm"));
        assert_eq!(s.provider.base_url, "http://localhost:4000/v1");
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut s = Settings::default();
        apply_overrides_from(
            &mut s,
            env(&[
                ("HELM_MAX_TURNS", "0"),
                ("HELM_DISABLE_AUTO_SUMMARIZE", "maybe"),
                ("HELM_LOG_LEVEL", "loud"),
                ("HELM_LARGE_MODEL", "/"),
            ]),
        );
        let d = Settings::default();
        assert_eq!(s.agent.max_turns, d.agent.max_turns);
        assert!(!s.agent.disable_auto_summarize);
        assert_eq!(s.logging.level, "info");
        assert_eq!(s.models.large, d.models.large);
    }

    #[test]
    fn parse_bool_variants() {
        for val in ["true", "1", "yes", "ON"] {
            assert_eq!(parse_bool(val), Some(true), "failed for {val}");
        }
        for val in ["false", "0", "no", "Off"] {
            assert_eq!(parse_bool(val), Some(false), "failed for {val}");
        }
        assert_eq!(parse_bool("2"), None);
    }

    #[test]
    fn parse_u32_bounds() {
        assert_eq!(parse_u32_range("5", 1, 10), Some(5));
        assert_eq!(parse_u32_range("0", 1, 10), None);
        assert_eq!(parse_u32_range("11", 1, 10), None);
        assert_eq!(parse_u32_range("x", 1, 10), None);
    }
}
