//! Layered settings: compiled defaults, then the settings file, then
//! `TETHER_*` variables. The result is validated before it is returned.
//!
//! The file layer is overlaid key by key ([`overlay_json`]): nested objects
//! combine, anything else in the file wins outright, and a `null` in the
//! file leaves the lower layer untouched.

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::TetherSettings;

/// Source of environment values. Production uses the process environment;
/// tests pass a closure over a fixed map.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Resolve the path to the settings file (`~/.tether/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tether").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<TetherSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<TetherSettings> {
    load_settings_with_env(path, &|name: &str| std::env::var(name).ok())
}

/// Load settings from `path`, reading overrides through `env`.
pub fn load_settings_with_env(path: &Path, env: EnvLookup<'_>) -> Result<TetherSettings> {
    let defaults = serde_json::to_value(TetherSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        overlay_json(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: TetherSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, env);
    settings.validate()?;
    Ok(settings)
}

/// Lay `upper` over `lower`, descending into objects present in both.
pub fn overlay_json(lower: Value, upper: Value) -> Value {
    let (mut base, layer) = match (lower, upper) {
        (Value::Object(base), Value::Object(layer)) => (base, layer),
        (_, upper) => return upper,
    };
    for (key, value) in layer.into_iter().filter(|(_, v)| !v.is_null()) {
        let combined = match base.remove(&key) {
            Some(existing) => overlay_json(existing, value),
            None => value,
        };
        let _ = base.insert(key, combined);
    }
    Value::Object(base)
}

/// Apply environment variable overrides to loaded settings.
///
/// Integers must parse and fall inside their range, booleans accept
/// `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`, enums take their JSON
/// spelling. Invalid values are logged and ignored.
pub fn apply_env_overrides(settings: &mut TetherSettings, env: EnvLookup<'_>) {
    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_env_enum(env, "TETHER_TRANSPORT") {
        settings.server.transport = v;
    }
    if let Some(v) = read_env_string(env, "TETHER_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_in(env, "TETHER_PORT", 1..=65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_string(env, "TETHER_WS_PATH") {
        settings.server.websocket_path = v;
    }
    if let Some(v) = read_env_bool(env, "TETHER_WS_FRAME_HEADERS") {
        settings.server.ws_frame_headers = v;
    }
    if let Some(v) = read_env_in(env, "TETHER_MAX_CONNECTIONS", 1..=100_000) {
        settings.server.max_connections = v;
    }
    if let Some(v) = read_env_in(env, "TETHER_SHUTDOWN_TIMEOUT_SECS", 0..=600) {
        settings.server.shutdown_timeout_secs = v;
    }

    // ── RPC ─────────────────────────────────────────────────────────
    if let Some(v) = read_env_enum(env, "TETHER_TIE_BREAK") {
        settings.rpc.tie_break = v;
    }
    if let Some(v) = read_env_in(env, "TETHER_HANDLER_TIMEOUT_MS", 1..=86_400_000) {
        settings.rpc.handler_timeout_ms = Some(v);
    }
    if let Some(v) = read_env_in(env, "TETHER_REQUEST_TIMEOUT_MS", 1..=86_400_000) {
        settings.rpc.request_timeout_ms = Some(v);
    }
    if let Some(v) = read_env_in(env, "TETHER_MAX_FRAME_BYTES", 1024..=1_073_741_824) {
        settings.rpc.max_frame_bytes = v;
    }

    // ── Session ─────────────────────────────────────────────────────
    if let Some(v) = read_env_in(env, "TETHER_SESSION_MAX_IDLE_SECS", 1..=604_800) {
        settings.session.max_idle_secs = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_env_enum(env, "TETHER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_enum(env, "TETHER_LOG_FORMAT") {
        settings.logging.format = v;
    }
}

// ── Value parsing ───────────────────────────────────────────────────────────

/// Interpret an on/off switch value. Case-insensitive; `None` for anything
/// that is not one of `true 1 yes on` / `false 0 no off`.
pub fn parse_switch(raw: &str) -> Option<bool> {
    const ON: [&str; 4] = ["true", "1", "yes", "on"];
    const OFF: [&str; 4] = ["false", "0", "no", "off"];
    let raw = raw.trim().to_ascii_lowercase();
    if ON.contains(&raw.as_str()) {
        Some(true)
    } else if OFF.contains(&raw.as_str()) {
        Some(false)
    } else {
        None
    }
}

/// Parse a number and keep it only when it lies in `bounds`.
pub fn parse_bounded<T>(raw: &str, bounds: RangeInclusive<T>) -> Option<T>
where
    T: FromStr + PartialOrd,
{
    raw.trim().parse().ok().filter(|n| bounds.contains(n))
}

// ── Variable readers ────────────────────────────────────────────────────────

fn read_env_string(env: EnvLookup<'_>, name: &str) -> Option<String> {
    env(name).filter(|v| !v.is_empty())
}

/// Read `name` through `parse`, warning when it is set but unusable.
fn read_env_with<T>(
    env: EnvLookup<'_>,
    name: &str,
    expected: &str,
    parse: impl FnOnce(&str) -> Option<T>,
) -> Option<T> {
    let raw = env(name)?;
    let parsed = parse(&raw);
    if parsed.is_none() {
        warn!(key = name, value = %raw, expected, "ignoring unusable environment override");
    }
    parsed
}

fn read_env_bool(env: EnvLookup<'_>, name: &str) -> Option<bool> {
    read_env_with(env, name, "on/off switch", parse_switch)
}

fn read_env_in<T>(env: EnvLookup<'_>, name: &str, bounds: RangeInclusive<T>) -> Option<T>
where
    T: FromStr + PartialOrd + std::fmt::Display,
{
    let expected = format!("integer in {}..={}", bounds.start(), bounds.end());
    read_env_with(env, name, &expected, |raw| parse_bounded(raw, bounds))
}

fn read_env_enum<T: DeserializeOwned>(env: EnvLookup<'_>, name: &str) -> Option<T> {
    read_env_with(env, name, "known variant name", |raw| {
        if raw.is_empty() {
            return None;
        }
        serde_json::from_value(Value::String(raw.to_owned())).ok()
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::errors::SettingsError;
    use crate::types::{LogFormat, LogLevel, TieBreakMode, TransportKind};
    use serde_json::json;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn write_settings(json: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, json).unwrap();
        (dir, path)
    }

    // ── File layer ──────────────────────────────────────────────────

    #[test]
    fn file_layer_keeps_sibling_defaults() {
        let lower = json!({"server": {"port": 2087, "host": "127.0.0.1"}, "rpc": {"tieBreak": "error"}});
        let upper = json!({"server": {"port": 9090}});
        let out = overlay_json(lower, upper);
        assert_eq!(out, json!({"server": {"port": 9090, "host": "127.0.0.1"}, "rpc": {"tieBreak": "error"}}));
    }

    #[test]
    fn file_layer_null_is_not_an_override() {
        let out = overlay_json(json!({"rpc": {"handlerTimeoutMs": 500}}), json!({"rpc": {"handlerTimeoutMs": null}}));
        assert_eq!(out["rpc"]["handlerTimeoutMs"], 500);
    }

    #[test]
    fn file_layer_scalars_and_lists_win_outright() {
        let lower = json!({"logging": {"targets": ["a", "b"]}, "server": {"transport": {"kind": "tcp"}}});
        let upper = json!({"logging": {"targets": ["c"]}, "server": {"transport": "stdio"}});
        let out = overlay_json(lower, upper);
        assert_eq!(out["logging"]["targets"], json!(["c"]));
        assert_eq!(out["server"]["transport"], "stdio");
    }

    #[test]
    fn absent_file_yields_compiled_defaults() {
        let settings = load_settings_with_env(Path::new("/nonexistent/settings.json"), &no_env).unwrap();
        assert_eq!(settings, TetherSettings::default());
    }

    #[test]
    fn file_sets_transport_and_tie_break() {
        let (_dir, path) = write_settings(
            r#"{"server": {"transport": "tcp", "port": 9000}, "rpc": {"tieBreak": "firstRegistered"}}"#,
        );
        let settings = load_settings_with_env(&path, &no_env).unwrap();
        assert_eq!(settings.server.transport, TransportKind::Tcp);
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.rpc.tie_break, TieBreakMode::FirstRegistered);
        assert_eq!(settings.rpc.max_header_bytes, 4096);
    }

    #[test]
    fn unparsable_file_is_a_json_error() {
        let (_dir, path) = write_settings("not valid json");
        let err = load_settings_with_env(&path, &no_env).unwrap_err();
        assert!(matches!(err, SettingsError::Json(_)));
    }

    #[test]
    fn header_limit_below_minimum_fails_validation() {
        let (_dir, path) = write_settings(r#"{"rpc": {"maxHeaderBytes": 8}}"#);
        let err = load_settings_with_env(&path, &no_env).unwrap_err();
        assert!(matches!(err, SettingsError::InvalidValue(_)));
    }

    // ── Environment layer ───────────────────────────────────────────

    #[test]
    fn environment_beats_file() {
        let (_dir, path) = write_settings(r#"{"server": {"port": 9000}}"#);
        let env = env_from(&[
            ("TETHER_PORT", "9100"),
            ("TETHER_TRANSPORT", "websocket"),
            ("TETHER_HANDLER_TIMEOUT_MS", "1500"),
            ("TETHER_LOG_LEVEL", "debug"),
            ("TETHER_LOG_FORMAT", "json"),
            ("TETHER_WS_FRAME_HEADERS", "off"),
        ]);
        let settings = load_settings_with_env(&path, &env).unwrap();
        assert_eq!(settings.server.port, 9100);
        assert_eq!(settings.server.transport, TransportKind::Websocket);
        assert_eq!(settings.rpc.handler_timeout_ms, Some(1500));
        assert_eq!(settings.logging.level, LogLevel::Debug);
        assert_eq!(settings.logging.format, LogFormat::Json);
        assert!(!settings.server.ws_frame_headers);
    }

    #[test]
    fn unusable_environment_values_leave_settings_alone() {
        let env = env_from(&[
            ("TETHER_PORT", "0"),
            ("TETHER_TRANSPORT", "carrier-pigeon"),
            ("TETHER_TIE_BREAK", ""),
            ("TETHER_MAX_CONNECTIONS", "lots"),
            ("TETHER_HOST", ""),
        ]);
        let mut settings = TetherSettings::default();
        apply_env_overrides(&mut settings, &env);
        assert_eq!(settings, TetherSettings::default());
    }

    // ── Value parsing ───────────────────────────────────────────────

    #[test]
    fn switch_spellings() {
        let on = ["true", "1", "yes", "on", "TRUE", " On "];
        let off = ["false", "0", "no", "off", "Off"];
        assert!(on.iter().all(|v| parse_switch(v) == Some(true)));
        assert!(off.iter().all(|v| parse_switch(v) == Some(false)));
        assert_eq!(parse_switch("enabled"), None);
    }

    #[test]
    fn bounded_numbers() {
        assert_eq!(parse_bounded::<u16>("9090", 1..=65535), Some(9090));
        assert_eq!(parse_bounded::<u16>("70000", 1..=65535), None);
        assert_eq!(parse_bounded::<u64>("500", 1000..=600_000), None);
        assert_eq!(parse_bounded::<usize>(" 50 ", 1..=10_000), Some(50));
        assert_eq!(parse_bounded::<usize>("-3", 0..=10), None);
    }
}
