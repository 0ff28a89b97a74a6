//! Layered settings: compiled defaults, then the JSON file merged over them,
//! then `EMAN_*` environment overrides. The result is validated before use.

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::EmanSettings;

/// `~/.eman/settings.json`, falling back to `/tmp` without a home directory.
pub fn settings_path() -> PathBuf {
    std::env::var_os("HOME")
        .map_or_else(|| PathBuf::from("/tmp"), PathBuf::from)
        .join(".eman")
        .join("settings.json")
}

/// [`load_settings_from_path`] on [`settings_path`].
pub fn load_settings() -> Result<EmanSettings> {
    load_settings_from_path(&settings_path())
}

/// Load `path` with overrides from the process environment.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<EmanSettings> {
    load_with_env(path, |key| std::env::var(key).ok())
}

/// Load settings from `path`, reading overrides through `env`.
pub fn load_with_env<F>(path: &Path, env: F) -> Result<EmanSettings>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = serde_json::to_value(EmanSettings::default())?;

    let layered = match std::fs::read_to_string(path) {
        Ok(text) => {
            debug!(?path, "merging settings file");
            deep_merge(defaults, serde_json::from_str(&text)?)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(?path, "no settings file, using defaults");
            defaults
        }
        Err(e) => return Err(e.into()),
    };

    let mut settings: EmanSettings = serde_json::from_value(layered)?;
    apply_env_overrides(&mut settings, env);
    validate(&settings)?;
    Ok(settings)
}

/// Overlay `layer` on `base`.
///
/// Objects merge key by key; `null` in the layer keeps the base value; any
/// other value replaces the base outright, arrays included.
pub fn deep_merge(base: Value, layer: Value) -> Value {
    match (base, layer) {
        (Value::Object(mut base), Value::Object(layer)) => {
            for (key, value) in layer.into_iter().filter(|(_, v)| !v.is_null()) {
                let value = match base.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                let _ = base.insert(key, value);
            }
            Value::Object(base)
        }
        (_, layer) => layer,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are logged and ignored. `EMAN_PORT` wins over the plain
/// `PORT` variable that hosting platforms set.
pub fn apply_env_overrides<F>(settings: &mut EmanSettings, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup: env };

    if let Some(host) = env.string("EMAN_HOST") {
        settings.server.host = host;
    }
    if let Some(port) = env
        .number("EMAN_PORT", 1..=u16::MAX)
        .or_else(|| env.number("PORT", 1..=u16::MAX))
    {
        settings.server.port = port;
    }
    if let Some(depth) = env.number("EMAN_MAX_SEND_QUEUE", 1..=1_000_000) {
        settings.server.max_send_queue = depth;
    }
    if let Some(ms) = env.number("EMAN_HANDSHAKE_TIMEOUT_MS", 1..=600_000) {
        settings.handshake.timeout_ms = ms;
    }
    if let Some(level) = env.string("EMAN_LOG_LEVEL") {
        settings.logging.level = level;
    }
    if let Some(json) = env.flag("EMAN_LOG_JSON") {
        settings.logging.json = json;
    }
}

/// Reject settings the broker cannot run with.
pub fn validate(settings: &EmanSettings) -> Result<()> {
    if settings.handshake.timeout_ms == 0 {
        return Err(SettingsError::InvalidValue(
            "handshake.timeoutMs must be greater than zero".into(),
        ));
    }
    if settings.server.max_send_queue == 0 {
        return Err(SettingsError::InvalidValue(
            "server.maxSendQueue must be greater than zero".into(),
        ));
    }
    if settings.server.heartbeat_interval_ms == 0 {
        return Err(SettingsError::InvalidValue(
            "server.heartbeatIntervalMs must be greater than zero".into(),
        ));
    }
    if settings.server.heartbeat_timeout_ms < settings.server.heartbeat_interval_ms {
        return Err(SettingsError::InvalidValue(format!(
            "server.heartbeatTimeoutMs ({}) is shorter than server.heartbeatIntervalMs ({})",
            settings.server.heartbeat_timeout_ms, settings.server.heartbeat_interval_ms
        )));
    }
    Ok(())
}

/// Parse an on/off flag, case-insensitively.
pub fn parse_flag(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a number and keep it only if it lies in `range`.
pub fn parse_within<T>(val: &str, range: RangeInclusive<T>) -> Option<T>
where
    T: FromStr + PartialOrd,
{
    val.trim().parse().ok().filter(|n| range.contains(n))
}

/// Looks up overrides and warns about values it cannot use.
struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, key: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
        let raw = (self.lookup)(key)?;
        let parsed = parse(&raw);
        if parsed.is_none() {
            warn!(key, value = %raw, "ignoring unusable override");
        }
        parsed
    }

    fn flag(&self, key: &str) -> Option<bool> {
        self.parsed(key, parse_flag)
    }

    fn number<T>(&self, key: &str, range: RangeInclusive<T>) -> Option<T>
    where
        T: FromStr + PartialOrd,
    {
        self.parsed(key, |raw| parse_within(raw, range))
    }
}
