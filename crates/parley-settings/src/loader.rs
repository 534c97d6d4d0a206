//! Reading and writing the settings file.
//!
//! A load starts from [`ParleySettings::default()`], overlays whatever keys
//! the file sets (nested objects key by key, `null` leaves the default in
//! place, anything else replaces it), then applies `PARLEY_*` environment
//! overrides and validates. A missing file is not an error.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::ParleySettings;

/// Resolve the settings file path: `$PARLEY_SETTINGS`, else
/// `~/.parley/settings.json`.
pub fn settings_path() -> PathBuf {
    if let Some(path) = std::env::var_os("PARLEY_SETTINGS").filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".parley").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ParleySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; an unreadable or malformed file is an
/// error.
pub fn load_settings_from_path(path: &Path) -> Result<ParleySettings> {
    let mut settings = read_settings_file(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Write settings to `path` as pretty JSON, creating parent directories.
pub fn save_settings(path: &Path, settings: &ParleySettings) -> Result<()> {
    settings.validate()?;
    let value = serde_json::to_value(settings).map_err(SettingsError::Encode)?;
    write_file(path, &value)
}

/// Set the single key at `pointer` (a JSON pointer such as `/server/port`)
/// in the settings file, leaving every other key exactly as written.
///
/// Nothing is written unless the edited file still loads and validates.
/// Returns the file layer after the edit.
pub fn set_file_value(path: &Path, pointer: &str, value: Value) -> Result<ParleySettings> {
    let mut raw = match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).map_err(|source| SettingsError::Malformed {
            path: path.to_path_buf(),
            source,
        })?,
        Err(e) if e.kind() == ErrorKind::NotFound => Value::Object(Map::new()),
        Err(source) => {
            return Err(SettingsError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let mut slot = &mut raw;
    for segment in pointer.split('/').skip(1) {
        slot = match slot {
            Value::Object(fields) => fields
                .entry(segment)
                .or_insert_with(|| Value::Object(Map::new())),
            _ => {
                return Err(SettingsError::Malformed {
                    path: path.to_path_buf(),
                    source: serde::de::Error::custom(format!("{segment} has no parent object")),
                })
            }
        };
    }
    *slot = value;

    let settings = overlay_defaults(path, raw.clone())?;
    settings.validate()?;
    write_file(path, &raw)?;
    Ok(settings)
}

fn write_file(path: &Path, value: &Value) -> Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(SettingsError::Encode)?;
    let write_err = |source| SettingsError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }
    std::fs::write(path, json).map_err(write_err)?;
    debug!(path = %path.display(), "settings saved");
    Ok(())
}

/// Defaults overlaid with the file at `path`, without environment
/// overrides or validation. This is what the file itself says.
pub fn read_settings_file(path: &Path) -> Result<ParleySettings> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "no settings file, using defaults");
            return Ok(ParleySettings::default());
        }
        Err(source) => {
            return Err(SettingsError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let overlay: Value = serde_json::from_str(&content).map_err(|source| SettingsError::Malformed {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "settings file read");
    overlay_defaults(path, overlay)
}

fn overlay_defaults(path: &Path, overlay: Value) -> Result<ParleySettings> {
    let mut merged = serde_json::to_value(ParleySettings::default()).map_err(SettingsError::Encode)?;
    merge_into(&mut merged, overlay);
    serde_json::from_value(merged).map_err(|source| SettingsError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

/// Overlay `overlay` onto `base` in place. Objects merge per key, a `null`
/// inside an object is skipped, every other value replaces what was there.
pub fn merge_into(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(fields), Value::Object(updates)) => {
            for (key, value) in updates {
                if value.is_null() {
                    continue;
                }
                match fields.get_mut(&key) {
                    Some(slot) => merge_into(slot, value),
                    None => {
                        fields.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Apply `PARLEY_*` environment overrides. Invalid values are logged and
/// ignored.
pub fn apply_env_overrides(settings: &mut ParleySettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary variable lookup.
pub fn apply_overrides(settings: &mut ParleySettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("PARLEY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("PARLEY_PORT") {
        match parse_u64_range(&v, 1, u64::from(u16::MAX)) {
            Some(port) => settings.server.port = port as u16,
            None => warn_invalid("PARLEY_PORT", &v),
        }
    }
    if let Some(v) = read("PARLEY_SESSION_TIMEOUT") {
        match parse_u64_range(&v, 1, 86_400) {
            Some(secs) => settings.server.session_timeout_secs = secs,
            None => warn_invalid("PARLEY_SESSION_TIMEOUT", &v),
        }
    }
    if let Some(v) = read("PARLEY_MAX_CLIENTS") {
        match parse_u64_range(&v, 1, 1_000_000) {
            Some(n) => settings.server.max_clients = n as usize,
            None => warn_invalid("PARLEY_MAX_CLIENTS", &v),
        }
    }
    if let Some(v) = read("PARLEY_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn warn_invalid(key: &str, value: &str) {
    tracing::warn!(key, value, "invalid env override, ignoring");
}
