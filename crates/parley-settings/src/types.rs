//! Settings schema. Serialized as camelCase JSON; every field has a default
//! so a partial file is always valid.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParleySettings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
}

impl ParleySettings {
    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        let s = &self.server;
        if s.port == 0 {
            return Err(SettingsError::invalid("server.port", "must be 1-65535"));
        }
        if s.session_timeout_secs == 0 {
            return Err(SettingsError::invalid("server.sessionTimeoutSecs", "must be positive"));
        }
        if s.max_clients == 0 {
            return Err(SettingsError::invalid("server.maxClients", "must be positive"));
        }
        if s.reap_interval_secs == 0 {
            return Err(SettingsError::invalid("server.reapIntervalSecs", "must be positive"));
        }
        if s.heartbeat_interval_secs == 0 {
            return Err(SettingsError::invalid("server.heartbeatIntervalSecs", "must be positive"));
        }
        Ok(())
    }
}

/// Listener and session lifecycle settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// WebSocket listen port.
    pub port: u16,
    /// Idle time after which the reaper drops a session.
    pub session_timeout_secs: u64,
    /// Sessions beyond this count are refused at handshake.
    pub max_clients: usize,
    /// How often the reaper scans the registry.
    pub reap_interval_secs: u64,
    /// WebSocket ping interval.
    pub heartbeat_interval_secs: u64,
    /// Maximum retained message log entries.
    pub message_log_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            session_timeout_secs: 60,
            max_clients: 1000,
            reap_interval_secs: 30,
            heartbeat_interval_secs: 30,
            message_log_capacity: 1000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level filter; `RUST_LOG` wins when set.
    pub level: String,
    /// Persist warn+ events to SQLite.
    pub log_to_sqlite: bool,
    /// Log database path. Defaults to `~/.parley/logs.db`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_db_path: Option<PathBuf>,
    /// Lines of recent log output kept for the operator console.
    pub console_buffer_lines: usize,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_to_sqlite: true,
            log_db_path: None,
            console_buffer_lines: 1000,
        }
    }
}
