//! # parley-settings
//!
//! Startup configuration for the Parley chat server.
//!
//! Settings are layered (lowest to highest priority):
//! 1. **Compiled defaults**: [`ParleySettings::default()`]
//! 2. **Settings file**: `~/.parley/settings.json`, overlaid key by key
//! 3. **Environment variables**: `PARLEY_*` overrides
//!
//! The file is read once at startup. The operator console edits one key at
//! a time with [`set_file_value`], so environment overrides and defaults
//! never leak into the file; edits take effect on the next server start.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    load_settings, load_settings_from_path, merge_into, read_settings_file, save_settings,
    set_file_value, settings_path,
};
pub use types::{LoggingSettings, ParleySettings, ServerSettings};
