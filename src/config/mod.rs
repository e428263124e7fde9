//! Configuration management for fieldsync.
//!
//! This module handles loading configuration from `~/.fieldsync/`.

mod paths;
mod settings;

pub use paths::{Paths, HOME_ENV};
pub use settings::{CacheConfig, ColorSetting, Config, GeneralConfig, ServerConfig, SyncConfig};
