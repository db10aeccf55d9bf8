//! Configuration Management Module
//!
//! Handles persistent storage of port-forward connection configurations
//! and application settings.

pub mod storage;
pub mod types;

pub use storage::{
    config_dir, config_file, ConfigStorage, ConnectionStore, MemoryConnectionStore, StorageError,
};
pub use types::{ConfigFile, ConnectionConfig, Settings, Timings, CONFIG_VERSION};
