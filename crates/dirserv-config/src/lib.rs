//! Configuration management for the dirserv system.
//!
//! This crate handles loading and saving `config.yaml` files and provides
//! typed access to the global and per-backend configuration values.

pub mod config;

pub use config::{
    BackendConfig, CheckpointConfig, ConfigError, RetryConfig, ServerConfig, load_config,
    save_config,
};
