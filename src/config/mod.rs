//! Configuration module for Insider-Harvest
//!
//! This module handles loading, layering, and validating TOML configuration files.
//! Layers resolve once at startup into an immutable [`Settings`] value that is
//! shared by reference with every component.
//!
//! # Example
//!
//! ```no_run
//! use insider_harvest::config::load_config;
//! use std::path::Path;
//!
//! let settings = load_config(Path::new("config/default.toml")).unwrap();
//! println!("Worker limit: {}", settings.scraper.max_threads);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    AdvancedConfig, BrowserConfig, CachingConfig, DatabaseConfig, MonitoringConfig,
    ScraperConfig, Settings, Source, SourceConfig,
};

// Re-export parser functions
pub use parser::{
    compute_settings_hash, load_config, load_settings, merge_values, ConfigLayers,
    LoadedSettings,
};
