use crate::config::types::Settings;
use crate::config::validation::validate;
use crate::ConfigError;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Where the configuration layers come from
///
/// Layers are applied in order: `<config_dir>/default.toml`, then the
/// `<config_dir>/<env>.toml` overlay, then the explicit file. Later layers win
/// per key; tables are merged recursively.
#[derive(Debug, Clone)]
pub struct ConfigLayers {
    /// Directory holding `default.toml` and environment overlays
    pub config_dir: PathBuf,

    /// Environment overlay name (e.g. "production")
    pub env: Option<String>,

    /// Explicit configuration file applied last
    pub explicit: Option<PathBuf>,
}

/// Settings together with the files that produced them
#[derive(Debug, Clone)]
pub struct LoadedSettings {
    pub settings: Settings,

    /// Files that were actually merged, in precedence order
    pub layers: Vec<PathBuf>,

    /// Hex-encoded SHA-256 of the resolved settings
    pub fingerprint: String,
}

impl ConfigLayers {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            env: None,
            explicit: None,
        }
    }

    pub fn with_env(mut self, env: Option<String>) -> Self {
        self.env = env.filter(|e| !e.is_empty() && e != "default");
        self
    }

    pub fn with_explicit(mut self, path: Option<PathBuf>) -> Self {
        self.explicit = path;
        self
    }
}

/// Loads, merges and validates every configuration layer
///
/// # Arguments
///
/// * `layers` - The layer sources to merge
///
/// # Returns
///
/// * `Ok(LoadedSettings)` - Resolved and validated settings
/// * `Err(ConfigError)` - A layer could not be read or parsed, or validation failed
///
/// # Example
///
/// ```no_run
/// use insider_harvest::config::{load_settings, ConfigLayers};
///
/// let layers = ConfigLayers::new("config").with_env(Some("production".to_string()));
/// let loaded = load_settings(&layers).unwrap();
/// println!("Sources: {}", loaded.settings.enabled_sources().len());
/// ```
pub fn load_settings(layers: &ConfigLayers) -> Result<LoadedSettings, ConfigError> {
    let mut merged = toml::Value::Table(toml::Table::new());
    let mut applied = Vec::new();

    let base = layers.config_dir.join("default.toml");
    if base.is_file() {
        merge_values(&mut merged, read_layer(&base)?);
        applied.push(base);
    } else {
        tracing::debug!("No base configuration at {}, using defaults", base.display());
    }

    if let Some(env) = &layers.env {
        let overlay = layers.config_dir.join(format!("{}.toml", env));
        if overlay.is_file() {
            merge_values(&mut merged, read_layer(&overlay)?);
            applied.push(overlay);
        } else {
            tracing::warn!(
                "Environment overlay '{}' not found at {}, continuing without it",
                env,
                overlay.display()
            );
        }
    }

    if let Some(explicit) = &layers.explicit {
        merge_values(&mut merged, read_layer(explicit)?);
        applied.push(explicit.clone());
    }

    let settings: Settings = merged.try_into()?;
    validate(&settings)?;
    let fingerprint = compute_settings_hash(&settings)?;

    Ok(LoadedSettings {
        settings,
        layers: applied,
        fingerprint,
    })
}

/// Loads a single configuration file on top of the built-in defaults
pub fn load_config(path: &Path) -> Result<Settings, ConfigError> {
    let value = read_layer(path)?;
    let settings: Settings = value.try_into()?;
    validate(&settings)?;
    Ok(settings)
}

/// Recursively merges `overlay` into `base`
///
/// Tables merge key by key; any other value (including arrays) replaces the
/// base value outright.
pub fn merge_values(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Computes a SHA-256 fingerprint of resolved settings
///
/// Two runs with the same fingerprint used the same effective configuration,
/// however it was layered.
pub fn compute_settings_hash(settings: &Settings) -> Result<String, ConfigError> {
    let rendered = toml::to_string(settings)?;
    let mut hasher = Sha256::new();
    hasher.update(rendered.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

fn read_layer(path: &Path) -> Result<toml::Value, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let table: toml::Table = toml::from_str(&content)?;
    Ok(toml::Value::Table(table))
}
