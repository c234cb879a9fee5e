use crate::config::types::{
    AdvancedConfig, DatabaseConfig, MonitoringConfig, ScraperConfig, Settings, SourceConfig,
    MAX_DELAY_SECS,
};
use crate::ConfigError;
use url::Url;

/// Validates the entire configuration
pub fn validate(settings: &Settings) -> Result<(), ConfigError> {
    validate_scraper_config(&settings.scraper)?;
    validate_sources(&settings.scraper)?;
    validate_monitoring_config(&settings.monitoring)?;
    validate_advanced_config(&settings.advanced)?;
    validate_database_config(&settings.database, &settings.scraper)?;
    Ok(())
}

/// Validates a delay given in fractional seconds
fn validate_delay(key: &str, secs: f64) -> Result<(), ConfigError> {
    if !(0.0..=MAX_DELAY_SECS).contains(&secs) {
        return Err(ConfigError::Validation(format!(
            "{} must be between 0 and {} seconds, got {}",
            key, MAX_DELAY_SECS, secs
        )));
    }
    Ok(())
}

/// Validates fetch, retry and breaker settings
fn validate_scraper_config(config: &ScraperConfig) -> Result<(), ConfigError> {
    let url = Url::parse(&config.base_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid base-url: {}", e)))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ConfigError::InvalidUrl(format!(
            "base-url '{}' must use http or https",
            config.base_url
        )));
    }

    if config.request_timeout < 1 {
        return Err(ConfigError::Validation(
            "request-timeout must be >= 1 second".to_string(),
        ));
    }

    if config.max_threads < 1 || config.max_threads > 64 {
        return Err(ConfigError::Validation(format!(
            "max-threads must be between 1 and 64, got {}",
            config.max_threads
        )));
    }

    validate_delay("request-delay", config.request_delay)?;
    validate_delay("retry-delay-base", config.retry_delay_base)?;

    if config.max_rows_per_source < 1 {
        return Err(ConfigError::Validation(
            "max-rows-per-source must be >= 1".to_string(),
        ));
    }

    if config.max_rows_for_update_check < 1
        || config.max_rows_for_update_check > config.max_rows_per_source
    {
        return Err(ConfigError::Validation(format!(
            "max-rows-for-update-check must be between 1 and max-rows-per-source ({}), got {}",
            config.max_rows_per_source, config.max_rows_for_update_check
        )));
    }

    if config.circuit_breaker_fail_max < 1 {
        return Err(ConfigError::Validation(
            "circuit-breaker-fail-max must be >= 1".to_string(),
        ));
    }

    if config.circuit_breaker_reset_timeout < 1 {
        return Err(ConfigError::Validation(
            "circuit-breaker-reset-timeout must be >= 1 second".to_string(),
        ));
    }

    validate_table_id(&config.table_id)?;

    if config.user_agents.iter().any(|ua| ua.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "user-agents cannot contain empty entries".to_string(),
        ));
    }

    Ok(())
}

/// Validates the source map
fn validate_sources(config: &ScraperConfig) -> Result<(), ConfigError> {
    if !config.sources.values().any(|s| s.enabled) {
        return Err(ConfigError::Validation(
            "at least one source must be enabled".to_string(),
        ));
    }

    for (name, source) in &config.sources {
        validate_source(name, source, config.max_rows_per_source)?;
    }

    Ok(())
}

fn validate_source(name: &str, source: &SourceConfig, max_rows: u32) -> Result<(), ConfigError> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(ConfigError::Validation(format!(
            "source name '{}' must be non-empty and contain only letters, digits, '_' or '-'",
            name
        )));
    }

    if !source.url_path.starts_with('/') {
        return Err(ConfigError::Validation(format!(
            "source '{}' url-path must start with '/', got '{}'",
            name, source.url_path
        )));
    }

    if let Some(rows) = source.max_rows {
        if rows < 1 || rows > max_rows {
            return Err(ConfigError::Validation(format!(
                "source '{}' max-rows must be between 1 and {}, got {}",
                name, max_rows, rows
            )));
        }
    }

    Ok(())
}

/// Validates scheduler cadences
fn validate_monitoring_config(config: &MonitoringConfig) -> Result<(), ConfigError> {
    if config.change_detection_interval < 1 {
        return Err(ConfigError::Validation(
            "change-detection-interval must be >= 1 second".to_string(),
        ));
    }

    if config.full_refresh_interval < config.change_detection_interval {
        return Err(ConfigError::Validation(format!(
            "full-refresh-interval ({}s) must not be shorter than change-detection-interval ({}s)",
            config.full_refresh_interval, config.change_detection_interval
        )));
    }

    Ok(())
}

fn validate_advanced_config(config: &AdvancedConfig) -> Result<(), ConfigError> {
    if config.selenium.max_instances < 1 {
        return Err(ConfigError::Validation(
            "selenium max-instances must be >= 1".to_string(),
        ));
    }

    if config.selenium.page_load_timeout < 1 {
        return Err(ConfigError::Validation(
            "selenium page-load-timeout must be >= 1 second".to_string(),
        ));
    }

    if config.caching.enabled && config.caching.expire_after < 1 {
        return Err(ConfigError::Validation(
            "caching expire-after must be >= 1 second when caching is enabled".to_string(),
        ));
    }

    Ok(())
}

/// Validates database settings
///
/// A full source batch must fit into a single transaction, so the batch size can
/// never be smaller than the per-source row limit.
fn validate_database_config(
    config: &DatabaseConfig,
    scraper: &ScraperConfig,
) -> Result<(), ConfigError> {
    if config.path.is_empty() {
        return Err(ConfigError::Validation(
            "database path cannot be empty".to_string(),
        ));
    }

    if config.batch_size < scraper.max_rows_per_source {
        return Err(ConfigError::Validation(format!(
            "batch-size ({}) must be >= max-rows-per-source ({})",
            config.batch_size, scraper.max_rows_per_source
        )));
    }

    Ok(())
}

/// Validates the filings table id
fn validate_table_id(table_id: &str) -> Result<(), ConfigError> {
    if table_id.is_empty()
        || !table_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ConfigError::Validation(format!(
            "table-id must be a non-empty identifier, got '{}'",
            table_id
        )));
    }
    Ok(())
}
