use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Upper bound for `request-delay` and `retry-delay-base` (seconds)
pub const MAX_DELAY_SECS: f64 = 3600.0;

/// Resolved, immutable settings for one process
///
/// Every section has defaults, so a partial file (or no file at all) still
/// resolves to a usable configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub scraper: ScraperConfig,
    pub monitoring: MonitoringConfig,
    pub advanced: AdvancedConfig,
    pub database: DatabaseConfig,
}

/// Fetching, retry and source configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScraperConfig {
    /// Site root that every source path is joined onto
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Per-request timeout (seconds)
    #[serde(rename = "request-timeout")]
    pub request_timeout: u64,

    /// Retries after the first attempt for transient failures
    #[serde(rename = "max-retries")]
    pub max_retries: u32,

    /// Base of the exponential backoff (seconds)
    #[serde(rename = "retry-delay-base")]
    pub retry_delay_base: f64,

    /// Minimum time between requests to the same host (seconds)
    #[serde(rename = "request-delay")]
    pub request_delay: f64,

    /// Maximum number of concurrent source jobs
    #[serde(rename = "max-threads")]
    pub max_threads: u32,

    /// Rows requested and parsed on a full refresh
    #[serde(rename = "max-rows-per-source")]
    pub max_rows_per_source: u32,

    /// Rows requested on a change-detection poll
    #[serde(rename = "max-rows-for-update-check")]
    pub max_rows_for_update_check: u32,

    /// Consecutive failures before a source's breaker opens
    #[serde(rename = "circuit-breaker-fail-max")]
    pub circuit_breaker_fail_max: u32,

    /// Initial breaker cool-down (seconds)
    #[serde(rename = "circuit-breaker-reset-timeout")]
    pub circuit_breaker_reset_timeout: u64,

    /// DOM id of the filings table
    #[serde(rename = "table-id")]
    pub table_id: String,

    /// User agents rotated per request; the default agent is used when empty
    #[serde(rename = "user-agents")]
    pub user_agents: Vec<String>,

    pub sources: BTreeMap<String, SourceConfig>,
}

/// One configured source page
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    #[serde(rename = "url-path")]
    pub url_path: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Overrides `max-rows-per-source` for this source
    #[serde(rename = "max-rows", default, skip_serializing_if = "Option::is_none")]
    pub max_rows: Option<u32>,
}

/// Cadences of the continuous scheduler
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Seconds between change-detection polls of a source
    #[serde(rename = "change-detection-interval")]
    pub change_detection_interval: u64,

    /// Seconds between full refreshes of a source
    #[serde(rename = "full-refresh-interval")]
    pub full_refresh_interval: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AdvancedConfig {
    pub selenium: BrowserConfig,
    pub caching: CachingConfig,
}

/// Headless browser fallback
///
/// The section keeps its historical `selenium` name in the file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub enabled: bool,

    #[serde(rename = "max-instances")]
    pub max_instances: u32,

    /// Seconds allowed for session acquisition and for a page to render the table
    #[serde(rename = "page-load-timeout")]
    pub page_load_timeout: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CachingConfig {
    pub enabled: bool,

    /// Seconds a cached response stays fresh
    #[serde(rename = "expire-after")]
    pub expire_after: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file
    pub path: String,

    /// Maximum records per storage transaction
    #[serde(rename = "batch-size")]
    pub batch_size: u32,
}

/// A source as seen by the pipeline: name, path, and the resolved row limit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub name: String,
    pub url_path: String,
    pub enabled: bool,
    pub row_limit: u32,
}

/// Converts fractional seconds, clamped to `[0, MAX_DELAY_SECS]`; NaN is zero
fn delay_from_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.clamp(0.0, MAX_DELAY_SECS)).unwrap_or_default()
}

fn default_enabled() -> bool {
    true
}

impl Default for ScraperConfig {
    fn default() -> Self {
        let mut sources = BTreeMap::new();
        for (name, path) in [
            ("latest_filings", "/latest-insider-trading"),
            ("latest_purchases", "/insider-purchases"),
            ("latest_sales", "/insider-sales"),
            ("cluster_buys", "/latest-cluster-buys"),
        ] {
            sources.insert(
                name.to_string(),
                SourceConfig {
                    url_path: path.to_string(),
                    enabled: true,
                    max_rows: None,
                },
            );
        }

        Self {
            base_url: "http://openinsider.com".to_string(),
            request_timeout: 30,
            max_retries: 3,
            retry_delay_base: 2.0,
            request_delay: 1.0,
            max_threads: 4,
            max_rows_per_source: 1000,
            max_rows_for_update_check: 20,
            circuit_breaker_fail_max: 3,
            circuit_breaker_reset_timeout: 60,
            table_id: "insidertrades".to_string(),
            user_agents: Vec::new(),
            sources,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            change_detection_interval: 600,
            full_refresh_interval: 3600,
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_instances: 2,
            page_load_timeout: 60,
        }
    }
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            expire_after: 3600,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/insider_trades.db".to_string(),
            batch_size: 1000,
        }
    }
}

impl ScraperConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn request_delay(&self) -> Duration {
        delay_from_secs(self.request_delay)
    }

    pub fn retry_delay_base(&self) -> Duration {
        delay_from_secs(self.retry_delay_base)
    }

    pub fn circuit_breaker_reset_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_reset_timeout)
    }
}

impl MonitoringConfig {
    pub fn change_detection_interval(&self) -> Duration {
        Duration::from_secs(self.change_detection_interval)
    }

    pub fn full_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.full_refresh_interval)
    }
}

impl Settings {
    /// Returns every configured source in name order
    pub fn sources(&self) -> Vec<Source> {
        self.scraper
            .sources
            .iter()
            .map(|(name, source)| Source {
                name: name.clone(),
                url_path: source.url_path.clone(),
                enabled: source.enabled,
                row_limit: source
                    .max_rows
                    .unwrap_or(self.scraper.max_rows_per_source),
            })
            .collect()
    }

    /// Returns the enabled sources in name order
    pub fn enabled_sources(&self) -> Vec<Source> {
        self.sources().into_iter().filter(|s| s.enabled).collect()
    }

    /// Resolves an explicit source selection, or every enabled source when `names` is empty
    ///
    /// Disabled sources are skipped with a warning even when named; unknown names
    /// are an error.
    pub fn select_sources(&self, names: &[String]) -> crate::ConfigResult<Vec<Source>> {
        if names.is_empty() {
            return Ok(self.enabled_sources());
        }

        let all = self.sources();
        let mut selected = Vec::with_capacity(names.len());
        for name in names {
            let source = all
                .iter()
                .find(|s| &s.name == name)
                .ok_or_else(|| crate::ConfigError::UnknownSource(name.clone()))?;

            if source.enabled {
                selected.push(source.clone());
            } else {
                tracing::warn!("Source '{}' is configured but not enabled, skipping", name);
            }
        }

        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_settings() -> Settings {
        let mut settings = Settings::default();
        if let Some(source) = settings.scraper.sources.get_mut("cluster_buys") {
            source.enabled = false;
            source.max_rows = Some(50);
        }
        settings
    }

    fn names(sources: &[Source]) -> Vec<&str> {
        sources.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn test_sources_resolve_row_limits() {
        let settings = create_test_settings();
        let sources = settings.sources();
        assert_eq!(sources.len(), 4);

        let cluster = sources.iter().find(|s| s.name == "cluster_buys").unwrap();
        assert_eq!(cluster.row_limit, 50);
        assert!(!cluster.enabled);

        let filings = sources.iter().find(|s| s.name == "latest_filings").unwrap();
        assert_eq!(filings.row_limit, 1000);
    }

    #[test]
    fn test_delay_accessors_never_panic() {
        let mut settings = Settings::default();
        settings.scraper.request_delay = 1e20;
        settings.scraper.retry_delay_base = f64::NAN;

        assert_eq!(settings.scraper.request_delay(), Duration::from_secs(3600));
        assert_eq!(settings.scraper.retry_delay_base(), Duration::ZERO);

        settings.scraper.request_delay = 0.25;
        assert_eq!(settings.scraper.request_delay(), Duration::from_millis(250));
    }

    #[test]
    fn test_select_all_enabled_sources() {
        let settings = create_test_settings();
        let selected = settings.select_sources(&[]).unwrap();
        assert_eq!(
            names(&selected),
            vec!["latest_filings", "latest_purchases", "latest_sales"]
        );
    }

    #[test]
    fn test_select_named_sources_skips_disabled() {
        let settings = create_test_settings();
        let selected = settings
            .select_sources(&["latest_sales".to_string(), "cluster_buys".to_string()])
            .unwrap();
        assert_eq!(names(&selected), vec!["latest_sales"]);

        let only_disabled = settings.select_sources(&["cluster_buys".to_string()]).unwrap();
        assert!(only_disabled.is_empty());
    }

    #[test]
    fn test_select_unknown_source_is_error() {
        let settings = create_test_settings();
        let result = settings.select_sources(&["nope".to_string()]);
        assert!(matches!(result, Err(crate::ConfigError::UnknownSource(name)) if name == "nope"));
    }
}
