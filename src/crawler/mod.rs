//! Crawler module for acquiring and ingesting filings
//!
//! This module contains the acquisition pipeline, including:
//! - Rate limiting, retry and circuit breaking around every request
//! - HTTP fetching with escalation to a headless-browser fallback
//! - Table parsing and record normalization
//! - Pass orchestration and the monitor loop

pub mod breaker;
pub mod browser;
mod coordinator;
pub mod fetcher;
pub mod normalize;
pub mod parser;
pub mod rate_limiter;
pub mod retry;
mod scheduler;

pub use breaker::CircuitBreaker;
pub use browser::{build_renderer, BrowserPool, DisabledRenderer, PageRenderer};
pub use coordinator::{breaker_wait, Coordinator, SourceContext};
pub use fetcher::{build_http_client, classify_response, FetchRequest, PrimaryFetcher, RawPage};
pub use normalize::{natural_key, RecordNormalizer};
pub use parser::{parse_table, ParsedTable, RawRow};
pub use rate_limiter::RateLimiter;
pub use retry::RetryPolicy;
pub use scheduler::{due_jobs, next_wake, Scheduler};
