//! Pass orchestration
//!
//! This module drives fetch, parse, normalize, dedup and store for each
//! dispatched source, including:
//! - Per-source contexts holding the breaker and the job lock
//! - Bounded concurrency across sources
//! - Change-detection escalation to a full refresh
//! - Schedule-state updates on success only
//! - Run bookkeeping and cancellation

use crate::config::{Settings, Source};
use crate::crawler::breaker::CircuitBreaker;
use crate::crawler::browser::{build_renderer, PageRenderer};
use crate::crawler::fetcher::{limiter_key, PrimaryFetcher, RawPage};
use crate::crawler::normalize::RecordNormalizer;
use crate::crawler::parser::parse_table;
use crate::output::{RunReport, SourceReport};
use crate::state::{FailureKind, FetchJob, IngestCounts, JobKind, JobOutcome, ScheduleState};
use crate::storage::{RunMode, RunStatus, SqliteStorage, Storage, StorageResult, TradeRecord};
use crate::{FetchError, HarvestError, ParseError};
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Shared per-source state, held for the process lifetime
pub struct SourceContext {
    pub source: Source,
    pub breaker: CircuitBreaker,

    /// Rate-limiter key of the source's host
    pub limiter_key: String,

    /// Held for the duration of a job; jobs for one source never overlap
    pub job_lock: tokio::sync::Mutex<()>,
}

/// Everything a spawned job needs
struct Pipeline {
    settings: Arc<Settings>,
    fetcher: PrimaryFetcher,
    db_path: PathBuf,
}

/// Main orchestration structure
pub struct Coordinator {
    pipeline: Arc<Pipeline>,
    contexts: BTreeMap<String, Arc<SourceContext>>,
    cancel: CancellationToken,
}

impl Coordinator {
    /// Creates a coordinator with the renderer the settings select
    ///
    /// # Returns
    ///
    /// * `Ok(Coordinator)` - Ready to run passes
    /// * `Err(HarvestError)` - Startup failure (storage unreachable, bad URL)
    pub fn new(settings: Arc<Settings>, cancel: CancellationToken) -> Result<Self, HarvestError> {
        let renderer = build_renderer(&settings);
        Self::with_renderer(settings, renderer, cancel)
    }

    /// Creates a coordinator with an explicit fallback renderer
    pub fn with_renderer(
        settings: Arc<Settings>,
        renderer: Arc<dyn PageRenderer>,
        cancel: CancellationToken,
    ) -> Result<Self, HarvestError> {
        let db_path = PathBuf::from(&settings.database.path);

        // Fail at startup rather than on the first job
        SqliteStorage::open(&db_path)?;

        let fetcher = PrimaryFetcher::new(&settings, renderer)?;
        let key = limiter_key(fetcher.base_url());
        let scraper = &settings.scraper;

        let contexts = settings
            .sources()
            .into_iter()
            .map(|source| {
                let context = SourceContext {
                    breaker: CircuitBreaker::new(
                        &source.name,
                        scraper.circuit_breaker_fail_max,
                        scraper.circuit_breaker_reset_timeout(),
                    ),
                    limiter_key: key.clone(),
                    job_lock: tokio::sync::Mutex::new(()),
                    source,
                };
                (context.source.name.clone(), Arc::new(context))
            })
            .collect();

        tracing::info!(
            database = %db_path.display(),
            fallback = settings.advanced.selenium.enabled,
            "Coordinator ready"
        );

        Ok(Self {
            pipeline: Arc::new(Pipeline {
                settings,
                fetcher,
                db_path,
            }),
            contexts,
            cancel,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.pipeline.settings
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn context(&self, source_name: &str) -> Option<&Arc<SourceContext>> {
        self.contexts.get(source_name)
    }

    /// Runs one full-refresh pass over the selected sources
    ///
    /// An empty selection means every enabled source.
    pub async fn run_full(&self, names: &[String]) -> Result<RunReport, HarvestError> {
        let jobs = self
            .settings()
            .select_sources(names)?
            .into_iter()
            .map(|s| (s.name, JobKind::FullRefresh))
            .collect();
        self.run_pass(RunMode::Full, jobs).await
    }

    /// Runs one change-detection pass over the selected sources
    pub async fn run_check(&self, names: &[String]) -> Result<RunReport, HarvestError> {
        let jobs = self
            .settings()
            .select_sources(names)?
            .into_iter()
            .map(|s| (s.name, JobKind::ChangeDetection))
            .collect();
        self.run_pass(RunMode::Check, jobs).await
    }

    /// Loads schedule state for the given sources
    pub async fn load_schedule(&self, names: Vec<String>) -> Result<Vec<ScheduleState>, HarvestError> {
        self.pipeline
            .with_storage(move |storage| {
                names
                    .iter()
                    .map(|name| storage.load_source_state(name))
                    .collect::<StorageResult<Vec<_>>>()
            })
            .await
    }

    /// Dispatches one job per entry and waits for all of them
    ///
    /// # Concurrency
    ///
    /// At most `max_threads` jobs run at once. Cancellation stops dispatching;
    /// jobs already running finish their current network call and write.
    ///
    /// # Errors
    ///
    /// A storage failure in any job cancels the remaining jobs, marks the run
    /// failed and is returned. Per-source failures are only reported.
    pub async fn run_pass(
        &self,
        mode: RunMode,
        jobs: Vec<(String, JobKind)>,
    ) -> Result<RunReport, HarvestError> {
        let started = Instant::now();
        let run_id = self
            .pipeline
            .with_storage(move |storage| storage.create_run(mode))
            .await?;

        tracing::info!(run_id, mode = mode.to_db_string(), jobs = jobs.len(), "Run started");

        let pass_cancel = self.cancel.child_token();
        let permits = Arc::new(Semaphore::new(self.settings().scraper.max_threads as usize));
        let mut workers = JoinSet::new();

        for (name, kind) in jobs {
            let Some(ctx) = self.contexts.get(&name).cloned() else {
                tracing::warn!(source = %name, "Unknown source, not dispatched");
                continue;
            };

            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = pass_cancel.cancelled() => break,
            };
            if pass_cancel.is_cancelled() {
                break;
            }

            let pipeline = self.pipeline.clone();
            let cancel = pass_cancel.clone();
            workers.spawn(async move {
                let _permit = permit;
                pipeline.run_job(&ctx, kind, &cancel).await
            });
        }

        let mut reports = Vec::new();
        let mut fatal = None;
        while let Some(joined) = workers.join_next().await {
            match joined.map_err(HarvestError::from).and_then(|r| r) {
                Ok(report) => reports.push(report),
                Err(error) => {
                    tracing::error!(
                        run_id,
                        error = %error,
                        kind = %FailureKind::Storage,
                        retry_next_cycle = FailureKind::Storage.retried_next_cycle(),
                        "Fatal error, cancelling run"
                    );
                    pass_cancel.cancel();
                    fatal.get_or_insert(error);
                }
            }
        }

        let report = RunReport::new(
            run_id,
            mode,
            reports,
            self.cancel.is_cancelled(),
            started.elapsed(),
        );
        let status = if fatal.is_some() {
            RunStatus::Failed
        } else {
            report.status
        };
        let totals = report.totals();

        let finished = self
            .pipeline
            .with_storage(move |storage| storage.finish_run(run_id, status, &totals))
            .await;

        if let Some(error) = fatal {
            return Err(error);
        }
        finished?;

        tracing::info!(
            run_id,
            status = %report.status,
            sources_ok = totals.sources_ok,
            sources_failed = totals.sources_failed,
            records_new = totals.records_new,
            records_changed = totals.records_changed,
            "Run finished"
        );

        Ok(report)
    }
}

/// Result of a job stage that may end the job early
enum Stage<T> {
    Continue(T),
    Done(JobOutcome),
}

impl Pipeline {
    /// Runs a job under its source's lock and reports the outcome
    ///
    /// Only storage failures escape as errors.
    async fn run_job(
        &self,
        ctx: &SourceContext,
        kind: JobKind,
        cancel: &CancellationToken,
    ) -> Result<SourceReport, HarvestError> {
        let _guard = ctx.job_lock.lock().await;
        let started = Instant::now();
        let mut job = FetchJob::new(ctx.source.clone(), kind);
        let mut escalated = false;

        tracing::info!(source = %ctx.source.name, kind = %kind, "Job started");

        let name = ctx.source.name.clone();
        let mut state = self
            .with_storage(move |storage| storage.load_source_state(&name))
            .await?;

        let outcome = match kind {
            JobKind::FullRefresh => self.full_refresh(ctx, &mut job, &mut state, cancel).await?,
            JobKind::ChangeDetection => {
                match self.change_detection(ctx, &mut job, &mut state, cancel).await? {
                    Some(outcome) => outcome,
                    None => {
                        escalated = true;
                        job.kind = JobKind::FullRefresh;
                        self.full_refresh(ctx, &mut job, &mut state, cancel).await?
                    }
                }
            }
        };

        // Successful jobs saved their state as they finished
        if !outcome.is_success() && outcome.advances_schedule() {
            state.record_unusable_poll(Utc::now(), job.kind);
            self.save_state(&state).await?;
        }

        log_outcome(&job, &outcome);
        job.finish(outcome.clone());

        Ok(SourceReport {
            source: ctx.source.name.clone(),
            kind: job.kind,
            escalated,
            attempts: job.attempts,
            elapsed: started.elapsed(),
            outcome,
        })
    }

    /// Fetches the full page and ingests it
    async fn full_refresh(
        &self,
        ctx: &SourceContext,
        job: &mut FetchJob,
        state: &mut ScheduleState,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, HarvestError> {
        let page = match self.fetch(ctx, job, ctx.source.row_limit, cancel).await {
            Stage::Continue(page) => page,
            Stage::Done(outcome) => return Ok(outcome),
        };

        let content_hash = page.content_hash();
        if state.last_content_hash.as_deref() == Some(content_hash.as_str()) {
            tracing::info!(source = %ctx.source.name, "Page content unchanged, skipping parse");
            state.record_full_refresh(Utc::now(), None, None);
            self.save_state(state).await?;
            return Ok(JobOutcome::Unchanged);
        }

        let (records, mut counts) = match self.extract(ctx, &page, ctx.source.row_limit) {
            Stage::Continue(extracted) => extracted,
            Stage::Done(outcome) => return Ok(outcome),
        };
        let newest = records.first().map(|r| r.hash_id.clone());

        let batch_size = self.settings.database.batch_size as usize;
        let summary = self
            .with_storage(move |storage| storage.upsert_batch(&records, batch_size))
            .await?;

        counts.new = summary.inserted_new as usize;
        counts.changed = summary.inserted_changed as usize;
        counts.unchanged = summary.unchanged as usize;
        counts.skipped = summary.skipped as usize;

        state.record_full_refresh(Utc::now(), Some(content_hash), newest);
        self.save_state(state).await?;

        Ok(JobOutcome::Ingested(counts))
    }

    /// Polls the small page and compares the newest filing
    ///
    /// Returns None when new filings were seen and the job should escalate to a
    /// full refresh.
    async fn change_detection(
        &self,
        ctx: &SourceContext,
        job: &mut FetchJob,
        state: &mut ScheduleState,
        cancel: &CancellationToken,
    ) -> Result<Option<JobOutcome>, HarvestError> {
        let scraper = &self.settings.scraper;
        let row_limit = scraper.max_rows_for_update_check.min(ctx.source.row_limit);

        let page = match self.fetch(ctx, job, row_limit, cancel).await {
            Stage::Continue(page) => page,
            Stage::Done(outcome) => return Ok(Some(outcome)),
        };

        let (records, _) = match self.extract(ctx, &page, row_limit) {
            Stage::Continue(extracted) => extracted,
            Stage::Done(outcome) => return Ok(Some(outcome)),
        };

        let newest = records.first().map(|r| r.hash_id.as_str());
        if newest.is_none() || newest == state.newest_trade_hash.as_deref() {
            tracing::debug!(source = %ctx.source.name, "No new filings");
            state.record_change_check(Utc::now());
            self.save_state(state).await?;
            return Ok(Some(JobOutcome::Unchanged));
        }

        if cancel.is_cancelled() {
            return Ok(Some(JobOutcome::Failed {
                kind: FailureKind::Cancelled,
                message: "cancelled before escalation".to_string(),
            }));
        }

        tracing::info!(source = %ctx.source.name, "New filings detected, escalating to full refresh");
        Ok(None)
    }

    async fn fetch(
        &self,
        ctx: &SourceContext,
        job: &mut FetchJob,
        row_limit: u32,
        cancel: &CancellationToken,
    ) -> Stage<RawPage> {
        job.attempts += 1;
        match self.fetcher.fetch(ctx, row_limit, cancel).await {
            Ok(page) => {
                tracing::debug!(
                    source = %ctx.source.name,
                    rendered = page.rendered(),
                    latency = ?page.latency,
                    "Page fetched"
                );
                Stage::Continue(page)
            }
            Err(error) => {
                if let FetchError::Transient { attempts, .. } = &error {
                    job.attempts += attempts.saturating_sub(1);
                }
                Stage::Done(JobOutcome::Failed {
                    kind: error.kind(),
                    message: error.to_string(),
                })
            }
        }
    }

    /// Parses and normalizes a page; invalid rows are logged and counted
    fn extract(
        &self,
        ctx: &SourceContext,
        page: &RawPage,
        row_limit: u32,
    ) -> Stage<(Vec<TradeRecord>, IngestCounts)> {
        let table_id = &self.settings.scraper.table_id;

        let parsed = parse_table(&page.content, table_id, row_limit as usize)
            .and_then(|table| RecordNormalizer::new(&table.headers, table_id).map(|n| (table, n)));
        let (table, normalizer) = match parsed {
            Ok(parsed) => parsed,
            Err(error) => return Stage::Done(parse_failure(error)),
        };

        let mut counts = IngestCounts {
            rows: table.rows.len(),
            ..Default::default()
        };
        let mut records = Vec::with_capacity(table.rows.len());

        for row in &table.rows {
            match normalizer.normalize(row, &ctx.source.name) {
                Ok(record) => records.push(record),
                Err(error) => {
                    tracing::warn!(
                        source = %ctx.source.name,
                        position = row.position,
                        error = %error,
                        "Skipping invalid row"
                    );
                    counts.invalid += 1;
                }
            }
        }

        Stage::Continue((records, counts))
    }

    async fn save_state(&self, state: &ScheduleState) -> Result<(), HarvestError> {
        let state = state.clone();
        self.with_storage(move |storage| storage.save_source_state(&state))
            .await
    }

    /// Runs storage work on the blocking pool with its own connection
    async fn with_storage<T, F>(&self, work: F) -> Result<T, HarvestError>
    where
        F: FnOnce(&mut SqliteStorage) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.db_path.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut storage = SqliteStorage::open(&path)?;
            work(&mut storage)
        })
        .await?;
        Ok(result?)
    }
}

fn parse_failure(error: ParseError) -> JobOutcome {
    let kind = match error {
        ParseError::Structural { .. } => FailureKind::Structural,
        ParseError::Validation { .. } => FailureKind::Validation,
    };
    JobOutcome::Failed {
        kind,
        message: error.to_string(),
    }
}

fn log_outcome(job: &FetchJob, outcome: &JobOutcome) {
    let source = job.source.name.as_str();
    match outcome {
        JobOutcome::Ingested(counts) => tracing::info!(
            source,
            kind = %job.kind,
            rows = counts.rows,
            new = counts.new,
            changed = counts.changed,
            invalid = counts.invalid,
            "Job succeeded"
        ),
        JobOutcome::Unchanged => tracing::info!(source, kind = %job.kind, "Job succeeded, nothing new"),
        JobOutcome::Failed { kind, message } if *kind == FailureKind::Structural => tracing::error!(
            source,
            kind = %kind,
            retry_next_cycle = kind.retried_next_cycle(),
            error = %message,
            "Expected table missing, the site format has likely changed"
        ),
        JobOutcome::Failed { kind, message } => tracing::warn!(
            source,
            kind = %kind,
            retry_next_cycle = kind.retried_next_cycle(),
            error = %message,
            "Job failed"
        ),
    }
}

/// Duration until the breaker for a source admits a probe, if it is open
pub fn breaker_wait(ctx: &SourceContext) -> Option<Duration> {
    ctx.breaker.snapshot().open_remaining(Instant::now())
}
