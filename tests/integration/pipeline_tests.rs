//! Integration tests for the acquisition pipeline
//!
//! These tests use wiremock to stand in for the filings site and drive full
//! passes through fetch, parse, normalize, dedup and store end-to-end.

use insider_harvest::config::Settings;
use insider_harvest::crawler::{Coordinator, DisabledRenderer};
use insider_harvest::storage::{RunStatus, SqliteStorage, Storage};
use insider_harvest::{FailureKind, JobKind};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const HEADER: &str = "<tr><th>X</th><th>Filing Date</th><th>Trade Date</th><th>Ticker</th>\
    <th>Insider Name</th><th>Title</th><th>Trade Type</th><th>Price</th><th>Qty</th></tr>";

/// A row as (ticker, insider, price, quantity)
type Row<'a> = (&'a str, &'a str, &'a str, u32);

/// Builds a filings page with the given rows, newest first
fn create_test_page(rows: &[Row<'_>], banner: &str) -> String {
    let body: String = rows
        .iter()
        .map(|(ticker, insider, price, qty)| {
            format!(
                "<tr><td><a href=\"http://www.sec.gov/Archives/form4.xml\">F</a></td>\
                 <td>2024-03-01 16:05:11</td><td>2024-02-28</td><td>{}</td><td>{}</td>\
                 <td>Dir</td><td>S - Sale</td><td>{}</td><td>{}</td></tr>",
                ticker, insider, price, qty
            )
        })
        .collect();
    format!(
        "<html><body><p>{}</p><table id=\"insidertrades\"><thead>{}</thead><tbody>{}</tbody></table></body></html>",
        banner, HEADER, body
    )
}

fn create_test_rows(count: usize) -> Vec<(String, u32)> {
    (0..count).map(|i| (format!("T{}", i), i as u32 + 1)).collect()
}

fn create_large_page(count: usize, banner: &str) -> String {
    let owned = create_test_rows(count);
    let rows: Vec<Row<'_>> = owned
        .iter()
        .map(|(ticker, qty)| (ticker.as_str(), "Jane Doe", "$12.50", *qty))
        .collect();
    create_test_page(&rows, banner)
}

/// Settings pointed at the mock server with the given sources enabled
fn create_test_settings(base_url: &str, dir: &TempDir, sources: &[&str]) -> Settings {
    let mut settings = Settings::default();
    settings.scraper.base_url = base_url.to_string();
    settings.scraper.request_delay = 0.0;
    settings.scraper.retry_delay_base = 0.01;
    settings.scraper.max_retries = 2;
    settings
        .scraper
        .sources
        .retain(|name, _| sources.contains(&name.as_str()));
    settings.advanced.selenium.enabled = false;
    settings.database.path = dir.path().join("trades.db").to_string_lossy().into_owned();
    settings
}

fn create_test_coordinator(settings: Settings) -> Coordinator {
    Coordinator::with_renderer(
        Arc::new(settings),
        Arc::new(DisabledRenderer),
        CancellationToken::new(),
    )
    .expect("coordinator should start")
}

fn open_storage(dir: &TempDir) -> SqliteStorage {
    SqliteStorage::open(&dir.path().join("trades.db")).expect("database should open")
}

#[tokio::test]
async fn test_one_blocked_source_gives_partial_run() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/latest-insider-trading"))
        .respond_with(ResponseTemplate::new(200).set_body_string(create_large_page(100, "")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/insider-sales"))
        .respond_with(ResponseTemplate::new(403).set_body_string("Access denied"))
        .mount(&server)
        .await;

    let settings = create_test_settings(
        &server.uri(),
        &dir,
        &["latest_filings", "latest_sales"],
    );
    let coordinator = create_test_coordinator(settings);

    let report = coordinator.run_full(&[]).await.unwrap();

    assert_eq!(report.status, RunStatus::Partial);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.counts().new, 100);

    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0.source, "latest_sales");
    assert_eq!(failures[0].1, FailureKind::Blocked);

    let storage = open_storage(&dir);
    assert_eq!(storage.count_trades().unwrap(), 100);
    let run = storage.get_run(report.run_id).unwrap();
    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.totals.sources_ok, 1);
    assert_eq!(run.totals.sources_failed, 1);

    // A blocked source keeps its schedule due
    let blocked = storage.load_source_state("latest_sales").unwrap();
    assert!(blocked.last_full_refresh_at.is_none());
}

#[tokio::test]
async fn test_rerun_stores_no_duplicates() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    // Changing markup outside the table defeats the content-hash skip, so the
    // second pass goes through dedup row by row.
    Mock::given(method("GET"))
        .and(path("/latest-insider-trading"))
        .respond_with(ResponseTemplate::new(200).set_body_string(create_large_page(50, "first")))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/latest-insider-trading"))
        .respond_with(ResponseTemplate::new(200).set_body_string(create_large_page(50, "second")))
        .mount(&server)
        .await;

    let coordinator =
        create_test_coordinator(create_test_settings(&server.uri(), &dir, &["latest_filings"]));

    let first = coordinator.run_full(&[]).await.unwrap();
    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(first.counts().new, 50);

    let second = coordinator.run_full(&[]).await.unwrap();
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.counts().new, 0);
    assert_eq!(second.counts().unchanged, 50);

    let storage = open_storage(&dir);
    assert_eq!(storage.count_trades().unwrap(), 50);
    assert_eq!(storage.count_distinct_hashes().unwrap(), 50);
}

#[tokio::test]
async fn test_changed_filing_stores_new_revision() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/latest-insider-trading"))
        .respond_with(ResponseTemplate::new(200).set_body_string(create_test_page(
            &[("ACME", "Jane Doe", "$10.00", 100), ("BETA", "John Roe", "$5.00", 20)],
            "",
        )))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/latest-insider-trading"))
        .respond_with(ResponseTemplate::new(200).set_body_string(create_test_page(
            &[("ACME", "Jane Doe", "$10.25", 100), ("BETA", "John Roe", "$5.00", 20)],
            "",
        )))
        .mount(&server)
        .await;

    let coordinator =
        create_test_coordinator(create_test_settings(&server.uri(), &dir, &["latest_filings"]));

    coordinator.run_full(&[]).await.unwrap();
    let second = coordinator.run_full(&[]).await.unwrap();
    assert_eq!(second.counts().changed, 1);
    assert_eq!(second.counts().unchanged, 1);

    let storage = open_storage(&dir);
    assert_eq!(storage.count_trades().unwrap(), 3);
    assert_eq!(storage.count_distinct_hashes().unwrap(), 2);
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/latest-insider-trading"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/latest-insider-trading"))
        .respond_with(ResponseTemplate::new(200).set_body_string(create_large_page(5, "")))
        .mount(&server)
        .await;

    let coordinator =
        create_test_coordinator(create_test_settings(&server.uri(), &dir, &["latest_filings"]));

    let report = coordinator.run_full(&[]).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.counts().new, 5);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_source() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let coordinator =
        create_test_coordinator(create_test_settings(&server.uri(), &dir, &["latest_filings"]));

    let report = coordinator.run_full(&[]).await.unwrap();
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.exit_code(), 2);
    assert_eq!(
        report.sources[0].outcome.failure_kind(),
        Some(FailureKind::TransientNetwork)
    );
}

#[tokio::test]
async fn test_change_detection_escalates_and_ingests_new_filing() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    let old_rows = [("ACME", "Jane Doe", "$10.00", 100), ("BETA", "John Roe", "$5.00", 20)];
    let new_rows = [
        ("GAMA", "Ann Poe", "$7.00", 300),
        ("ACME", "Jane Doe", "$10.00", 100),
        ("BETA", "John Roe", "$5.00", 20),
    ];

    Mock::given(method("GET"))
        .and(path("/latest-insider-trading"))
        .respond_with(ResponseTemplate::new(200).set_body_string(create_test_page(&old_rows, "")))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/latest-insider-trading"))
        .respond_with(ResponseTemplate::new(200).set_body_string(create_test_page(&new_rows, "")))
        .mount(&server)
        .await;

    let coordinator =
        create_test_coordinator(create_test_settings(&server.uri(), &dir, &["latest_filings"]));

    coordinator.run_full(&[]).await.unwrap();
    let check = coordinator.run_check(&[]).await.unwrap();

    assert_eq!(check.status, RunStatus::Completed);
    let source = &check.sources[0];
    assert!(source.escalated);
    assert_eq!(source.kind, JobKind::FullRefresh);
    assert_eq!(source.outcome.counts().new, 1);

    let storage = open_storage(&dir);
    assert_eq!(storage.count_trades().unwrap(), 3);
    let state = storage.load_source_state("latest_filings").unwrap();
    assert!(state.last_change_check_at.is_some());
}

#[tokio::test]
async fn test_source_selection() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/insider-purchases"))
        .respond_with(ResponseTemplate::new(200).set_body_string(create_large_page(3, "")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/latest-insider-trading"))
        .respond_with(ResponseTemplate::new(200).set_body_string(create_large_page(3, "")))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/insider-sales"))
        .respond_with(ResponseTemplate::new(200).set_body_string(create_large_page(3, "")))
        .expect(0)
        .mount(&server)
        .await;

    let mut settings = create_test_settings(
        &server.uri(),
        &dir,
        &["latest_filings", "latest_purchases", "latest_sales"],
    );
    if let Some(sales) = settings.scraper.sources.get_mut("latest_sales") {
        sales.enabled = false;
    }
    let coordinator = create_test_coordinator(settings);

    // A disabled source is skipped even when named
    let report = coordinator
        .run_full(&["latest_purchases".to_string(), "latest_sales".to_string()])
        .await
        .unwrap();
    assert_eq!(report.sources.len(), 1);
    assert_eq!(report.sources[0].source, "latest_purchases");

    let storage = open_storage(&dir);
    assert_eq!(
        storage.count_by_source().unwrap(),
        vec![("latest_purchases".to_string(), 3)]
    );
}
