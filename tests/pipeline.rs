//! Library-level ingest runs against a temp SQLite database.

use std::path::PathBuf;
use std::sync::Arc;

use logtag::config::Config;
use logtag::db;
use logtag::dispatcher::ChunkStatus;
use logtag::geo::{GeoResolver, StaticLookup, UNKNOWN_COUNTRY};
use logtag::ingest::ingest_file;
use logtag::progress::NoProgress;
use logtag::query::{self, Page, RequestFilter};
use sqlx::Row;
use tempfile::TempDir;
use tokio::sync::watch;

fn test_config(tmp: &TempDir) -> Config {
    let rules_path = tmp.path().join("rules.json");
    std::fs::write(
        &rules_path,
        r#"{"filters": [
            {"rule": "(?i)union(?:\\s|%20)+select", "tags": ["sqli"]},
            {"rule": "(?i)select.+from", "tags": ["sqli", "id"]},
            {"rule": "\\.\\./", "tags": ["dt", "lfi"]}
        ]}"#,
    )
    .unwrap();

    let mut cfg = Config::minimal();
    cfg.db.path = tmp.path().join("data").join("logtag.sqlite");
    cfg.rules.path = rules_path;
    cfg.ingest.workers = 3;
    cfg
}

fn geo() -> GeoResolver {
    GeoResolver::new(Box::new(
        StaticLookup::new()
            .with("8.8.8.8", "United States")
            .with("81.2.69.142", "United Kingdom"),
    ))
}

fn line(second: u32, client: &str, url: &str, status: i64) -> String {
    format!(
        "2017-03-04 10:{:02}:{:02} 192.168.0.10 GET {} - 443 - {} Mozilla/5.0+(Windows+NT+10.0) https://shop.example.com/ {} 0 0 31\n",
        second / 60,
        second % 60,
        url,
        client,
        status
    )
}

fn write_log(tmp: &TempDir, body: &str) -> PathBuf {
    let path = tmp.path().join("u_ex170304.log");
    std::fs::write(&path, body).unwrap();
    path
}

#[tokio::test]
async fn malformed_lines_are_skipped_and_counted() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);

    let mut body = String::new();
    body.push_str("#Software: Microsoft Internet Information Services 8.5\n");
    body.push_str("#Fields: date time s-ip cs-method cs-uri-stem cs-uri-query s-port cs-username c-ip cs(User-Agent) cs(Referer) sc-status sc-substatus sc-win32-status time-taken\n");
    body.push_str(&line(0, "8.8.8.8", "/index.html", 200));
    body.push_str("\n");
    body.push_str(&line(1, "81.2.69.142", "/products?id=2%20UNION%20SELECT%20card%20FROM%20users", 500));
    body.push_str("2017-03-04 10:00:02 truncated\n");
    body.push_str(&line(2, "203.0.113.9", "/static/../../etc/passwd", 404));
    let path = write_log(&tmp, &body);

    let (_tx, cancel) = watch::channel(false);
    let report = ingest_file(&cfg, &path, geo(), Arc::new(NoProgress), cancel)
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.records_written(), 3);
    assert_eq!(report.lines_rejected(), 4);

    let pool = db::connect(&cfg).await.unwrap();
    let rows = query::list_requests(&pool, &RequestFilter::default(), None, Page::default())
        .await
        .unwrap();
    assert_eq!(rows.len(), 3);

    assert_eq!(rows[0].ip, "8.8.8.8");
    assert_eq!(rows[0].country, "United States");
    assert!(rows[0].tags.is_empty());
    assert_eq!(rows[0].datetime, "2017-03-04 10:00:00");
    assert_eq!(rows[0].user_agent, "Mozilla/5.0+(Windows+NT+10.0)");

    assert_eq!(rows[1].country, "United Kingdom");
    assert_eq!(rows[1].resp_status_code, 500);
    assert_eq!(rows[1].tags, vec!["id", "sqli"]);

    assert_eq!(rows[2].country, UNKNOWN_COUNTRY);
    assert_eq!(rows[2].tags, vec!["dt", "lfi"]);
}

#[tokio::test]
async fn many_chunks_store_every_line_once() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(&tmp);
    cfg.ingest.chunk_size_bytes = 1000;

    let mut body = String::new();
    for i in 0..500u32 {
        let url = if i % 7 == 0 {
            format!("/a/{}?q=1%20union%20select%202", i)
        } else {
            format!("/a/{}", i)
        };
        let client = if i % 2 == 0 { "8.8.8.8" } else { "81.2.69.142" };
        body.push_str(&line(i, client, &url, 200));
    }
    let path = write_log(&tmp, &body);

    let (_tx, cancel) = watch::channel(false);
    let report = ingest_file(&cfg, &path, geo(), Arc::new(NoProgress), cancel)
        .await
        .unwrap();

    assert!(report.outcomes.len() > 10);
    assert!(report.is_success());
    assert_eq!(report.records_written(), 500);
    let per_chunk: u64 = report.outcomes.iter().map(|o| o.records_written).sum();
    assert_eq!(per_chunk, 500);

    let pool = db::connect(&cfg).await.unwrap();
    let distinct: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT url) FROM requests")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(distinct, 500);

    let hits = query::ip_hits(&pool, None, Page::default()).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|h| h.hits == 250));

    let tagged = query::list_requests(
        &pool,
        &RequestFilter {
            ip: None,
            tags: vec!["sqli".to_string()],
        },
        None,
        Page {
            limit: 1000,
            offset: 0,
        },
    )
    .await
    .unwrap();
    assert_eq!(tagged.len(), (0..500).filter(|i| i % 7 == 0).count());
}

#[tokio::test]
async fn rows_within_a_chunk_keep_line_order() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(&tmp);
    cfg.ingest.chunk_size_bytes = 2000;

    let mut body = String::new();
    for i in 0..200u32 {
        body.push_str(&line(i, "8.8.8.8", &format!("/seq/{:04}", i), 200));
    }
    let path = write_log(&tmp, &body);

    let (_tx, cancel) = watch::channel(false);
    let report = ingest_file(&cfg, &path, geo(), Arc::new(NoProgress), cancel)
        .await
        .unwrap();
    assert!(report.outcomes.len() > 1);

    let pool = db::connect(&cfg).await.unwrap();
    let rows = sqlx::query("SELECT id, url FROM requests")
        .fetch_all(&pool)
        .await
        .unwrap();
    let mut by_id: Vec<(i64, String)> = rows.iter().map(|r| (r.get("id"), r.get("url"))).collect();
    by_id.sort();

    // Each chunk holds the write lock for its whole transaction, so ids only
    // step backwards in url order where one chunk's rows end.
    let breaks = by_id.windows(2).filter(|pair| pair[1].1 < pair[0].1).count();
    assert!(breaks < report.outcomes.len());
}

#[tokio::test]
async fn cancelled_run_persists_nothing() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(&tmp);
    cfg.ingest.chunk_size_bytes = 500;

    let mut body = String::new();
    for i in 0..50u32 {
        body.push_str(&line(i, "8.8.8.8", "/", 200));
    }
    let path = write_log(&tmp, &body);

    let (tx, cancel) = watch::channel(false);
    tx.send(true).unwrap();
    let report = ingest_file(&cfg, &path, geo(), Arc::new(NoProgress), cancel)
        .await
        .unwrap();

    assert!(!report.is_success());
    assert!(report
        .outcomes
        .iter()
        .all(|o| matches!(o.status, ChunkStatus::Cancelled)));

    let pool = db::connect(&cfg).await.unwrap();
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM requests")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn invalid_utf8_is_decoded_lossily() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);

    let mut bytes = line(0, "8.8.8.8", "/caf\u{e9}", 200).into_bytes();
    let mut bad = line(1, "8.8.8.8", "/latin1-XX", 200).into_bytes();
    let pos = bad.windows(2).position(|w| w == b"XX").unwrap();
    bad[pos] = 0xE9;
    bad[pos + 1] = b'!';
    bytes.extend_from_slice(&bad);
    let path = tmp.path().join("mixed.log");
    std::fs::write(&path, &bytes).unwrap();

    let (_tx, cancel) = watch::channel(false);
    let report = ingest_file(&cfg, &path, geo(), Arc::new(NoProgress), cancel)
        .await
        .unwrap();
    assert_eq!(report.records_written(), 2);

    let pool = db::connect(&cfg).await.unwrap();
    let urls: Vec<String> = sqlx::query_scalar("SELECT url FROM requests ORDER BY id")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(urls, vec!["/caf\u{e9}", "/latin1-\u{fffd}!"]);
}
