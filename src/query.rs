//! Read-side reports over ingested requests.
//!
//! Three views, each paged with `limit`/`offset` (default 100/0):
//!
//! - unique client IPs
//! - hits per `(ip, country)`
//! - request listing filtered by IP and by tag containment
//!
//! Sort keys are given as `column.asc` / `column.desc` and checked against a
//! per-view whitelist before being spliced into SQL.

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::models::{tags_from_json, PersistedRecord};

pub const DEFAULT_LIMIT: i64 = 100;

const UNIQUE_IP_COLUMNS: &[&str] = &["ip"];
const IP_HITS_COLUMNS: &[&str] = &["ip", "country", "hits"];
const REQUEST_COLUMNS: &[&str] = &[
    "id",
    "ip",
    "method",
    "url",
    "resp_status_code",
    "user_agent",
    "datetime",
    "country",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: &'static str,
    pub descending: bool,
}

impl OrderBy {
    fn asc(column: &'static str) -> Self {
        Self {
            column,
            descending: false,
        }
    }

    fn sql(&self) -> String {
        format!(
            "{} {}",
            self.column,
            if self.descending { "DESC" } else { "ASC" }
        )
    }
}

/// Parse `column[.asc|.desc]` against `allowed`.
pub fn parse_order_by(raw: &str, allowed: &[&'static str]) -> Result<OrderBy> {
    let (name, dir) = match raw.rsplit_once('.') {
        Some((name, dir)) => (name, dir),
        None => (raw, "asc"),
    };
    let descending = match dir.to_ascii_lowercase().as_str() {
        "asc" => false,
        "desc" => true,
        other => bail!("Unknown sort direction '{}': expected asc or desc", other),
    };
    let Some(column) = allowed.iter().find(|c| **c == name) else {
        bail!(
            "Cannot order by '{}'. Available: {}",
            name,
            allowed.join(", ")
        );
    };
    Ok(OrderBy {
        column: *column,
        descending,
    })
}

/// Split `"sqli, xss,sqli"` into a de-duplicated, sorted tag list.
pub fn parse_tag_filter(raw: &str) -> Vec<String> {
    let mut tags: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    tags.sort();
    tags.dedup();
    tags
}

#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    pub ip: Option<String>,
    /// Every listed tag must be present on a record.
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IpHits {
    pub ip: String,
    pub country: String,
    pub hits: i64,
}

pub async fn unique_ips(pool: &SqlitePool, order: Option<&str>, page: Page) -> Result<Vec<String>> {
    let order = match order {
        Some(raw) => parse_order_by(raw, UNIQUE_IP_COLUMNS)?,
        None => OrderBy::asc("ip"),
    };
    let sql = format!(
        "SELECT DISTINCT ip FROM requests ORDER BY {} LIMIT ? OFFSET ?",
        order.sql()
    );
    let ips: Vec<String> = sqlx::query_scalar(&sql)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(pool)
        .await?;
    Ok(ips)
}

pub async fn ip_hits(pool: &SqlitePool, order: Option<&str>, page: Page) -> Result<Vec<IpHits>> {
    let order = match order {
        Some(raw) => parse_order_by(raw, IP_HITS_COLUMNS)?,
        None => OrderBy::asc("ip"),
    };
    let sql = format!(
        r#"
        SELECT ip, country, COUNT(*) AS hits
        FROM requests
        GROUP BY ip, country
        ORDER BY {}, ip ASC, country ASC
        LIMIT ? OFFSET ?
        "#,
        order.sql()
    );
    let rows = sqlx::query(&sql)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(pool)
        .await?;

    Ok(rows
        .iter()
        .map(|row| IpHits {
            ip: row.get("ip"),
            country: row.get("country"),
            hits: row.get("hits"),
        })
        .collect())
}

pub async fn list_requests(
    pool: &SqlitePool,
    filter: &RequestFilter,
    order: Option<&str>,
    page: Page,
) -> Result<Vec<PersistedRecord>> {
    let order = match order {
        Some(raw) => parse_order_by(raw, REQUEST_COLUMNS)?,
        None => OrderBy::asc("id"),
    };

    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT id, ip, method, url, body, referrer, resp_status_code, user_agent, datetime, tags, country \
         FROM requests WHERE 1 = 1",
    );
    if let Some(ip) = &filter.ip {
        qb.push(" AND ip = ").push_bind(ip.clone());
    }
    for tag in &filter.tags {
        qb.push(" AND EXISTS (SELECT 1 FROM json_each(requests.tags) WHERE json_each.value = ")
            .push_bind(tag.clone())
            .push(")");
    }
    qb.push(format!(" ORDER BY {}", order.sql()));
    if order.column != "id" {
        qb.push(", id ASC");
    }
    qb.push(" LIMIT ").push_bind(page.limit);
    qb.push(" OFFSET ").push_bind(page.offset);

    let rows = qb.build().fetch_all(pool).await?;

    Ok(rows
        .iter()
        .map(|row| {
            let tags: String = row.get("tags");
            PersistedRecord {
                id: row.get("id"),
                ip: row.get("ip"),
                method: row.get("method"),
                url: row.get("url"),
                body: row.get("body"),
                referrer: row.get("referrer"),
                resp_status_code: row.get("resp_status_code"),
                user_agent: row.get("user_agent"),
                datetime: row.get("datetime"),
                tags: tags_from_json(&tags),
                country: row.get("country"),
            }
        })
        .collect())
}

/// Which report `logtag report` prints.
#[derive(Debug, Clone)]
pub enum Report {
    UniqueIps,
    IpHits,
    Requests(RequestFilter),
}

pub async fn run_report(
    config: &Config,
    report: Report,
    order: Option<&str>,
    page: Page,
    json: bool,
) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::ensure_schema(&pool).await?;

    match report {
        Report::UniqueIps => {
            let ips = unique_ips(&pool, order, page).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&ips)?);
            } else if ips.is_empty() {
                println!("No results.");
            } else {
                for ip in &ips {
                    println!("{}", ip);
                }
            }
        }
        Report::IpHits => {
            let hits = ip_hits(&pool, order, page).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else if hits.is_empty() {
                println!("No results.");
            } else {
                println!("{:<40} {:<32} {:>8}", "IP", "COUNTRY", "HITS");
                for h in &hits {
                    println!("{:<40} {:<32} {:>8}", h.ip, h.country, h.hits);
                }
            }
        }
        Report::Requests(filter) => {
            let records = list_requests(&pool, &filter, order, page).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No results.");
            } else {
                for r in &records {
                    println!(
                        "{} {} {} {} {} [{}]",
                        r.datetime, r.ip, r.method, r.resp_status_code, r.url, r.country
                    );
                    if !r.tags.is_empty() {
                        println!("    tags: {}", r.tags.join(", "));
                    }
                    println!("    referrer: {}", r.referrer);
                    println!("    user agent: {}", r.user_agent);
                    println!("    id: {}", r.id);
                }
            }
        }
    }

    pool.close().await;
    Ok(())
}
