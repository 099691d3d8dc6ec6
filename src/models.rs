//! Core data models used throughout logtag.
//!
//! These types represent the chunk ranges, parsed requests, and persisted
//! records that flow through the ingestion pipeline.

use std::collections::BTreeSet;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::parser::LogLine;

/// Timestamp layout used for parsing log lines and for the `datetime` column.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Threat tags attached to a request. Duplicate-free and order-insensitive.
pub type TagSet = BTreeSet<String>;

/// A half-open byte range `[start, end)` of the source file, assigned to one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl std::fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} [{}..{})", self.index, self.start, self.end)
    }
}

/// A fully parsed, classified and geo-enriched access-log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub ip: String,
    pub method: String,
    pub url: String,
    pub body: String,
    pub referrer: String,
    pub resp_status_code: i64,
    pub user_agent: String,
    /// UTC, no offset tracked.
    pub datetime: NaiveDateTime,
    pub tags: TagSet,
    pub country: String,
}

impl ParsedRequest {
    pub fn new(line: &LogLine<'_>, tags: TagSet, country: String) -> Self {
        Self {
            ip: line.client_ip.to_string(),
            method: line.method.to_string(),
            url: line.url.to_string(),
            body: line.body.to_string(),
            referrer: line.referrer.to_string(),
            resp_status_code: line.resp_status_code,
            user_agent: line.user_agent.to_string(),
            datetime: line.datetime,
            tags,
            country,
        }
    }

    /// Tags as a sorted JSON array, the storage form of the `tags` column.
    pub fn tags_json(&self) -> String {
        tags_to_json(&self.tags)
    }
}

/// A request row as stored in SQLite, with its server-assigned id.
#[derive(Debug, Clone, Serialize)]
pub struct PersistedRecord {
    pub id: i64,
    pub ip: String,
    pub method: String,
    pub url: String,
    pub body: String,
    pub referrer: String,
    pub resp_status_code: i64,
    pub user_agent: String,
    pub datetime: String,
    pub tags: Vec<String>,
    pub country: String,
}

pub fn tags_to_json(tags: &TagSet) -> String {
    serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string())
}

pub fn tags_from_json(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}
