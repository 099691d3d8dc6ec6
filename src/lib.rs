//! # logtag
//!
//! Batch ingestion of web-server access logs into a queryable store.
//!
//! A log file is split into line-aligned byte ranges, each range is parsed,
//! tagged against a regex rule set and enriched with the client's country,
//! and every range is committed to SQLite in its own transaction.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────────────────────┐   ┌──────────┐
//! │ Planner  │──▶│ Dispatcher (N workers)      │──▶│  SQLite  │
//! │ byte     │   │ parse → classify → geo     │   │ requests │
//! │ ranges   │   │ one commit per chunk       │   └────┬─────┘
//! └──────────┘   └────────────────────────────┘        │
//!                                                      ▼
//!                                               ┌────────────┐
//!                                               │  reports   │
//!                                               └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! logtag init                              # create database
//! logtag rules check                       # validate the rule document
//! logtag ingest /var/log/iis/u_ex170101.log
//! logtag report requests --tags sqli
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`parser`] | Access-log line parsing |
//! | [`rules`] | Regex rule set and URL classification |
//! | [`geo`] | Offline IP → country resolution |
//! | [`planner`] | Line-aligned chunk planning |
//! | [`dispatcher`] | Bounded parallel chunk processing |
//! | [`sink`] | Per-chunk atomic persistence |
//! | [`ingest`] | Run orchestration and summary |
//! | [`query`] | Read-side reports |
//! | [`progress`] | Ingest progress reporting |
//! | [`error`] | Typed line, rule and chunk errors |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod geo;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod parser;
pub mod planner;
pub mod progress;
pub mod query;
pub mod rules;
pub mod sink;
