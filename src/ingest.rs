//! Ingestion pipeline orchestration.
//!
//! Coordinates a full run: startup checks → chunk planning → parallel
//! parse/classify/enrich → per-chunk commit → summary. Everything that can
//! make the whole run pointless (missing input, unreadable rules or geo
//! database, unusable store) is checked in [`prepare`] before any chunk is
//! dispatched. Failures after that point are contained per chunk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sqlx::SqlitePool;
use tokio::sync::watch;

use crate::config::Config;
use crate::db;
use crate::dispatcher::{ChunkStatus, Dispatcher, RunReport};
use crate::geo::GeoResolver;
use crate::migrate;
use crate::models::ChunkRange;
use crate::planner::plan_chunks;
use crate::progress::{format_number, IngestProgressEvent, IngestProgressReporter, ProgressMode};
use crate::rules::RuleSet;
use crate::sink::SqliteSink;

/// A validated run, ready to dispatch.
pub struct Prepared {
    pub path: PathBuf,
    pub file_size: u64,
    pub chunks: Vec<ChunkRange>,
    pub rules: Arc<RuleSet>,
    pub geo: Arc<GeoResolver>,
    pub pool: SqlitePool,
}

/// Fatal startup checks and shared-state construction.
pub async fn prepare(config: &Config, path: &Path, geo: GeoResolver) -> Result<Prepared> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("Input file not found: {}", path.display()))?;
    if !meta.is_file() {
        bail!("Input is not a regular file: {}", path.display());
    }
    std::fs::File::open(path)
        .with_context(|| format!("Input file is not readable: {}", path.display()))?;

    let (rules, invalid) = RuleSet::load(&config.rules.path)?;
    if !invalid.is_empty() {
        tracing::warn!(
            invalid = invalid.len(),
            "some rules were dropped, run `logtag rules check` for details"
        );
    }
    tracing::info!(rules = rules.len(), "rule set loaded");

    let chunks = plan_chunks(path, config.ingest.chunk_size_bytes)
        .with_context(|| format!("Failed to plan chunks for {}", path.display()))?;

    let pool = db::connect(config)
        .await
        .with_context(|| format!("Failed to open database: {}", config.db.path.display()))?;
    migrate::ensure_schema(&pool).await?;

    Ok(Prepared {
        path: path.to_path_buf(),
        file_size: meta.len(),
        chunks,
        rules: Arc::new(rules),
        geo: Arc::new(geo),
        pool,
    })
}

/// Run an ingest against an already-built geo resolver.
pub async fn ingest_file(
    config: &Config,
    path: &Path,
    geo: GeoResolver,
    progress: Arc<dyn IngestProgressReporter>,
    cancel: watch::Receiver<bool>,
) -> Result<RunReport> {
    let prepared = prepare(config, path, geo).await?;

    progress.report(IngestProgressEvent::Planned {
        file: prepared.path.display().to_string(),
        chunks: prepared.chunks.len() as u64,
        bytes: prepared.file_size,
    });
    tracing::info!(
        file = %prepared.path.display(),
        bytes = prepared.file_size,
        chunks = prepared.chunks.len(),
        workers = config.ingest.workers,
        "starting ingest"
    );

    let sink = Arc::new(SqliteSink::new(prepared.pool.clone()));
    let report = Dispatcher::new(&prepared.path, prepared.rules, prepared.geo, sink)
        .workers(config.ingest.workers)
        .shutdown_grace(Duration::from_secs(config.ingest.shutdown_grace_secs))
        .progress(progress)
        .run(prepared.chunks, cancel)
        .await;

    prepared.pool.close().await;
    Ok(report)
}

/// `logtag ingest <FILE>`: run, print the summary, apply the strict policy.
pub async fn run_ingest(config: &Config, path: &Path, progress: ProgressMode) -> Result<()> {
    let geo = GeoResolver::open(&config.geo.database)?;
    let file_size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, finishing in-flight chunks");
            let _ = cancel_tx.send(true);
        }
    });

    let result = ingest_file(config, path, geo, Arc::from(progress.reporter()), cancel_rx).await;
    ctrl_c.abort();
    let report = result?;

    print_summary(path, file_size, &report);

    if config.ingest.strict && !report.is_success() {
        bail!(
            "ingest incomplete: {} failed, {} cancelled chunk(s)",
            report.failed().count(),
            report.cancelled().count()
        );
    }
    Ok(())
}

fn print_summary(path: &Path, file_size: u64, report: &RunReport) {
    println!("ingest {}", path.display());
    println!("  size: {} bytes", format_number(file_size));
    println!("  chunks: {}", report.outcomes.len());
    println!("  records written: {}", format_number(report.records_written()));
    println!("  lines rejected: {}", format_number(report.lines_rejected()));
    println!("  failed chunks: {}", report.failed().count());
    println!("  cancelled chunks: {}", report.cancelled().count());
    println!("  elapsed: {:.2}s", report.elapsed.as_secs_f64());

    for outcome in &report.outcomes {
        if let ChunkStatus::Failed(err) = &outcome.status {
            println!("  failed {}: {}", outcome.chunk, err);
        }
    }

    let samples: Vec<_> = report
        .outcomes
        .iter()
        .flat_map(|o| o.rejected_samples.iter())
        .take(5)
        .collect();
    if !samples.is_empty() {
        println!("  sample rejected lines:");
        for sample in samples {
            println!("    {:?}", sample.line);
        }
    }

    if report.is_success() {
        println!("ok");
    } else {
        println!("completed with errors");
    }
}
