//! Bounded parallel chunk processing.
//!
//! The [`Dispatcher`] fans chunks out to at most `workers` concurrent tasks
//! and joins on all of them before returning a [`RunReport`]. Each task:
//!
//! 1. reads its own byte range through a fresh file handle,
//! 2. parses, classifies and geo-enriches every line on a blocking thread,
//! 3. hands the whole batch to the [`RecordSink`] in one commit.
//!
//! Only the immutable [`RuleSet`], [`GeoResolver`] and sink handle are
//! shared. A failed or panicking chunk is recorded in the report and never
//! disturbs its siblings.
//!
//! # Cancellation
//!
//! Once the cancel signal flips to `true`, no further chunks are started.
//! In-flight chunks get `shutdown_grace` to finish. Chunks still running
//! after that are aborted, and their uncommitted transactions roll back on
//! drop. Both kinds are reported as [`ChunkStatus::Cancelled`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{Id, JoinError, JoinSet};
use tracing::Instrument;

use crate::error::{ChunkError, MalformedLine};
use crate::geo::GeoResolver;
use crate::models::{ChunkRange, ParsedRequest};
use crate::parser::parse_line;
use crate::planner::read_range;
use crate::progress::{IngestProgressEvent, IngestProgressReporter, NoProgress};
use crate::rules::RuleSet;
use crate::sink::RecordSink;

/// Rejected lines kept per chunk for the run summary.
const MAX_REJECT_SAMPLES: usize = 3;

#[derive(Debug)]
pub enum ChunkStatus {
    Committed,
    Failed(ChunkError),
    Cancelled,
}

#[derive(Debug)]
pub struct ChunkOutcome {
    pub chunk: ChunkRange,
    pub records_written: u64,
    pub lines_rejected: u64,
    pub rejected_samples: Vec<MalformedLine>,
    pub status: ChunkStatus,
}

impl ChunkOutcome {
    fn cancelled(chunk: ChunkRange) -> Self {
        Self {
            chunk,
            records_written: 0,
            lines_rejected: 0,
            rejected_samples: Vec::new(),
            status: ChunkStatus::Cancelled,
        }
    }

    fn failed(chunk: ChunkRange, error: ChunkError) -> Self {
        Self {
            chunk,
            records_written: 0,
            lines_rejected: 0,
            rejected_samples: Vec::new(),
            status: ChunkStatus::Failed(error),
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self.status, ChunkStatus::Committed)
    }
}

/// Per-chunk outcomes of one run, ordered by chunk index.
#[derive(Debug)]
pub struct RunReport {
    pub outcomes: Vec<ChunkOutcome>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn records_written(&self) -> u64 {
        self.outcomes.iter().map(|o| o.records_written).sum()
    }

    pub fn lines_rejected(&self) -> u64 {
        self.outcomes.iter().map(|o| o.lines_rejected).sum()
    }

    pub fn failed(&self) -> impl Iterator<Item = &ChunkOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, ChunkStatus::Failed(_)))
    }

    pub fn cancelled(&self) -> impl Iterator<Item = &ChunkOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, ChunkStatus::Cancelled))
    }

    /// Every chunk committed.
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(ChunkOutcome::is_committed)
    }
}

/// Records and reject count produced from one chunk, in line order.
#[derive(Debug, Default)]
pub struct ChunkBatch {
    pub records: Vec<ParsedRequest>,
    pub rejected: u64,
    pub rejected_samples: Vec<MalformedLine>,
}

/// Read, parse, classify and enrich one chunk. Blocking.
pub fn process_chunk(
    path: &Path,
    chunk: &ChunkRange,
    rules: &RuleSet,
    geo: &GeoResolver,
) -> Result<ChunkBatch, ChunkError> {
    let bytes = read_range(path, chunk).map_err(|source| ChunkError::Io {
        chunk: *chunk,
        source,
    })?;

    let mut batch = ChunkBatch::default();
    for raw in bytes.split_inclusive(|&b| b == b'\n') {
        let text = String::from_utf8_lossy(raw);
        match parse_line(&text) {
            Ok(line) => {
                let tags = rules.classify(line.url);
                let country = geo.resolve(line.client_ip);
                batch.records.push(ParsedRequest::new(&line, tags, country));
            }
            Err(malformed) => {
                tracing::debug!(chunk = chunk.index, "can't parse: {:?}", malformed.line);
                batch.rejected += 1;
                if batch.rejected_samples.len() < MAX_REJECT_SAMPLES {
                    batch.rejected_samples.push(malformed);
                }
            }
        }
    }
    Ok(batch)
}

pub struct Dispatcher {
    path: PathBuf,
    rules: Arc<RuleSet>,
    geo: Arc<GeoResolver>,
    sink: Arc<dyn RecordSink>,
    workers: usize,
    shutdown_grace: Duration,
    progress: Arc<dyn IngestProgressReporter>,
}

impl Dispatcher {
    pub fn new(
        path: impl Into<PathBuf>,
        rules: Arc<RuleSet>,
        geo: Arc<GeoResolver>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        Self {
            path: path.into(),
            rules,
            geo,
            sink,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            shutdown_grace: Duration::from_secs(30),
            progress: Arc::new(NoProgress),
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn progress(mut self, progress: Arc<dyn IngestProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Process every chunk and wait for all of them.
    pub async fn run(&self, chunks: Vec<ChunkRange>, mut cancel: watch::Receiver<bool>) -> RunReport {
        let started = Instant::now();
        let total = chunks.len() as u64;
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks: JoinSet<ChunkOutcome> = JoinSet::new();
        let mut in_flight: HashMap<Id, ChunkRange> = HashMap::new();
        let mut outcomes: Vec<ChunkOutcome> = Vec::with_capacity(chunks.len());
        let mut finished = Finished { n: 0, total };
        let mut cancelled = false;

        let mut queue = chunks.into_iter().peekable();
        while let Some(&chunk) = queue.peek() {
            tokio::select! {
                biased;
                _ = wait_cancelled(&mut cancel) => {
                    tracing::warn!(pending = queue.len(), "cancellation requested, no new chunks will start");
                    cancelled = true;
                    break;
                }
                Some(joined) = tasks.join_next_with_id() => {
                    self.collect(joined, &mut in_flight, &mut outcomes, &mut finished);
                }
                permit = semaphore.clone().acquire_owned() => {
                    let Ok(permit) = permit else { break };
                    queue.next();
                    let id = self.spawn_chunk(&mut tasks, chunk, permit);
                    in_flight.insert(id, chunk);
                }
            }
        }

        for chunk in queue {
            outcomes.push(ChunkOutcome::cancelled(chunk));
        }

        let mut deadline = cancelled.then(|| tokio::time::Instant::now() + self.shutdown_grace);
        loop {
            let joined = match deadline {
                Some(at) => match tokio::time::timeout_at(at, tasks.join_next_with_id()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        tracing::warn!(in_flight = tasks.len(), "shutdown grace elapsed, aborting in-flight chunks");
                        tasks.abort_all();
                        deadline = None;
                        continue;
                    }
                },
                None if !cancelled => tokio::select! {
                    biased;
                    _ = wait_cancelled(&mut cancel) => {
                        tracing::warn!(in_flight = tasks.len(), "cancellation requested, waiting for in-flight chunks");
                        cancelled = true;
                        deadline = Some(tokio::time::Instant::now() + self.shutdown_grace);
                        continue;
                    }
                    joined = tasks.join_next_with_id() => joined,
                },
                None => tasks.join_next_with_id().await,
            };
            match joined {
                Some(joined) => self.collect(joined, &mut in_flight, &mut outcomes, &mut finished),
                None => break,
            }
        }

        outcomes.sort_by_key(|o| o.chunk.index);
        RunReport {
            outcomes,
            elapsed: started.elapsed(),
        }
    }

    fn spawn_chunk(
        &self,
        tasks: &mut JoinSet<ChunkOutcome>,
        chunk: ChunkRange,
        permit: OwnedSemaphorePermit,
    ) -> Id {
        let path = self.path.clone();
        let rules = Arc::clone(&self.rules);
        let geo = Arc::clone(&self.geo);
        let sink = Arc::clone(&self.sink);
        let span = tracing::info_span!("chunk", index = chunk.index, start = chunk.start, end = chunk.end);

        let handle = tasks.spawn(
            async move {
                let _permit = permit;
                run_chunk(path, chunk, rules, geo, sink).await
            }
            .instrument(span),
        );
        handle.id()
    }

    fn collect(
        &self,
        joined: Result<(Id, ChunkOutcome), JoinError>,
        in_flight: &mut HashMap<Id, ChunkRange>,
        outcomes: &mut Vec<ChunkOutcome>,
        finished: &mut Finished,
    ) {
        let outcome = match joined {
            Ok((id, outcome)) => {
                in_flight.remove(&id);
                outcome
            }
            Err(err) => {
                let Some(chunk) = in_flight.remove(&err.id()) else {
                    tracing::error!(error = %err, "finished task is not tracked");
                    return;
                };
                if err.is_cancelled() {
                    ChunkOutcome::cancelled(chunk)
                } else {
                    let error = ChunkError::Panicked {
                        chunk,
                        message: panic_message(err),
                    };
                    tracing::error!(chunk = chunk.index, "{}", error);
                    ChunkOutcome::failed(chunk, error)
                }
            }
        };

        finished.n += 1;
        self.progress.report(IngestProgressEvent::ChunkFinished {
            n: finished.n,
            total: finished.total,
            records: outcome.records_written,
            ok: outcome.is_committed(),
        });
        outcomes.push(outcome);
    }
}

async fn run_chunk(
    path: PathBuf,
    chunk: ChunkRange,
    rules: Arc<RuleSet>,
    geo: Arc<GeoResolver>,
    sink: Arc<dyn RecordSink>,
) -> ChunkOutcome {
    let parsed = tokio::task::spawn_blocking(move || process_chunk(&path, &chunk, &rules, &geo)).await;

    let batch = match parsed {
        Ok(Ok(batch)) => batch,
        Ok(Err(error)) => {
            tracing::error!("{}", error);
            return ChunkOutcome::failed(chunk, error);
        }
        Err(join_err) => {
            let error = ChunkError::Panicked {
                chunk,
                message: panic_message(join_err),
            };
            tracing::error!("{}", error);
            return ChunkOutcome::failed(chunk, error);
        }
    };

    let ChunkBatch {
        records,
        rejected,
        rejected_samples,
    } = batch;

    if rejected > 0 {
        tracing::info!(rejected, "skipped malformed lines");
    }

    match sink.commit(&chunk, records).await {
        Ok(result) => ChunkOutcome {
            chunk,
            records_written: result.rows,
            lines_rejected: rejected,
            rejected_samples,
            status: ChunkStatus::Committed,
        },
        Err(error) => {
            tracing::error!("{}", error);
            ChunkOutcome {
                chunk,
                records_written: 0,
                lines_rejected: rejected,
                rejected_samples,
                status: ChunkStatus::Failed(error.into()),
            }
        }
    }
}

/// Progress counter over chunks that actually ran. Chunks skipped by
/// cancellation never count.
struct Finished {
    n: u64,
    total: u64,
}

/// Resolves once the signal reads `true`. Pends forever if the sender is gone.
async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PersistenceError;
    use crate::geo::StaticLookup;
    use crate::planner::plan_chunks;
    use crate::rules::RuleEntry;
    use crate::sink::CommitResult;
    use async_trait::async_trait;
    use std::io::Write;
    use std::sync::Mutex;

    const GOOD: &str = "2017-01-01 00:00:00 1.2.3.4 GET /index.html - 80 - 8.8.8.8 Mozilla/5.0 http://example.com 200 0 0 10\n";
    const SQLI: &str = "2017-01-01 00:00:01 1.2.3.4 GET /login?id=1%20union%20select%201 - 80 - 9.9.9.9 sqlmap/1.0 http://example.com 500 0 0 10\n";

    /// Collects committed batches in memory. Fails chunks listed in `fail`.
    #[derive(Default)]
    struct MemorySink {
        committed: Mutex<Vec<(usize, Vec<ParsedRequest>)>>,
        fail: Vec<usize>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl RecordSink for MemorySink {
        async fn commit(
            &self,
            chunk: &ChunkRange,
            records: Vec<ParsedRequest>,
        ) -> Result<CommitResult, PersistenceError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail.contains(&chunk.index) {
                return Err(PersistenceError {
                    chunk: *chunk,
                    source: sqlx::Error::PoolTimedOut,
                });
            }
            let rows = records.len() as u64;
            self.committed.lock().unwrap().push((chunk.index, records));
            Ok(CommitResult {
                chunk: *chunk,
                rows,
                first_id: None,
                last_id: None,
            })
        }
    }

    fn rules() -> Arc<RuleSet> {
        let (rules, _) = RuleSet::from_entries(vec![RuleEntry::new("(?i)union(%20|\\s)+select", &["sqli"])]);
        Arc::new(rules)
    }

    fn geo() -> Arc<GeoResolver> {
        Arc::new(GeoResolver::new(Box::new(
            StaticLookup::new().with("8.8.8.8", "United States"),
        )))
    }

    fn log_file(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            file.write_all(line.as_bytes()).unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn no_cancel() -> watch::Receiver<bool> {
        let (_tx, rx) = watch::channel(false);
        rx
    }

    #[test]
    fn process_chunk_enriches_and_skips_malformed() {
        let file = log_file(&[GOOD, "this is not a log line\n", SQLI]);
        let chunks = plan_chunks(file.path(), 1 << 20).unwrap();
        let batch = process_chunk(file.path(), &chunks[0], &rules(), &geo()).unwrap();

        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.rejected, 1);
        assert_eq!(batch.rejected_samples[0].line, "this is not a log line");

        assert_eq!(batch.records[0].country, "United States");
        assert!(batch.records[0].tags.is_empty());
        assert_eq!(batch.records[1].country, "Unknown");
        assert!(batch.records[1].tags.contains("sqli"));
    }

    #[test]
    fn process_chunk_reports_io_errors() {
        let chunk = ChunkRange {
            index: 0,
            start: 0,
            end: 10,
        };
        let err = process_chunk(Path::new("/nonexistent/access.log"), &chunk, &rules(), &geo()).unwrap_err();
        assert!(matches!(err, ChunkError::Io { .. }));
    }

    #[tokio::test]
    async fn run_processes_every_chunk_in_line_order() {
        let lines: Vec<&str> = (0..40).map(|i| if i % 5 == 0 { SQLI } else { GOOD }).collect();
        let file = log_file(&lines);
        let chunks = plan_chunks(file.path(), 512).unwrap();
        assert!(chunks.len() > 3);

        let sink = Arc::new(MemorySink::default());
        let report = Dispatcher::new(file.path(), rules(), geo(), sink.clone())
            .workers(3)
            .run(chunks.clone(), no_cancel())
            .await;

        assert!(report.is_success());
        assert_eq!(report.outcomes.len(), chunks.len());
        assert_eq!(report.records_written(), 40);
        assert_eq!(report.lines_rejected(), 0);
        for (i, o) in report.outcomes.iter().enumerate() {
            assert_eq!(o.chunk.index, i);
        }

        let mut committed = sink.committed.lock().unwrap().clone();
        committed.sort_by_key(|(index, _)| *index);
        let urls: Vec<String> = committed
            .into_iter()
            .flat_map(|(_, records)| records.into_iter().map(|r| r.url))
            .collect();
        let expected: Vec<String> = lines
            .iter()
            .map(|l| crate::parser::parse_line(l).unwrap().url.to_string())
            .collect();
        assert_eq!(urls, expected);
    }

    #[tokio::test]
    async fn failing_chunk_does_not_abort_siblings() {
        let lines = vec![GOOD; 30];
        let file = log_file(&lines);
        let chunks = plan_chunks(file.path(), 400).unwrap();
        assert!(chunks.len() >= 3);

        let sink = Arc::new(MemorySink {
            fail: vec![1],
            ..Default::default()
        });
        let report = Dispatcher::new(file.path(), rules(), geo(), sink.clone())
            .workers(2)
            .run(chunks.clone(), no_cancel())
            .await;

        assert!(!report.is_success());
        let failed: Vec<usize> = report.failed().map(|o| o.chunk.index).collect();
        assert_eq!(failed, vec![1]);
        assert!(matches!(
            report.outcomes[1].status,
            ChunkStatus::Failed(ChunkError::Persistence(_))
        ));
        let written_elsewhere: u64 = report
            .outcomes
            .iter()
            .filter(|o| o.chunk.index != 1)
            .map(|o| o.records_written)
            .sum();
        assert_eq!(report.records_written(), written_elsewhere);
        assert_eq!(sink.committed.lock().unwrap().len(), chunks.len() - 1);
    }

    #[tokio::test]
    async fn unreadable_chunk_is_reported_per_chunk() {
        let file = log_file(&[GOOD]);
        let mut chunks = plan_chunks(file.path(), 1 << 20).unwrap();
        // A range past EOF cannot be read in full.
        chunks.push(ChunkRange {
            index: 1,
            start: chunks[0].end,
            end: chunks[0].end + 100,
        });

        let report = Dispatcher::new(file.path(), rules(), geo(), Arc::new(MemorySink::default()))
            .run(chunks, no_cancel())
            .await;

        assert!(report.outcomes[0].is_committed());
        assert!(matches!(
            report.outcomes[1].status,
            ChunkStatus::Failed(ChunkError::Io { .. })
        ));
    }

    #[derive(Default)]
    struct RecordingProgress {
        finished: Mutex<Vec<(u64, u64)>>,
    }

    impl IngestProgressReporter for RecordingProgress {
        fn report(&self, event: IngestProgressEvent) {
            if let IngestProgressEvent::ChunkFinished { n, total, .. } = event {
                self.finished.lock().unwrap().push((n, total));
            }
        }
    }

    #[tokio::test]
    async fn progress_counts_every_chunk_once() {
        let file = log_file(&vec![GOOD; 20]);
        let chunks = plan_chunks(file.path(), 300).unwrap();
        let total = chunks.len() as u64;

        let progress = Arc::new(RecordingProgress::default());
        Dispatcher::new(file.path(), rules(), geo(), Arc::new(MemorySink::default()))
            .workers(2)
            .progress(progress.clone())
            .run(chunks, no_cancel())
            .await;

        let seen = progress.finished.lock().unwrap().clone();
        let expected: Vec<(u64, u64)> = (1..=total).map(|n| (n, total)).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn progress_skips_chunks_never_started() {
        let file = log_file(&vec![GOOD; 20]);
        let chunks = plan_chunks(file.path(), 300).unwrap();
        assert!(chunks.len() > 2);
        let total = chunks.len() as u64;

        let sink = Arc::new(MemorySink {
            delay: Some(Duration::from_millis(300)),
            ..Default::default()
        });
        let progress = Arc::new(RecordingProgress::default());
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(true);
        });

        let report = Dispatcher::new(file.path(), rules(), geo(), sink)
            .workers(1)
            .shutdown_grace(Duration::from_secs(10))
            .progress(progress.clone())
            .run(chunks, rx)
            .await;

        // Only the chunk in flight at cancellation finished.
        assert_eq!(*progress.finished.lock().unwrap(), vec![(1, total)]);
        assert!(report.outcomes[0].is_committed());
        assert_eq!(report.cancelled().count() as u64, total - 1);
    }

    #[tokio::test]
    async fn cancelled_before_start_runs_nothing() {
        let file = log_file(&vec![GOOD; 20]);
        let chunks = plan_chunks(file.path(), 300).unwrap();
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let sink = Arc::new(MemorySink::default());
        let report = Dispatcher::new(file.path(), rules(), geo(), sink.clone())
            .run(chunks.clone(), rx)
            .await;

        assert_eq!(report.cancelled().count(), chunks.len());
        assert_eq!(report.records_written(), 0);
        assert!(sink.committed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_aborts_after_grace() {
        let file = log_file(&vec![GOOD; 20]);
        let chunks = plan_chunks(file.path(), 300).unwrap();
        assert!(chunks.len() > 2);

        let sink = Arc::new(MemorySink {
            delay: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let (tx, rx) = watch::channel(false);
        let dispatcher = Dispatcher::new(file.path(), rules(), geo(), sink.clone())
            .workers(1)
            .shutdown_grace(Duration::from_millis(50));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx.send(true);
        });

        let started = Instant::now();
        let report = dispatcher.run(chunks.clone(), rx).await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(report.outcomes.len(), chunks.len());
        assert_eq!(report.cancelled().count(), chunks.len());
        assert!(sink.committed.lock().unwrap().is_empty());
    }
}
