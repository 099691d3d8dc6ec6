//! Ingest progress reporting.
//!
//! Reports observable progress during `logtag ingest` so users see how many
//! chunks are planned and how many have finished. Progress is emitted on
//! **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for an ingest run.
#[derive(Clone, Debug)]
pub enum IngestProgressEvent {
    /// The file has been split into `chunks` ranges covering `bytes` bytes.
    Planned { file: String, chunks: u64, bytes: u64 },
    /// `n` of `total` chunks have finished (committed, failed or cancelled).
    ChunkFinished {
        n: u64,
        total: u64,
        records: u64,
        ok: bool,
    },
}

/// Reports ingest progress. Implementations write to stderr (human or JSON).
pub trait IngestProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the dispatcher.
    fn report(&self, event: IngestProgressEvent);
}

/// Human-friendly progress on stderr: "ingest  12 / 40 chunks  (+83,211 records)".
pub struct StderrProgress;

impl IngestProgressReporter for StderrProgress {
    fn report(&self, event: IngestProgressEvent) {
        let line = match &event {
            IngestProgressEvent::Planned {
                file,
                chunks,
                bytes,
            } => format!(
                "ingest {}  {} chunks  {} bytes\n",
                file,
                format_number(*chunks),
                format_number(*bytes)
            ),
            IngestProgressEvent::ChunkFinished {
                n,
                total,
                records,
                ok,
            } => format!(
                "ingest  {} / {} chunks  (+{} records){}\n",
                format_number(*n),
                format_number(*total),
                format_number(*records),
                if *ok { "" } else { "  FAILED" }
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl IngestProgressReporter for JsonProgress {
    fn report(&self, event: IngestProgressEvent) {
        let obj = match &event {
            IngestProgressEvent::Planned {
                file,
                chunks,
                bytes,
            } => serde_json::json!({
                "event": "planned",
                "file": file,
                "chunks": chunks,
                "bytes": bytes
            }),
            IngestProgressEvent::ChunkFinished {
                n,
                total,
                records,
                ok,
            } => serde_json::json!({
                "event": "chunk",
                "n": n,
                "total": total,
                "records": records,
                "ok": ok
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl IngestProgressReporter for NoProgress {
    fn report(&self, _event: IngestProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn IngestProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

impl std::str::FromStr for ProgressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(ProgressMode::Off),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            other => Err(format!(
                "unknown progress mode '{}': expected off, human or json",
                other
            )),
        }
    }
}
