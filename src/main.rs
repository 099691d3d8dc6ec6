//! # logtag CLI
//!
//! The `logtag` binary ingests access logs into SQLite and prints reports
//! over what was ingested.
//!
//! ## Usage
//!
//! ```bash
//! logtag --config ./config/logtag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `logtag init` | Create the SQLite database and schema |
//! | `logtag ingest <FILE>` | Parse, tag, geo-enrich and store a log file |
//! | `logtag rules check` | Compile the rule document and list invalid rules |
//! | `logtag report unique-ips` | Distinct client IPs |
//! | `logtag report ip-hits` | Hits per client IP and country |
//! | `logtag report requests` | Stored requests, filterable by IP and tags |
//!
//! Logs go to stderr and honour `RUST_LOG` (default `info`). Command
//! results go to stdout.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use logtag::progress::ProgressMode;
use logtag::query::{self, Page, Report, RequestFilter};
use logtag::{config, ingest, migrate, rules};

/// logtag: batch ingestion and threat tagging of web access logs.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/logtag.toml` for an example.
#[derive(Parser)]
#[command(
    name = "logtag",
    about = "Batch ingestion and threat tagging of web access logs",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/logtag.toml`. Database, rule document, geo
    /// database and ingest tuning are read from this file.
    #[arg(long, global = true, default_value = "./config/logtag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the `requests` table.
    /// Running it again is safe.
    Init,

    /// Ingest an access log file.
    ///
    /// The file is split into line-aligned chunks that are processed in
    /// parallel. Each chunk is committed on its own: a failing chunk does
    /// not roll back the others.
    Ingest {
        /// Access log to ingest.
        file: PathBuf,

        /// Progress output on stderr: off, human or json.
        /// Defaults to human when stderr is a terminal.
        #[arg(long)]
        progress: Option<ProgressMode>,
    },

    /// Rule document utilities.
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },

    /// Reports over ingested requests.
    Report {
        #[command(subcommand)]
        kind: ReportKind,
    },
}

#[derive(Subcommand)]
enum RulesAction {
    /// Compile every rule and list the ones that fail.
    Check,
}

#[derive(Subcommand)]
enum ReportKind {
    /// Distinct client IPs.
    UniqueIps {
        #[command(flatten)]
        page: PageArgs,
    },
    /// Request count per client IP and country.
    IpHits {
        #[command(flatten)]
        page: PageArgs,
    },
    /// Stored requests.
    Requests {
        /// Only requests from this client IP.
        #[arg(long)]
        ip: Option<String>,

        /// Comma-separated tags; every tag must be present (e.g. `sqli,xss`).
        #[arg(long)]
        tags: Option<String>,

        #[command(flatten)]
        page: PageArgs,
    },
}

#[derive(Args)]
struct PageArgs {
    /// Sort key as `column.asc` or `column.desc`.
    #[arg(long)]
    order_by: Option<String>,

    /// Maximum number of rows.
    #[arg(long, default_value_t = query::DEFAULT_LIMIT)]
    limit: i64,

    /// Rows to skip.
    #[arg(long, default_value_t = 0)]
    offset: i64,

    /// Print JSON instead of text.
    #[arg(long)]
    json: bool,
}

impl PageArgs {
    fn page(&self) -> Page {
        Page {
            limit: self.limit,
            offset: self.offset,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { file, progress } => {
            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            ingest::run_ingest(&cfg, &file, mode).await?;
        }
        Commands::Rules { action } => match action {
            RulesAction::Check => {
                rules::run_check(&cfg.rules.path)?;
            }
        },
        Commands::Report { kind } => {
            let (report, page) = match kind {
                ReportKind::UniqueIps { page } => (Report::UniqueIps, page),
                ReportKind::IpHits { page } => (Report::IpHits, page),
                ReportKind::Requests { ip, tags, page } => (
                    Report::Requests(RequestFilter {
                        ip,
                        tags: tags.as_deref().map(query::parse_tag_filter).unwrap_or_default(),
                    }),
                    page,
                ),
            };
            query::run_report(&cfg, report, page.order_by.as_deref(), page.page(), page.json).await?;
        }
    }

    Ok(())
}
