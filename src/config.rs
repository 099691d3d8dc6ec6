use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::planner::DEFAULT_CHUNK_SIZE;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    pub rules: RulesConfig,
    pub geo: GeoConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

fn default_busy_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Exit non-zero when any chunk failed or was cancelled.
    #[serde(default)]
    pub strict: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: default_chunk_size(),
            workers: default_workers(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            strict: false,
        }
    }
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}
fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
fn default_shutdown_grace_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RulesConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeoConfig {
    pub database: PathBuf,
}

impl Config {
    /// Config with default tuning and placeholder paths.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/logtag.sqlite"),
                busy_timeout_secs: default_busy_timeout_secs(),
            },
            ingest: IngestConfig::default(),
            rules: RulesConfig {
                path: PathBuf::from("./config/default_filter.json"),
            },
            geo: GeoConfig {
                database: PathBuf::from("./data/GeoLite2-Country.mmdb"),
            },
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.ingest.chunk_size_bytes == 0 {
        anyhow::bail!("ingest.chunk_size_bytes must be > 0");
    }

    if config.ingest.workers == 0 {
        anyhow::bail!("ingest.workers must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let cfg: Config = toml::from_str(
            r#"
            [db]
            path = "/tmp/x.sqlite"

            [rules]
            path = "rules.json"

            [geo]
            database = "geo.mmdb"
            "#,
        )
        .unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.db.busy_timeout_secs, 60);
        assert_eq!(cfg.ingest.chunk_size_bytes, 10 * 1024 * 1024);
        assert!(cfg.ingest.workers >= 1);
        assert_eq!(cfg.ingest.shutdown_grace_secs, 30);
        assert!(!cfg.ingest.strict);
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let mut cfg = Config::minimal();
        cfg.ingest.chunk_size_bytes = 0;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let mut cfg = Config::minimal();
        cfg.ingest.workers = 0;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn missing_rules_section_fails_to_parse() {
        let parsed: std::result::Result<Config, _> = toml::from_str(
            r#"
            [db]
            path = "/tmp/x.sqlite"

            [geo]
            database = "geo.mmdb"
            "#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = load_config(Path::new("/nonexistent/logtag.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
