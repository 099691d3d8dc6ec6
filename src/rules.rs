//! Data-driven URL classification.
//!
//! A [`RuleSet`] is an ordered list of compiled patterns, each paired with
//! the threat tags it emits. It is loaded once at startup from a JSON rule
//! document and never mutated afterwards, so workers share it behind an
//! `Arc` without locking.
//!
//! Two document shapes are accepted:
//!
//! ```json
//! { "filters": [ { "rule": "union\\s+select", "tags": ["sqli"] } ] }
//! ```
//!
//! and the PHPIDS `default_filter.json` layout:
//!
//! ```json
//! { "filters": { "filter": [ { "id": "1", "rule": "...", "tags": { "tag": ["xss", "csrf"] } } ] } }
//! ```
//!
//! Patterns that fail to compile are dropped and reported as
//! [`InvalidRule`] diagnostics. They never reach [`RuleSet::classify`].

use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;

use crate::error::InvalidRule;
use crate::models::TagSet;

#[derive(Debug, Deserialize)]
struct RuleDocument {
    filters: Filters,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Filters {
    Wrapped { filter: Vec<RuleEntry> },
    Flat(Vec<RuleEntry>),
}

/// One filter entry as written in the rule document.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleEntry {
    #[serde(default)]
    pub id: Option<Scalar>,
    pub rule: String,
    #[serde(default)]
    pub tags: TagField,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub impact: Option<Scalar>,
}

impl RuleEntry {
    pub fn new(rule: &str, tags: &[&str]) -> Self {
        Self {
            id: None,
            rule: rule.to_string(),
            tags: TagField::List(tags.iter().map(|t| t.to_string()).collect()),
            description: None,
            impact: None,
        }
    }
}

/// PHPIDS writes ids and impacts as strings, hand-written files often use numbers.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Text(String),
    Number(i64),
}

impl std::fmt::Display for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scalar::Text(s) => f.write_str(s),
            Scalar::Number(n) => write!(f, "{}", n),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TagField {
    Nested { tag: OneOrMany },
    List(Vec<String>),
    Single(String),
}

impl Default for TagField {
    fn default() -> Self {
        TagField::List(Vec::new())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl TagField {
    fn into_tags(self) -> Vec<String> {
        let raw = match self {
            TagField::Nested {
                tag: OneOrMany::One(t),
            }
            | TagField::Single(t) => vec![t],
            TagField::Nested {
                tag: OneOrMany::Many(ts),
            }
            | TagField::List(ts) => ts,
        };
        raw.into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect()
    }
}

/// A compiled pattern and the tags it contributes on match.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: Option<String>,
    pub pattern: Regex,
    pub tags: Vec<String>,
    pub description: Option<String>,
    pub impact: Option<String>,
}

/// Immutable, ordered rule set.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Read and compile a rule document from disk.
    pub fn load(path: &Path) -> Result<(Self, Vec<InvalidRule>)> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read rule file: {}", path.display()))?;
        Self::from_document(&content)
            .with_context(|| format!("Failed to parse rule file: {}", path.display()))
    }

    pub fn from_document(json: &str) -> Result<(Self, Vec<InvalidRule>)> {
        let doc: RuleDocument = serde_json::from_str(json)?;
        let entries = match doc.filters {
            Filters::Wrapped { filter } => filter,
            Filters::Flat(list) => list,
        };
        Ok(Self::from_entries(entries))
    }

    /// Compile entries in order. Entries whose pattern does not compile are
    /// skipped, logged, and returned as diagnostics.
    pub fn from_entries(entries: Vec<RuleEntry>) -> (Self, Vec<InvalidRule>) {
        let mut rules = Vec::with_capacity(entries.len());
        let mut invalid = Vec::new();

        for (index, entry) in entries.into_iter().enumerate() {
            match Regex::new(&entry.rule) {
                Ok(pattern) => rules.push(Rule {
                    id: entry.id.map(|id| id.to_string()),
                    pattern,
                    tags: entry.tags.into_tags(),
                    description: entry.description,
                    impact: entry.impact.map(|i| i.to_string()),
                }),
                Err(e) => {
                    let diag = InvalidRule {
                        index,
                        pattern: entry.rule,
                        reason: e.to_string(),
                    };
                    tracing::warn!(rule = index, "{}", diag);
                    invalid.push(diag);
                }
            }
        }

        (Self { rules }, invalid)
    }

    /// Tags of every rule matching `url`. No short-circuit, no duplicates.
    pub fn classify(&self, url: &str) -> TagSet {
        let mut tags = TagSet::new();
        for rule in &self.rules {
            if rule.pattern.is_match(url) {
                tags.extend(rule.tags.iter().cloned());
            }
        }
        tags
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// `logtag rules check`: compile the configured document and report.
pub fn run_check(path: &Path) -> Result<()> {
    let (rules, invalid) = RuleSet::load(path)?;

    println!("rules {}", path.display());
    println!("  valid: {}", rules.len());
    println!("  invalid: {}", invalid.len());
    for diag in &invalid {
        println!("  {}", diag);
    }
    Ok(())
}
