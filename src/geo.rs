//! Offline IP → country resolution.
//!
//! [`GeoResolver::resolve`] is a total function: malformed input, database
//! misses and lookup errors all degrade to [`UNKNOWN_COUNTRY`]. The backend
//! sits behind [`CountryLookup`] so the pipeline can run against a MaxMind
//! `.mmdb` file in production and an in-memory table in tests.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use maxminddb::{geoip2, MaxMindDBError, Reader};

use crate::error::GeoLookupError;

/// Sentinel returned whenever a country cannot be determined.
pub const UNKNOWN_COUNTRY: &str = "Unknown";

/// A read-only country database. Shared across workers without locking.
pub trait CountryLookup: Send + Sync {
    /// English display name of the country for `ip`, `None` on a miss.
    fn country(&self, ip: IpAddr) -> Result<Option<String>, GeoLookupError>;
}

/// MaxMind GeoLite2/GeoIP2 Country database, loaded fully into memory.
pub struct MaxMindLookup {
    reader: Reader<Vec<u8>>,
}

impl MaxMindLookup {
    pub fn open(path: &Path) -> Result<Self> {
        let reader = Reader::open_readfile(path)
            .with_context(|| format!("Failed to open geo database: {}", path.display()))?;
        Ok(Self { reader })
    }
}

impl CountryLookup for MaxMindLookup {
    fn country(&self, ip: IpAddr) -> Result<Option<String>, GeoLookupError> {
        match self.reader.lookup::<geoip2::Country>(ip) {
            Ok(record) => Ok(record
                .country
                .and_then(|c| c.names)
                .and_then(|names| names.get("en").map(|name| name.to_string()))),
            Err(MaxMindDBError::AddressNotFoundError(_)) => Ok(None),
            Err(e) => Err(GeoLookupError::Database(e.to_string())),
        }
    }
}

/// Fixed IP → country table.
#[derive(Debug, Default, Clone)]
pub struct StaticLookup {
    entries: HashMap<IpAddr, String>,
}

impl StaticLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, ip: &str, country: &str) -> Self {
        if let Ok(addr) = ip.parse() {
            self.entries.insert(addr, country.to_string());
        }
        self
    }
}

impl CountryLookup for StaticLookup {
    fn country(&self, ip: IpAddr) -> Result<Option<String>, GeoLookupError> {
        Ok(self.entries.get(&ip).cloned())
    }
}

pub struct GeoResolver {
    backend: Box<dyn CountryLookup>,
}

impl GeoResolver {
    pub fn new(backend: Box<dyn CountryLookup>) -> Self {
        Self { backend }
    }

    /// Open a MaxMind database file.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Box::new(MaxMindLookup::open(path)?)))
    }

    /// Country name for `ip`, or `"Unknown"`. Never fails.
    pub fn resolve(&self, ip: &str) -> String {
        match self.lookup(ip) {
            Ok(Some(country)) if !country.is_empty() => country,
            Ok(_) => UNKNOWN_COUNTRY.to_string(),
            Err(e) => {
                tracing::trace!(ip, error = %e, "geo lookup failed");
                UNKNOWN_COUNTRY.to_string()
            }
        }
    }

    fn lookup(&self, ip: &str) -> Result<Option<String>, GeoLookupError> {
        let addr: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| GeoLookupError::InvalidIp(ip.to_string()))?;
        self.backend.country(addr)
    }
}
