//! Core data models used throughout catalog-sync.
//!
//! Two families of types live here: the `Api*` items produced by a
//! [`CatalogSource`](crate::catalog::CatalogSource) before reconciliation,
//! and the persisted rows of the replica (`Repository`, `Image`, `Cve`).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

/// Repository as reported by the external catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRepository {
    pub external_id: String,
    pub registry: String,
    pub repository: String,
    pub modified_at: DateTime<Utc>,
}

/// Image as reported by the external catalog for one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiImage {
    pub external_id: String,
    /// Content digest, the natural key of an image.
    pub digest: String,
    pub modified_at: DateTime<Utc>,
}

/// Repository row stored in SQLite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub id: i64,
    pub external_id: String,
    pub registry: String,
    pub repository: String,
    pub modified_at: DateTime<Utc>,
}

/// Image row stored in SQLite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub id: i64,
    pub external_id: String,
    pub digest: String,
    pub modified_at: DateTime<Utc>,
}

/// CVE row stored in SQLite.
///
/// Rows may be owned by another writer (a vulnerability feed). The sync
/// engine only creates them with default description and severity and never
/// touches them afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cve {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub severity: Severity,
}

/// Placeholder description for CVEs created by the sync engine.
pub const UNKNOWN_DESCRIPTION: &str = "unknown";

/// CVE severity as stored in the `cve.severity` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Severity {
    /// Not yet enriched by the vulnerability feed.
    #[default]
    NotSet,
    None,
    Low,
    Moderate,
    Important,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 6] = [
        Severity::NotSet,
        Severity::None,
        Severity::Low,
        Severity::Moderate,
        Severity::Important,
        Severity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::NotSet => "NotSet",
            Severity::None => "None",
            Severity::Low => "Low",
            Severity::Moderate => "Moderate",
            Severity::Important => "Important",
            Severity::Critical => "Critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Severity::ALL
            .into_iter()
            .find(|sev| sev.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown severity: '{}'", s))
    }
}

/// Convert a timestamp to the epoch-millisecond value stored in SQLite.
pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Convert a stored epoch-millisecond value back into a timestamp.
///
/// Out-of-range values clamp to the Unix epoch.
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Drop sub-millisecond precision so an external timestamp compares exactly
/// against its stored counterpart.
pub fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    from_millis(to_millis(ts))
}
