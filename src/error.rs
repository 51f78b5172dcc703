//! Error types for the catalog client and the reconciliation engine.

use thiserror::Error;

/// Failure talking to the external catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("catalog returned {status} for {url}: {body}")]
    Status {
        status: reqwest::StatusCode,
        url: String,
        body: String,
    },
    #[error("catalog request to {url} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        last: String,
    },
    #[error("invalid catalog url: {0}")]
    Url(String),
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Failure inside the reconciliation engine.
///
/// Everything except the bootstrap and enumeration failures is scoped to a
/// single repository: the repository's transaction is rolled back and the
/// run moves on.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("failed to load replica cache: {0}")]
    Bootstrap(#[source] sqlx::Error),
    #[error("failed to enumerate catalog repositories: {0}")]
    Enumerate(#[source] CatalogError),
    /// A CVE referenced by an image has no identifier even after the
    /// conflict-tolerant insert.
    #[error("CVE not resolvable after insert: {0}")]
    UnresolvedCve(String),
    /// An external image digest has no identifier when building the
    /// repository associations.
    #[error("image not resolvable in cache: {0}")]
    UnresolvedImage(String),
}

impl SyncError {
    /// Whether the error aborts the whole run rather than one repository.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Bootstrap(_) | SyncError::Enumerate(_))
    }
}
