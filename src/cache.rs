//! In-memory replica of the store for the duration of one sync run.
//!
//! [`ReplicaCache`] holds the committed rows, loaded once at run start.
//! [`PendingBuffer`] holds rows written by the repository transaction that is
//! currently open. Lookups go through [`SyncContext`], which sees both, so
//! an image inserted for one repository is found again by a later step of
//! the same transaction.
//!
//! ```text
//!   resolve(key) ──▶ committed ──(miss)──▶ pending
//!
//!   commit   ──▶ fold:    pending ──▶ committed
//!   rollback ──▶ discard: pending ──▶ ∅
//! ```

use std::collections::HashMap;

use sqlx::SqlitePool;

use crate::models::{Cve, Image, Repository};
use crate::store;

/// Committed rows keyed by their natural identifiers.
#[derive(Debug, Default)]
pub struct ReplicaCache {
    /// Keyed by catalog external id.
    pub repositories: HashMap<String, Repository>,
    /// Keyed by content digest.
    pub images: HashMap<String, Image>,
    /// Keyed by CVE name.
    pub cves: HashMap<String, Cve>,
}

impl ReplicaCache {
    /// Bulk-read every repository, image and CVE row.
    pub async fn load(pool: &SqlitePool) -> Result<Self, sqlx::Error> {
        let mut conn = pool.acquire().await?;

        let repositories = store::load_repositories(&mut conn)
            .await?
            .into_iter()
            .map(|r| (r.external_id.clone(), r))
            .collect();
        let images = store::load_images(&mut conn)
            .await?
            .into_iter()
            .map(|i| (i.digest.clone(), i))
            .collect();
        let cves = store::load_cves(&mut conn)
            .await?
            .into_iter()
            .map(|c| (c.name.clone(), c))
            .collect();

        Ok(Self {
            repositories,
            images,
            cves,
        })
    }
}

/// Rows written inside the open repository transaction.
///
/// Only rows whose store identifier is already known are ever added.
#[derive(Debug, Default)]
pub struct PendingBuffer {
    pub repositories: HashMap<String, Repository>,
    pub images: HashMap<String, Image>,
    pub cves: HashMap<String, Cve>,
}

impl PendingBuffer {
    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty() && self.images.is_empty() && self.cves.is_empty()
    }

    pub fn len(&self) -> usize {
        self.repositories.len() + self.images.len() + self.cves.len()
    }
}

/// Committed cache plus pending buffer, owned by one run.
#[derive(Debug, Default)]
pub struct SyncContext {
    committed: ReplicaCache,
    pending: PendingBuffer,
}

fn lookup<'a, T>(
    committed: &'a HashMap<String, T>,
    pending: &'a HashMap<String, T>,
    key: &str,
) -> Option<&'a T> {
    match committed.get(key) {
        // An in-place update staged in this transaction shadows the committed row.
        Some(row) => Some(pending.get(key).unwrap_or(row)),
        None => pending.get(key),
    }
}

impl SyncContext {
    pub fn new(committed: ReplicaCache) -> Self {
        Self {
            committed,
            pending: PendingBuffer::default(),
        }
    }

    pub async fn load(pool: &SqlitePool) -> Result<Self, sqlx::Error> {
        Ok(Self::new(ReplicaCache::load(pool).await?))
    }

    pub fn committed(&self) -> &ReplicaCache {
        &self.committed
    }

    pub fn pending(&self) -> &PendingBuffer {
        &self.pending
    }

    pub fn resolve_repository(&self, external_id: &str) -> Option<&Repository> {
        lookup(
            &self.committed.repositories,
            &self.pending.repositories,
            external_id,
        )
    }

    pub fn resolve_image(&self, digest: &str) -> Option<&Image> {
        lookup(&self.committed.images, &self.pending.images, digest)
    }

    pub fn resolve_cve(&self, name: &str) -> Option<&Cve> {
        lookup(&self.committed.cves, &self.pending.cves, name)
    }

    pub fn stage_repository(&mut self, repository: Repository) {
        self.pending
            .repositories
            .insert(repository.external_id.clone(), repository);
    }

    pub fn stage_image(&mut self, image: Image) {
        self.pending.images.insert(image.digest.clone(), image);
    }

    pub fn stage_cve(&mut self, cve: Cve) {
        self.pending.cves.insert(cve.name.clone(), cve);
    }

    /// Move every pending row into the committed cache. Call after commit.
    pub fn fold(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        self.committed.repositories.extend(pending.repositories);
        self.committed.images.extend(pending.images);
        self.committed.cves.extend(pending.cves);
    }

    /// Drop every pending row. Call after rollback.
    pub fn discard(&mut self) {
        self.pending = PendingBuffer::default();
    }
}
