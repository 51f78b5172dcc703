//! Catalog reconciliation.
//!
//! Drives the three-level diff between the external catalog and the SQLite
//! replica:
//!
//! ```text
//! repository row ─▶ image rows ─▶ CVE rows ─▶ image↔CVE pairs ─▶ repository↔image pairs
//! ```
//!
//! Each repository is reconciled inside its own transaction. A failure rolls
//! back that repository only and the run continues with the next one; rows
//! written by the failed transaction are dropped from the pending buffer so
//! the cache never references rolled-back identifiers.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use anyhow::{Context, Result};
use sqlx::{SqliteConnection, SqlitePool};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::SyncContext;
use crate::catalog::{CatalogSource, HttpCatalog};
use crate::config::Config;
use crate::db;
use crate::error::SyncError;
use crate::models::{ApiImage, ApiRepository, Image};
use crate::profile::ProfileFilter;
use crate::store::{self, Association};

/// Knobs for one run.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Maximum rows per batched statement.
    pub batch_size: usize,
    /// Skip known repositories whose catalog timestamp did not advance.
    pub changed_only: bool,
    /// Roll back every repository transaction instead of committing it.
    pub dry_run: bool,
    /// Stop after this many repositories have been synced or have failed.
    pub limit: Option<usize>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: 500,
            changed_only: false,
            dry_run: false,
            limit: None,
        }
    }
}

/// Rows written (or, in dry-run mode, that would be written).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteStats {
    pub repositories_inserted: u64,
    pub repositories_updated: u64,
    pub images_inserted: u64,
    pub images_updated: u64,
    pub cves_inserted: u64,
    pub repository_images_inserted: u64,
    pub repository_images_deleted: u64,
    pub image_cves_inserted: u64,
    pub image_cves_deleted: u64,
}

impl WriteStats {
    pub fn total(&self) -> u64 {
        self.repositories_inserted
            + self.repositories_updated
            + self.images_inserted
            + self.images_updated
            + self.cves_inserted
            + self.repository_images_inserted
            + self.repository_images_deleted
            + self.image_cves_inserted
            + self.image_cves_deleted
    }

    pub fn merge(&mut self, other: &WriteStats) {
        self.repositories_inserted += other.repositories_inserted;
        self.repositories_updated += other.repositories_updated;
        self.images_inserted += other.images_inserted;
        self.images_updated += other.images_updated;
        self.cves_inserted += other.cves_inserted;
        self.repository_images_inserted += other.repository_images_inserted;
        self.repository_images_deleted += other.repository_images_deleted;
        self.image_cves_inserted += other.image_cves_inserted;
        self.image_cves_deleted += other.image_cves_deleted;
    }
}

/// Outcome of a run. Repository failures are counted, not returned.
#[derive(Debug, Default, Clone)]
pub struct RunSummary {
    pub in_catalog: usize,
    pub in_scope: usize,
    pub synced: usize,
    pub failed: usize,
    pub unchanged: usize,
    pub cancelled: bool,
    pub writes: WriteStats,
}

/// An image row that must be written before its CVEs are reconciled.
enum StagedImage {
    Insert(ApiImage),
    Update(Image),
}

/// Reconciliation engine for one run.
pub struct Reconciler<'a> {
    pool: SqlitePool,
    catalog: &'a dyn CatalogSource,
    ctx: SyncContext,
    options: SyncOptions,
}

impl<'a> Reconciler<'a> {
    /// Load the replica cache. Failure here is fatal to the run.
    pub async fn bootstrap(
        pool: SqlitePool,
        catalog: &'a dyn CatalogSource,
        options: SyncOptions,
    ) -> Result<Self, SyncError> {
        let ctx = SyncContext::load(&pool)
            .await
            .map_err(SyncError::Bootstrap)?;

        info!(
            repositories = ctx.committed().repositories.len(),
            images = ctx.committed().images.len(),
            cves = ctx.committed().cves.len(),
            "Loaded replica cache"
        );

        Ok(Self::with_context(pool, catalog, ctx, options))
    }

    /// Build an engine around an already loaded context.
    pub fn with_context(
        pool: SqlitePool,
        catalog: &'a dyn CatalogSource,
        ctx: SyncContext,
        options: SyncOptions,
    ) -> Self {
        Self {
            pool,
            catalog,
            ctx,
            options,
        }
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// Reconcile every in-scope repository.
    ///
    /// Only a failed repository enumeration is returned as an error;
    /// per-repository failures are logged and counted in the summary.
    pub async fn run(
        &mut self,
        profile: &ProfileFilter,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, SyncError> {
        let api_repos = self
            .catalog
            .list_repositories()
            .await
            .map_err(SyncError::Enumerate)?;

        let mut summary = RunSummary {
            in_catalog: api_repos.len(),
            ..Default::default()
        };
        info!(count = api_repos.len(), "Repositories in catalog");

        let to_sync = select_repositories(api_repos, profile);
        summary.in_scope = to_sync.len();

        let in_scope: HashSet<&str> = to_sync.iter().map(|r| r.external_id.as_str()).collect();
        let unknown = self
            .ctx
            .committed()
            .repositories
            .keys()
            .filter(|id| !in_scope.contains(id.as_str()))
            .count();
        info!(
            profile = profile.name().unwrap_or("-"),
            to_sync = to_sync.len(),
            not_in_scope = unknown,
            "Repositories to sync"
        );

        let total = to_sync.len();
        for (i, repo) in to_sync.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(remaining = total - i, "Sync cancelled, stopping before next repository");
                summary.cancelled = true;
                break;
            }

            if self.options.changed_only && self.is_unchanged(repo) {
                debug!(registry = %repo.registry, repository = %repo.repository, "Repository unchanged, skipping");
                summary.unchanged += 1;
                continue;
            }

            // Skipped repositories do not count against the limit.
            if let Some(limit) = self.options.limit {
                if summary.synced + summary.failed >= limit {
                    debug!(limit, "Repository limit reached");
                    break;
                }
            }

            info!(
                registry = %repo.registry,
                repository = %repo.repository,
                "Syncing repository [{}/{}]",
                i + 1,
                total
            );

            match self.sync_repository(repo).await {
                Ok(stats) => {
                    summary.synced += 1;
                    summary.writes.merge(&stats);
                }
                Err(e) => {
                    warn!(
                        registry = %repo.registry,
                        repository = %repo.repository,
                        error = %e,
                        "Syncing repository failed, skipping"
                    );
                    summary.failed += 1;
                }
            }
        }

        info!(
            synced = summary.synced,
            failed = summary.failed,
            unchanged = summary.unchanged,
            writes = summary.writes.total(),
            "Finished catalog sync"
        );

        Ok(summary)
    }

    fn is_unchanged(&self, repo: &ApiRepository) -> bool {
        self.ctx
            .resolve_repository(&repo.external_id)
            .is_some_and(|known| repo.modified_at <= known.modified_at)
    }

    /// Reconcile one repository inside its own transaction.
    ///
    /// On success the pending buffer is folded into the cache; on any error
    /// the transaction is rolled back and the buffer discarded.
    pub async fn sync_repository(&mut self, api: &ApiRepository) -> Result<WriteStats, SyncError> {
        let mut tx = self.pool.begin().await?;

        match self.apply_repository(&mut tx, api).await {
            Ok(stats) if self.options.dry_run => {
                let rolled_back = tx.rollback().await;
                self.ctx.discard();
                rolled_back?;
                Ok(stats)
            }
            Ok(stats) => match tx.commit().await {
                Ok(()) => {
                    self.ctx.fold();
                    Ok(stats)
                }
                Err(e) => {
                    self.ctx.discard();
                    Err(e.into())
                }
            },
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(error = %rb, "Rollback failed");
                }
                self.ctx.discard();
                Err(e)
            }
        }
    }

    async fn apply_repository(
        &mut self,
        conn: &mut SqliteConnection,
        api: &ApiRepository,
    ) -> Result<WriteStats, SyncError> {
        let mut stats = WriteStats::default();

        let repo = match self.ctx.resolve_repository(&api.external_id).cloned() {
            None => {
                let repo = store::insert_repository(conn, api).await?;
                stats.repositories_inserted += 1;
                self.ctx.stage_repository(repo.clone());
                repo
            }
            Some(mut known) if api.modified_at > known.modified_at => {
                known.registry = api.registry.clone();
                known.repository = api.repository.clone();
                known.modified_at = api.modified_at;
                store::update_repository(conn, &known).await?;
                stats.repositories_updated += 1;
                self.ctx.stage_repository(known.clone());
                known
            }
            Some(known) => known,
        };

        let api_images = by_digest(
            self.catalog
                .list_images(&api.registry, &api.repository)
                .await?,
        );

        let mut staged = Vec::new();
        for (digest, api_image) in &api_images {
            match self.ctx.resolve_image(digest) {
                None => staged.push(StagedImage::Insert(api_image.clone())),
                Some(known) if api_image.modified_at > known.modified_at => {
                    let mut updated = known.clone();
                    updated.external_id = api_image.external_id.clone();
                    updated.modified_at = api_image.modified_at;
                    staged.push(StagedImage::Update(updated));
                }
                Some(_) => {}
            }
        }
        debug!(catalog = api_images.len(), staged = staged.len(), "Images to sync");

        for image in staged {
            self.sync_image(conn, image, &mut stats).await?;
        }

        let mut wanted = BTreeSet::new();
        for digest in api_images.keys() {
            let image = self
                .ctx
                .resolve_image(digest)
                .ok_or_else(|| SyncError::UnresolvedImage(digest.clone()))?;
            wanted.insert(image.id);
        }

        let (inserted, deleted) = reconcile_associations(
            conn,
            Association::RepositoryImage,
            repo.id,
            &wanted,
            self.options.batch_size,
        )
        .await?;
        stats.repository_images_inserted += inserted;
        stats.repository_images_deleted += deleted;

        Ok(stats)
    }

    async fn sync_image(
        &mut self,
        conn: &mut SqliteConnection,
        staged: StagedImage,
        stats: &mut WriteStats,
    ) -> Result<(), SyncError> {
        let image = match staged {
            StagedImage::Insert(api) => {
                let image = store::insert_image(conn, &api).await?;
                stats.images_inserted += 1;
                image
            }
            StagedImage::Update(image) => {
                store::update_image(conn, &image).await?;
                stats.images_updated += 1;
                image
            }
        };
        self.ctx.stage_image(image.clone());

        let cve_names = self.catalog.list_cve_names(&image.external_id).await?;
        stats.cves_inserted += self.register_missing_cves(conn, &cve_names).await?;

        let mut wanted = BTreeSet::new();
        for name in &cve_names {
            let cve = self
                .ctx
                .resolve_cve(name)
                .ok_or_else(|| SyncError::UnresolvedCve(name.clone()))?;
            wanted.insert(cve.id);
        }

        let (inserted, deleted) = reconcile_associations(
            conn,
            Association::ImageCve,
            image.id,
            &wanted,
            self.options.batch_size,
        )
        .await?;
        stats.image_cves_inserted += inserted;
        stats.image_cves_deleted += deleted;

        Ok(())
    }

    /// Insert CVE names unknown to the cache, tolerating rows another
    /// writer created first, then stage their identifiers.
    async fn register_missing_cves(
        &mut self,
        conn: &mut SqliteConnection,
        names: &BTreeSet<String>,
    ) -> Result<u64, SyncError> {
        // BTreeSet iteration keeps the batch sorted by name.
        let missing: Vec<String> = names
            .iter()
            .filter(|name| self.ctx.resolve_cve(name).is_none())
            .cloned()
            .collect();

        if missing.is_empty() {
            return Ok(0);
        }
        debug!(count = missing.len(), "CVEs to insert");

        let inserted =
            store::create_cves_if_absent(conn, &missing, self.options.batch_size).await?;

        for cve in store::find_cves(conn, &missing, self.options.batch_size).await? {
            self.ctx.stage_cve(cve);
        }

        Ok(inserted)
    }
}

/// Apply the profile and order repositories deterministically.
///
/// A repository listed twice by the catalog is kept once, with its newest
/// timestamp.
fn select_repositories(api_repos: Vec<ApiRepository>, profile: &ProfileFilter) -> Vec<ApiRepository> {
    let mut by_id: BTreeMap<String, ApiRepository> = BTreeMap::new();
    for repo in api_repos {
        if !profile.includes(&repo.registry, &repo.repository) {
            continue;
        }
        match by_id.get(&repo.external_id) {
            Some(seen) if seen.modified_at >= repo.modified_at => {}
            _ => {
                by_id.insert(repo.external_id.clone(), repo);
            }
        }
    }

    let mut repos: Vec<ApiRepository> = by_id.into_values().collect();
    repos.sort_by(|a, b| {
        (&a.registry, &a.repository, &a.external_id).cmp(&(&b.registry, &b.repository, &b.external_id))
    });
    repos
}

/// Key catalog images by digest, keeping the newest entry per digest.
fn by_digest(images: Vec<ApiImage>) -> BTreeMap<String, ApiImage> {
    let mut map: BTreeMap<String, ApiImage> = BTreeMap::new();
    for image in images {
        match map.get(&image.digest) {
            Some(seen) if seen.modified_at >= image.modified_at => {}
            _ => {
                map.insert(image.digest.clone(), image);
            }
        }
    }
    map
}

/// Make the stored member set of `owner_id` equal `wanted`.
///
/// Inserts run before deletes; both are issued in ascending id order.
async fn reconcile_associations(
    conn: &mut SqliteConnection,
    assoc: Association,
    owner_id: i64,
    wanted: &BTreeSet<i64>,
    batch_size: usize,
) -> Result<(u64, u64), SyncError> {
    let stored = store::associated_ids(conn, assoc, owner_id).await?;

    let to_insert: Vec<i64> = wanted.difference(&stored).copied().collect();
    let to_delete: Vec<i64> = stored.difference(wanted).copied().collect();
    debug!(
        ?assoc,
        owner_id,
        insert = to_insert.len(),
        delete = to_delete.len(),
        "Association delta"
    );

    let mut inserted = 0;
    if !to_insert.is_empty() {
        inserted =
            store::insert_associations(conn, assoc, owner_id, &to_insert, batch_size).await?;
    }

    let mut deleted = 0;
    if !to_delete.is_empty() {
        deleted =
            store::delete_associations(conn, assoc, owner_id, &to_delete, batch_size).await?;
    }

    Ok((inserted, deleted))
}

/// Command-line overrides for `catalog-sync sync`.
#[derive(Debug, Clone, Default)]
pub struct SyncArgs {
    pub profile: Option<String>,
    pub changed_only: bool,
    pub dry_run: bool,
    pub limit: Option<usize>,
}

/// Entry point for `catalog-sync sync`.
pub async fn run_sync(
    config: &Config,
    args: SyncArgs,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    let catalog = HttpCatalog::new(&config.catalog)?;
    run_sync_with_catalog(config, &catalog, args, cancel).await
}

/// Run a sync against any [`CatalogSource`] and print the summary.
pub async fn run_sync_with_catalog(
    config: &Config,
    catalog: &dyn CatalogSource,
    args: SyncArgs,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    let profile = ProfileFilter::from_config(config, args.profile.as_deref())?;
    let options = SyncOptions {
        batch_size: config.sync.batch_size,
        changed_only: args.changed_only || config.sync.changed_only,
        dry_run: args.dry_run,
        limit: args.limit,
    };

    let pool = db::connect(config).await?;

    let mut reconciler = Reconciler::bootstrap(pool.clone(), catalog, options)
        .await
        .context("Failed to load the replica (has `catalog-sync init` been run?)")?;
    let summary = reconciler.run(&profile, &cancel).await?;

    if args.dry_run {
        println!("sync (dry-run)");
    } else {
        println!("sync");
    }
    println!("  profile: {}", profile.name().unwrap_or("(all)"));
    println!("  repositories in catalog: {}", summary.in_catalog);
    println!("  repositories in scope: {}", summary.in_scope);
    println!("  synced: {}", summary.synced);
    println!("  failed: {}", summary.failed);
    if summary.unchanged > 0 {
        println!("  unchanged: {}", summary.unchanged);
    }
    let w = &summary.writes;
    println!(
        "  repositories: +{} ~{}",
        w.repositories_inserted, w.repositories_updated
    );
    println!("  images: +{} ~{}", w.images_inserted, w.images_updated);
    println!("  cves: +{}", w.cves_inserted);
    println!(
        "  repository-image pairs: +{} -{}",
        w.repository_images_inserted, w.repository_images_deleted
    );
    println!(
        "  image-cve pairs: +{} -{}",
        w.image_cves_inserted, w.image_cves_deleted
    );
    if summary.cancelled {
        println!("cancelled");
    } else {
        println!("ok");
    }

    pool.close().await;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn repo(id: &str, registry: &str, name: &str, secs: i64) -> ApiRepository {
        ApiRepository {
            external_id: id.to_string(),
            registry: registry.to_string(),
            repository: name.to_string(),
            modified_at: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    fn image(id: &str, digest: &str, secs: i64) -> ApiImage {
        ApiImage {
            external_id: id.to_string(),
            digest: digest.to_string(),
            modified_at: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[test]
    fn selection_filters_sorts_and_dedups() {
        let profile =
            ProfileFilter::from_patterns("p", &["reg1/*".to_string()]).unwrap();
        let selected = select_repositories(
            vec![
                repo("3", "reg1", "zeta", 10),
                repo("1", "reg1", "alpha", 10),
                repo("2", "reg2", "beta", 10),
                repo("1", "reg1", "alpha", 20),
            ],
            &profile,
        );

        let ids: Vec<&str> = selected.iter().map(|r| r.external_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
        assert_eq!(selected[0].modified_at.timestamp(), 20);
    }

    #[test]
    fn duplicate_digests_keep_newest() {
        let map = by_digest(vec![
            image("a", "sha256:x", 20),
            image("b", "sha256:x", 10),
            image("c", "sha256:y", 5),
        ]);
        assert_eq!(map.len(), 2);
        assert_eq!(map["sha256:x"].external_id, "a");
    }

    #[test]
    fn write_stats_merge_and_total() {
        let mut a = WriteStats {
            images_inserted: 2,
            image_cves_inserted: 3,
            ..Default::default()
        };
        let b = WriteStats {
            images_inserted: 1,
            repository_images_deleted: 4,
            ..Default::default()
        };
        a.merge(&b);
        assert_eq!(a.images_inserted, 3);
        assert_eq!(a.total(), 10);
    }
}
