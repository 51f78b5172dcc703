//! Replica statistics.
//!
//! A quick summary of what the replica holds: row counts per table, CVE
//! severity breakdown and the most recent catalog timestamp seen. Used by
//! `catalog-sync stats` to check that syncs are landing as expected.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::models::{from_millis, Severity};

/// Row counts for every replica table.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplicaStats {
    pub repositories: i64,
    pub images: i64,
    pub cves: i64,
    pub repository_images: i64,
    pub image_cves: i64,
    /// Images not linked to any repository.
    pub orphan_images: i64,
    pub by_severity: Vec<(Severity, i64)>,
    /// Newest repository `modified_date`, epoch milliseconds.
    pub latest_repository_update: Option<i64>,
}

async fn count(pool: &SqlitePool, sql: &str) -> Result<i64> {
    Ok(sqlx::query_scalar(sql).fetch_one(pool).await?)
}

/// Collect [`ReplicaStats`] from an open pool.
pub async fn collect(pool: &SqlitePool) -> Result<ReplicaStats> {
    let repositories = count(pool, "SELECT COUNT(*) FROM repository").await?;
    let images = count(pool, "SELECT COUNT(*) FROM image").await?;
    let cves = count(pool, "SELECT COUNT(*) FROM cve").await?;
    let repository_images = count(pool, "SELECT COUNT(*) FROM repository_image").await?;
    let image_cves = count(pool, "SELECT COUNT(*) FROM image_cve").await?;
    let orphan_images = count(
        pool,
        "SELECT COUNT(*) FROM image i \
         WHERE NOT EXISTS (SELECT 1 FROM repository_image ri WHERE ri.image_id = i.id)",
    )
    .await?;

    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT severity, COUNT(*) FROM cve GROUP BY severity")
            .fetch_all(pool)
            .await?;
    let by_severity = Severity::ALL
        .iter()
        .map(|severity| {
            let n = rows
                .iter()
                .find(|(name, _)| name == severity.as_str())
                .map(|(_, n)| *n)
                .unwrap_or(0);
            (*severity, n)
        })
        .collect();

    let latest_repository_update: Option<i64> =
        sqlx::query_scalar("SELECT MAX(modified_date) FROM repository")
            .fetch_one(pool)
            .await?;

    Ok(ReplicaStats {
        repositories,
        images,
        cves,
        repository_images,
        image_cves,
        orphan_images,
        by_severity,
        latest_repository_update,
    })
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = collect(&pool).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Catalog Replica Stats");
    println!("=====================");
    println!();
    println!("  Database:       {}", config.db.path.display());
    println!("  Size:           {}", format_bytes(db_size));
    println!();
    println!("  Repositories:   {}", stats.repositories);
    println!(
        "  Images:         {} ({} without repository)",
        stats.images, stats.orphan_images
    );
    println!("  CVEs:           {}", stats.cves);
    println!("  Repo↔Image:     {}", stats.repository_images);
    println!("  Image↔CVE:      {}", stats.image_cves);
    println!(
        "  Last update:    {}",
        match stats.latest_repository_update {
            Some(ms) => from_millis(ms).format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            None => "never".to_string(),
        }
    );

    if stats.cves > 0 {
        println!();
        println!("  By severity:");
        println!("  {:<12} {:>8}", "SEVERITY", "CVES");
        println!("  {}", "-".repeat(21));
        for (severity, n) in &stats.by_severity {
            println!("  {:<12} {:>8}", severity.as_str(), n);
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }
}
