use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the replica tables and indexes. Safe to run repeatedly.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS repository (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            external_id TEXT NOT NULL UNIQUE,
            registry TEXT NOT NULL,
            repository TEXT NOT NULL,
            modified_date INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS image (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            external_id TEXT NOT NULL,
            digest TEXT NOT NULL UNIQUE,
            modified_date INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // CVE rows are shared with the vulnerability feed; severity stays NotSet
    // until that process enriches it.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cve (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL DEFAULT 'unknown',
            severity TEXT NOT NULL DEFAULT 'NotSet'
                CHECK (severity IN ('NotSet', 'None', 'Low', 'Moderate', 'Important', 'Critical'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS repository_image (
            repository_id INTEGER NOT NULL,
            image_id INTEGER NOT NULL,
            UNIQUE(repository_id, image_id),
            FOREIGN KEY (repository_id) REFERENCES repository(id),
            FOREIGN KEY (image_id) REFERENCES image(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS image_cve (
            image_id INTEGER NOT NULL,
            cve_id INTEGER NOT NULL,
            UNIQUE(image_id, cve_id),
            FOREIGN KEY (image_id) REFERENCES image(id),
            FOREIGN KEY (cve_id) REFERENCES cve(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_repository_name ON repository(registry, repository)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_repository_image_image ON repository_image(image_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_image_cve_cve ON image_cve(cve_id)")
        .execute(pool)
        .await?;

    Ok(())
}
