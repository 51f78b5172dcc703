//! SQL statements over the replica schema.
//!
//! Every function takes a `&mut SqliteConnection` so the same code runs on a
//! pooled connection (cache bootstrap) or inside a repository transaction.
//! Batched statements are built with [`QueryBuilder`] and split into chunks
//! of at most `batch_size` rows; callers pass keys already sorted so lock
//! acquisition order is deterministic.

use std::collections::BTreeSet;

use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use crate::models::{
    from_millis, to_millis, ApiImage, ApiRepository, Cve, Image, Repository, Severity,
    UNKNOWN_DESCRIPTION,
};

pub async fn load_repositories(conn: &mut SqliteConnection) -> Result<Vec<Repository>, sqlx::Error> {
    let rows: Vec<(i64, String, String, String, i64)> = sqlx::query_as(
        "SELECT id, external_id, registry, repository, modified_date FROM repository",
    )
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| Repository {
            id: row.0,
            external_id: row.1,
            registry: row.2,
            repository: row.3,
            modified_at: from_millis(row.4),
        })
        .collect())
}

pub async fn load_images(conn: &mut SqliteConnection) -> Result<Vec<Image>, sqlx::Error> {
    let rows: Vec<(i64, String, String, i64)> =
        sqlx::query_as("SELECT id, external_id, digest, modified_date FROM image")
            .fetch_all(&mut *conn)
            .await?;

    Ok(rows
        .into_iter()
        .map(|row| Image {
            id: row.0,
            external_id: row.1,
            digest: row.2,
            modified_at: from_millis(row.3),
        })
        .collect())
}

fn cve_from_row(row: (i64, String, String, String)) -> Cve {
    Cve {
        id: row.0,
        name: row.1,
        description: row.2,
        // The CHECK constraint limits the column to known values.
        severity: row.3.parse().unwrap_or(Severity::NotSet),
    }
}

pub async fn load_cves(conn: &mut SqliteConnection) -> Result<Vec<Cve>, sqlx::Error> {
    let rows: Vec<(i64, String, String, String)> =
        sqlx::query_as("SELECT id, name, description, severity FROM cve")
            .fetch_all(&mut *conn)
            .await?;

    Ok(rows.into_iter().map(cve_from_row).collect())
}

pub async fn insert_repository(
    conn: &mut SqliteConnection,
    api: &ApiRepository,
) -> Result<Repository, sqlx::Error> {
    let id = sqlx::query(
        "INSERT INTO repository (external_id, registry, repository, modified_date) VALUES (?, ?, ?, ?)",
    )
    .bind(&api.external_id)
    .bind(&api.registry)
    .bind(&api.repository)
    .bind(to_millis(api.modified_at))
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    Ok(Repository {
        id,
        external_id: api.external_id.clone(),
        registry: api.registry.clone(),
        repository: api.repository.clone(),
        modified_at: api.modified_at,
    })
}

pub async fn update_repository(
    conn: &mut SqliteConnection,
    repo: &Repository,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE repository SET registry = ?, repository = ?, modified_date = ? WHERE id = ?")
        .bind(&repo.registry)
        .bind(&repo.repository)
        .bind(to_millis(repo.modified_at))
        .bind(repo.id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

pub async fn insert_image(conn: &mut SqliteConnection, api: &ApiImage) -> Result<Image, sqlx::Error> {
    let id = sqlx::query("INSERT INTO image (external_id, digest, modified_date) VALUES (?, ?, ?)")
        .bind(&api.external_id)
        .bind(&api.digest)
        .bind(to_millis(api.modified_at))
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();

    Ok(Image {
        id,
        external_id: api.external_id.clone(),
        digest: api.digest.clone(),
        modified_at: api.modified_at,
    })
}

pub async fn update_image(conn: &mut SqliteConnection, image: &Image) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE image SET external_id = ?, modified_date = ? WHERE id = ?")
        .bind(&image.external_id)
        .bind(to_millis(image.modified_at))
        .bind(image.id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

/// Insert CVE rows that do not exist yet, leaving existing rows untouched.
///
/// A name that collides with a row inserted by another writer is skipped,
/// not reported. Returns the number of rows actually inserted.
pub async fn create_cves_if_absent(
    conn: &mut SqliteConnection,
    names: &[String],
    batch_size: usize,
) -> Result<u64, sqlx::Error> {
    let mut inserted = 0;

    for chunk in names.chunks(batch_size.max(1)) {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("INSERT INTO cve (name, description, severity) ");
        qb.push_values(chunk, |mut row, name| {
            row.push_bind(name.as_str())
                .push_bind(UNKNOWN_DESCRIPTION)
                .push_bind(Severity::NotSet.as_str());
        });
        qb.push(" ON CONFLICT(name) DO NOTHING");

        inserted += qb.build().execute(&mut *conn).await?.rows_affected();
    }

    Ok(inserted)
}

/// Read CVE rows by name.
pub async fn find_cves(
    conn: &mut SqliteConnection,
    names: &[String],
    batch_size: usize,
) -> Result<Vec<Cve>, sqlx::Error> {
    let mut cves = Vec::with_capacity(names.len());

    for chunk in names.chunks(batch_size.max(1)) {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT id, name, description, severity FROM cve WHERE name IN (");
        let mut list = qb.separated(", ");
        for name in chunk {
            list.push_bind(name.as_str());
        }
        list.push_unseparated(")");

        let rows: Vec<(i64, String, String, String)> =
            qb.build_query_as().fetch_all(&mut *conn).await?;
        cves.extend(rows.into_iter().map(cve_from_row));
    }

    Ok(cves)
}

/// Which association table a pair operation targets.
#[derive(Debug, Clone, Copy)]
pub enum Association {
    /// `repository_image (repository_id, image_id)`
    RepositoryImage,
    /// `image_cve (image_id, cve_id)`
    ImageCve,
}

impl Association {
    fn table(&self) -> &'static str {
        match self {
            Association::RepositoryImage => "repository_image",
            Association::ImageCve => "image_cve",
        }
    }

    fn owner_column(&self) -> &'static str {
        match self {
            Association::RepositoryImage => "repository_id",
            Association::ImageCve => "image_id",
        }
    }

    fn member_column(&self) -> &'static str {
        match self {
            Association::RepositoryImage => "image_id",
            Association::ImageCve => "cve_id",
        }
    }
}

/// Member ids currently associated with `owner_id`.
pub async fn associated_ids(
    conn: &mut SqliteConnection,
    assoc: Association,
    owner_id: i64,
) -> Result<BTreeSet<i64>, sqlx::Error> {
    let sql = format!(
        "SELECT {} FROM {} WHERE {} = ?",
        assoc.member_column(),
        assoc.table(),
        assoc.owner_column()
    );
    let ids: Vec<i64> = sqlx::query_scalar(&sql)
        .bind(owner_id)
        .fetch_all(&mut *conn)
        .await?;

    Ok(ids.into_iter().collect())
}

/// Insert `(owner_id, member_id)` pairs.
pub async fn insert_associations(
    conn: &mut SqliteConnection,
    assoc: Association,
    owner_id: i64,
    member_ids: &[i64],
    batch_size: usize,
) -> Result<u64, sqlx::Error> {
    let mut inserted = 0;

    for chunk in member_ids.chunks(batch_size.max(1)) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "INSERT INTO {} ({}, {}) ",
            assoc.table(),
            assoc.owner_column(),
            assoc.member_column()
        ));
        qb.push_values(chunk, |mut row, member_id| {
            row.push_bind(owner_id).push_bind(*member_id);
        });

        inserted += qb.build().execute(&mut *conn).await?.rows_affected();
    }

    Ok(inserted)
}

/// Delete `(owner_id, member_id)` pairs.
pub async fn delete_associations(
    conn: &mut SqliteConnection,
    assoc: Association,
    owner_id: i64,
    member_ids: &[i64],
    batch_size: usize,
) -> Result<u64, sqlx::Error> {
    let mut deleted = 0;

    for chunk in member_ids.chunks(batch_size.max(1)) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "DELETE FROM {} WHERE {} = ",
            assoc.table(),
            assoc.owner_column()
        ));
        qb.push_bind(owner_id);
        qb.push(format!(" AND {} IN (", assoc.member_column()));
        let mut list = qb.separated(", ");
        for member_id in chunk {
            list.push_bind(*member_id);
        }
        list.push_unseparated(")");

        deleted += qb.build().execute(&mut *conn).await?.rows_affected();
    }

    Ok(deleted)
}
