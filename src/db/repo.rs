use super::model::{ImageLink, NewSpirit};
use crate::model::{ImageSource, Spirit, SpiritImage, SweepRun};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;

/// How long a writer waits for the database lock held by another connection.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const SPIRIT_COLUMNS: &str =
    "id, name, brand, category, image_url, thumbnail_url, primary_image_id";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);

    // Every connection to `sqlite::memory:` opens a fresh database, so keep
    // exactly one alive for the life of the pool.
    if normalized.starts_with("sqlite::memory") {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(&normalized)
            .await?;
        return Ok(pool);
    }

    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url: {normalized}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(BUSY_TIMEOUT);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn spirit_from_row(row: &SqliteRow) -> Spirit {
    Spirit {
        id: row.get("id"),
        name: row.get("name"),
        brand: row
            .try_get::<Option<String>, _>("brand")
            .ok()
            .flatten()
            .unwrap_or_default(),
        category: row.try_get::<Option<String>, _>("category").ok().flatten(),
        image_url: row
            .try_get::<Option<String>, _>("image_url")
            .ok()
            .flatten()
            .filter(|s| !s.trim().is_empty()),
        thumbnail_url: row
            .try_get::<Option<String>, _>("thumbnail_url")
            .ok()
            .flatten(),
        primary_image_id: row
            .try_get::<Option<String>, _>("primary_image_id")
            .ok()
            .flatten(),
    }
}

#[instrument(skip_all)]
pub async fn insert_spirit(pool: &Pool, spirit: &NewSpirit) -> Result<()> {
    sqlx::query(
        "INSERT INTO spirits (id, name, brand, category, image_url) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&spirit.id)
    .bind(&spirit.name)
    .bind(&spirit.brand)
    .bind(&spirit.category)
    .bind(&spirit.image_url)
    .execute(pool)
    .await
    .with_context(|| format!("failed to insert spirit {}", spirit.id))?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_spirit(pool: &Pool, spirit_id: &str) -> Result<Option<Spirit>> {
    let row = sqlx::query(&format!("SELECT {SPIRIT_COLUMNS} FROM spirits WHERE id = ?"))
        .bind(spirit_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(spirit_from_row))
}

/// One page of spirits in primary-key order, so consecutive pages are
/// disjoint as long as no ids are inserted below the cursor.
#[instrument(skip(pool))]
pub async fn fetch_spirit_page(pool: &Pool, offset: u32, limit: u32) -> Result<Vec<Spirit>> {
    let rows = sqlx::query(&format!(
        "SELECT {SPIRIT_COLUMNS} FROM spirits ORDER BY id ASC LIMIT ? OFFSET ?"
    ))
    .bind(i64::from(limit))
    .bind(i64::from(offset))
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(spirit_from_row).collect())
}

#[instrument(skip_all)]
pub async fn count_spirits(pool: &Pool) -> Result<u32> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM spirits")
        .fetch_one(pool)
        .await?;
    Ok(u32::try_from(count).unwrap_or(u32::MAX))
}

/// Count spirits whose `image_url` already points into the bucket.
#[instrument(skip_all)]
pub async fn count_self_hosted(pool: &Pool, bucket_base_url: &str) -> Result<u32> {
    let prefix = bucket_base_url.trim_end_matches('/');
    if prefix.is_empty() {
        return Ok(0);
    }
    // substr instead of LIKE: bucket URLs routinely contain `_`.
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM spirits WHERE image_url IS NOT NULL AND substr(image_url, 1, length(?)) = ?",
    )
    .bind(prefix)
    .bind(prefix)
    .fetch_one(pool)
    .await?;
    Ok(u32::try_from(count).unwrap_or(u32::MAX))
}

/// Record `link` as the spirit's single primary image and point the spirit
/// row at it. Returns the image id.
#[instrument(skip_all, fields(spirit_id = %link.spirit_id))]
pub async fn link_spirit_image(pool: &Pool, link: &ImageLink) -> Result<String> {
    let mut tx = pool.begin().await?;

    // First statement must write: a read-then-write transaction gets
    // SQLITE_BUSY instead of waiting for the lock.
    sqlx::query("UPDATE spirit_images SET is_primary = 0 WHERE spirit_id = ? AND url != ?")
        .bind(&link.spirit_id)
        .bind(&link.hosted_url)
        .execute(&mut *tx)
        .await
        .context("failed to demote previous primary images")?;

    let exists: Option<String> = sqlx::query_scalar("SELECT id FROM spirits WHERE id = ?")
        .bind(&link.spirit_id)
        .fetch_optional(&mut *tx)
        .await?;
    if exists.is_none() {
        return Err(anyhow!("spirit {} not found", link.spirit_id));
    }

    let image_id: String = sqlx::query(
        "INSERT INTO spirit_images \
            (id, spirit_id, url, thumbnail_url, source_url, source, attribution, width, height, is_primary) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1) \
         ON CONFLICT (spirit_id, url) DO UPDATE SET \
            thumbnail_url = excluded.thumbnail_url, \
            source_url = excluded.source_url, \
            source = excluded.source, \
            attribution = excluded.attribution, \
            width = excluded.width, \
            height = excluded.height, \
            is_primary = 1 \
         RETURNING id",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&link.spirit_id)
    .bind(&link.hosted_url)
    .bind(&link.hosted_url)
    .bind(&link.source_url)
    .bind(link.source.as_str())
    .bind(&link.attribution)
    .bind(link.width.map(i64::from))
    .bind(link.height.map(i64::from))
    .fetch_one(&mut *tx)
    .await
    .context("failed to upsert spirit image")?
    .get("id");

    // No thumbnail rendition exists; both columns carry the hosted URL.
    sqlx::query(
        "UPDATE spirits SET image_url = ?, thumbnail_url = ?, primary_image_id = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(&link.hosted_url)
    .bind(&link.hosted_url)
    .bind(&image_id)
    .bind(&link.spirit_id)
    .execute(&mut *tx)
    .await
    .context("failed to update spirit image url")?;

    tx.commit().await?;
    Ok(image_id)
}

#[instrument(skip_all)]
pub async fn list_spirit_images(pool: &Pool, spirit_id: &str) -> Result<Vec<SpiritImage>> {
    let rows = sqlx::query(
        "SELECT id, spirit_id, url, thumbnail_url, source_url, source, license, attribution, width, height, is_primary \
         FROM spirit_images WHERE spirit_id = ? ORDER BY created_at ASC, id ASC",
    )
    .bind(spirit_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let source: String = row.get("source");
            Ok(SpiritImage {
                id: row.get("id"),
                spirit_id: row.get("spirit_id"),
                url: row.get("url"),
                thumbnail_url: row.try_get("thumbnail_url").ok().flatten(),
                source_url: row.get("source_url"),
                source: ImageSource::parse_source(&source)
                    .ok_or_else(|| anyhow!("unknown image source {source}"))?,
                license: row.try_get("license").ok().flatten(),
                attribution: row.try_get("attribution").ok().flatten(),
                width: row.try_get("width").ok().flatten(),
                height: row.try_get("height").ok().flatten(),
                is_primary: row.get::<i64, _>("is_primary") != 0,
            })
        })
        .collect()
}

fn sweep_run_from_row(row: &SqliteRow) -> SweepRun {
    SweepRun {
        id: row.get("id"),
        last_offset: row.get("last_offset"),
        total_processed: row.get("total_processed"),
        total_failed: row.get("total_failed"),
        started_at: row.get("started_at"),
        completed_at: row.try_get("completed_at").ok().flatten(),
    }
}

#[instrument(skip_all)]
pub async fn start_sweep_run(pool: &Pool, start_offset: u32) -> Result<SweepRun> {
    let now = Utc::now();
    let row = sqlx::query(
        "INSERT INTO sweep_runs (id, last_offset, started_at, updated_at) VALUES (?, ?, ?, ?) \
         RETURNING id, last_offset, total_processed, total_failed, started_at, completed_at",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(i64::from(start_offset))
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(sweep_run_from_row(&row))
}

/// Most recently started run that never reached the end of the table.
#[instrument(skip_all)]
pub async fn latest_open_sweep_run(pool: &Pool) -> Result<Option<SweepRun>> {
    let row = sqlx::query(
        "SELECT id, last_offset, total_processed, total_failed, started_at, completed_at \
         FROM sweep_runs WHERE completed_at IS NULL ORDER BY started_at DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(sweep_run_from_row))
}

#[instrument(skip_all)]
pub async fn get_sweep_run(pool: &Pool, run_id: &str) -> Result<Option<SweepRun>> {
    let row = sqlx::query(
        "SELECT id, last_offset, total_processed, total_failed, started_at, completed_at \
         FROM sweep_runs WHERE id = ?",
    )
    .bind(run_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(sweep_run_from_row))
}

/// Move the checkpoint to `last_offset` and add this batch's counters.
#[instrument(skip_all)]
pub async fn record_sweep_progress(
    pool: &Pool,
    run_id: &str,
    last_offset: u32,
    processed: u32,
    failed: u32,
) -> Result<()> {
    sqlx::query(
        "UPDATE sweep_runs SET last_offset = ?, total_processed = total_processed + ?, \
         total_failed = total_failed + ?, updated_at = ? WHERE id = ?",
    )
    .bind(i64::from(last_offset))
    .bind(i64::from(processed))
    .bind(i64::from(failed))
    .bind(Utc::now())
    .bind(run_id)
    .execute(pool)
    .await
    .context("failed to persist sweep checkpoint")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn complete_sweep_run(pool: &Pool, run_id: &str) -> Result<()> {
    let now = Utc::now();
    sqlx::query("UPDATE sweep_runs SET completed_at = ?, updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(now)
        .bind(run_id)
        .execute(pool)
        .await?;
    Ok(())
}
