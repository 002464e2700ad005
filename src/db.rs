use crate::model::{
    CaptureMetadata, EntityKind, Operation, PendingCounts, QueueStatus, RecognitionStatus,
    RecognitionTask, SyncTask,
};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::{sqlite::SqliteRow, Row, Sqlite, SqlitePool, Transaction};
use tracing::{instrument, warn};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = match SqlitePool::connect(&normalized).await {
        Ok(pool) => pool,
        Err(err) => {
            // Degraded mode for constrained hosts: everything keeps working,
            // but queued work does not survive a restart.
            warn!(?err, url = %normalized, "cannot open local store; falling back to in-memory");
            SqlitePool::connect("sqlite::memory:").await?
        }
    };
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous=FULL;").execute(&pool).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, ensure the parent directory exists and
/// ask SQLite to create the file. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }
    let rest = url["sqlite:".len()..].trim_start_matches("//");
    let (path_part, query_part) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }
    if let Some(parent) = std::path::Path::new(path_part).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
    let mut rebuilt = format!("sqlite://{path_part}");
    match query_part {
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Sync queue

pub async fn enqueue_sync(
    pool: &Pool,
    kind: EntityKind,
    entity_id: &str,
    op: Operation,
    payload: &serde_json::Value,
) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let id = enqueue_sync_tx(&mut tx, kind, entity_id, op, payload).await?;
    tx.commit().await?;
    Ok(id)
}

pub async fn enqueue_sync_tx(
    tx: &mut Transaction<'_, Sqlite>,
    kind: EntityKind,
    entity_id: &str,
    op: Operation,
    payload: &serde_json::Value,
) -> Result<i64> {
    let now = Utc::now();
    let rec = sqlx::query(
        "INSERT INTO sync_queue (entity_kind, entity_id, op, payload, status, retry_count, created_at, updated_at) \
         VALUES (?, ?, ?, ?, 'pending', 0, ?, ?) RETURNING id",
    )
    .bind(kind.as_str())
    .bind(entity_id)
    .bind(op.as_str())
    .bind(payload.to_string())
    .bind(now)
    .bind(now)
    .fetch_one(&mut **tx)
    .await?;
    Ok(rec.get("id"))
}

/// Pending tasks whose backoff has elapsed, oldest first. FIFO order is what
/// keeps per-entity Create/Update/Delete sequences applied causally.
#[instrument(skip_all)]
pub async fn due_sync_tasks(pool: &Pool, limit: u32) -> Result<Vec<SyncTask>> {
    let rows = sqlx::query(
        "SELECT * FROM sync_queue \
         WHERE status = 'pending' AND (next_retry_at IS NULL OR datetime(next_retry_at) <= datetime(?)) \
         ORDER BY datetime(created_at) ASC, id ASC LIMIT ?",
    )
    .bind(Utc::now())
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(sync_task_from_row).collect()
}

#[instrument(skip_all)]
pub async fn mark_task_processing(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("UPDATE sync_queue SET status = 'processing', updated_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Delete the queue row and flip the entity's `synced` flag in one
/// transaction, so a crash cannot leave a synced entity with a live task or
/// the reverse.
#[instrument(skip_all)]
pub async fn complete_task(pool: &Pool, task: &SyncTask, local_table: &str) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM sync_queue WHERE id = ?")
        .bind(task.id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(&format!("UPDATE {local_table} SET synced = 1 WHERE id = ?"))
        .bind(&task.entity_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Exponential backoff: now + 2^retry_count seconds, where retry_count is the
/// value after this failure. Returns the new retry count.
#[instrument(skip_all)]
pub async fn retry_task(pool: &Pool, id: i64, error: &str) -> Result<i32> {
    let prev: i32 = sqlx::query_scalar("SELECT retry_count FROM sync_queue WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await?;
    let count = prev + 1;
    let next_retry_at = Utc::now() + Duration::seconds(1_i64 << count.min(30));
    sqlx::query(
        "UPDATE sync_queue SET status = 'pending', retry_count = ?, error_message = ?, \
         next_retry_at = ?, updated_at = ? WHERE id = ?",
    )
    .bind(count)
    .bind(error)
    .bind(next_retry_at)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(count)
}

/// Terminal failure; the engine never picks the task up again. Surfaced via
/// [`failed_sync_tasks`] for manual retry or discard.
#[instrument(skip_all)]
pub async fn fail_task(pool: &Pool, id: i64, error: &str) -> Result<()> {
    sqlx::query(
        "UPDATE sync_queue SET status = 'failed', error_message = ?, updated_at = ? WHERE id = ?",
    )
    .bind(error)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn failed_sync_tasks(pool: &Pool) -> Result<Vec<SyncTask>> {
    let rows =
        sqlx::query("SELECT * FROM sync_queue WHERE status = 'failed' ORDER BY datetime(created_at) ASC")
            .fetch_all(pool)
            .await?;
    rows.iter().map(sync_task_from_row).collect()
}

/// Manual intervention: put a failed task back in rotation from scratch.
pub async fn retry_failed_task(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE sync_queue SET status = 'pending', retry_count = 0, error_message = NULL, \
         next_retry_at = NULL, updated_at = ? WHERE id = ? AND status = 'failed'",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn discard_failed_task(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM sync_queue WHERE id = ? AND status = 'failed'")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Sync tasks stranded in `processing` by a crash go back to `pending`.
/// The engine is single-flight, so at the start of a cycle any `processing`
/// row is necessarily stale. Retry count and backoff window are preserved.
#[instrument(skip_all)]
pub async fn recover_stale_sync_tasks(pool: &Pool) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE sync_queue SET status = 'pending', updated_at = ? WHERE status = 'processing'",
    )
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Same recovery for captures: a crash between `processing` and a terminal
/// write must not strand the image unclassified across restarts.
#[instrument(skip_all)]
pub async fn recover_stale_recognitions(pool: &Pool) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE recognition_queue SET status = 'pending', updated_at = ? WHERE status = 'processing'",
    )
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

pub async fn pending_counts(pool: &Pool) -> Result<PendingCounts> {
    let sync: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_queue WHERE status = 'pending'")
        .fetch_one(pool)
        .await?;
    let failed_sync: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sync_queue WHERE status = 'failed'")
            .fetch_one(pool)
            .await?;
    let recognition: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM recognition_queue WHERE status = 'pending'")
            .fetch_one(pool)
            .await?;
    let failed_recognition: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM recognition_queue WHERE status = 'failed'")
            .fetch_one(pool)
            .await?;
    Ok(PendingCounts {
        sync,
        recognition,
        failed_sync,
        failed_recognition,
    })
}

fn sync_task_from_row(row: &SqliteRow) -> Result<SyncTask> {
    let kind: String = row.get("entity_kind");
    let op: String = row.get("op");
    let status: String = row.get("status");
    let payload: String = row.get("payload");
    Ok(SyncTask {
        id: row.get("id"),
        entity_kind: EntityKind::parse(&kind).ok_or_else(|| anyhow!("bad entity kind: {kind}"))?,
        entity_id: row.get("entity_id"),
        op: Operation::parse(&op).ok_or_else(|| anyhow!("bad op: {op}"))?,
        payload: serde_json::from_str(&payload)?,
        status: QueueStatus::parse(&status).ok_or_else(|| anyhow!("bad status: {status}"))?,
        retry_count: row.get("retry_count"),
        error_message: row.get("error_message"),
        next_retry_at: row.get("next_retry_at"),
        created_at: row.get("created_at"),
    })
}

// ---------------------------------------------------------------------------
// Recognition queue

pub async fn enqueue_recognition(
    pool: &Pool,
    image_path: &str,
    metadata: &CaptureMetadata,
) -> Result<i64> {
    let now = Utc::now();
    let rec = sqlx::query(
        "INSERT INTO recognition_queue (image_path, metadata, status, created_at, updated_at) \
         VALUES (?, ?, 'pending', ?, ?) RETURNING id",
    )
    .bind(image_path)
    .bind(serde_json::to_string(metadata)?)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn pending_recognitions(pool: &Pool, limit: u32) -> Result<Vec<RecognitionTask>> {
    let rows = sqlx::query(
        "SELECT * FROM recognition_queue WHERE status = 'pending' \
         ORDER BY datetime(created_at) ASC, id ASC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(recognition_task_from_row).collect()
}

pub async fn find_recognition(pool: &Pool, id: i64) -> Result<Option<RecognitionTask>> {
    let row = sqlx::query("SELECT * FROM recognition_queue WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(recognition_task_from_row).transpose()
}

pub async fn mark_recognition_processing(pool: &Pool, id: i64) -> Result<()> {
    set_recognition_status(pool, id, RecognitionStatus::Processing).await
}

/// Put an item interrupted mid-flight (offline, or a crash between
/// `processing` and a terminal state) back in rotation.
pub async fn requeue_recognition(pool: &Pool, id: i64) -> Result<()> {
    set_recognition_status(pool, id, RecognitionStatus::Pending).await
}

async fn set_recognition_status(pool: &Pool, id: i64, status: RecognitionStatus) -> Result<()> {
    sqlx::query("UPDATE recognition_queue SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn complete_recognition(
    pool: &Pool,
    id: i64,
    result: &serde_json::Value,
) -> Result<()> {
    sqlx::query(
        "UPDATE recognition_queue SET status = 'completed', result_payload = ?, \
         error_message = NULL, updated_at = ? WHERE id = ?",
    )
    .bind(result.to_string())
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fail_recognition(pool: &Pool, id: i64, error: &str) -> Result<()> {
    sqlx::query(
        "UPDATE recognition_queue SET status = 'failed', error_message = ?, updated_at = ? WHERE id = ?",
    )
    .bind(error)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Manual retry of a terminally failed classification. The image bytes were
/// retained on failure, so the next drain can reuse them.
pub async fn retry_failed_recognition(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE recognition_queue SET status = 'pending', error_message = NULL, updated_at = ? \
         WHERE id = ? AND status = 'failed'",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Terminal rows older than the cutoff, for the housekeeping sweep.
pub async fn stale_recognitions(
    pool: &Pool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<RecognitionTask>> {
    let rows = sqlx::query(
        "SELECT * FROM recognition_queue \
         WHERE status IN ('completed', 'failed') AND datetime(updated_at) < datetime(?)",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;
    rows.iter().map(recognition_task_from_row).collect()
}

pub async fn delete_recognition(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM recognition_queue WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

fn recognition_task_from_row(row: &SqliteRow) -> Result<RecognitionTask> {
    let status: String = row.get("status");
    let metadata: String = row.get("metadata");
    let result_payload: Option<String> = row.get("result_payload");
    Ok(RecognitionTask {
        id: row.get("id"),
        image_path: row.get("image_path"),
        metadata: serde_json::from_str(&metadata)?,
        status: RecognitionStatus::parse(&status)
            .ok_or_else(|| anyhow!("bad recognition status: {status}"))?,
        result_payload: result_payload.as_deref().map(serde_json::from_str).transpose()?,
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
    })
}

// ---------------------------------------------------------------------------
// Sync watermark

pub async fn last_sync_at(pool: &Pool) -> Result<Option<DateTime<Utc>>> {
    let ts: Option<DateTime<Utc>> =
        sqlx::query_scalar("SELECT last_sync_at FROM sync_state WHERE id = 1")
            .fetch_one(pool)
            .await?;
    Ok(ts)
}

pub async fn set_last_sync_at(pool: &Pool, at: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE sync_state SET last_sync_at = ? WHERE id = 1")
        .bind(at)
        .execute(pool)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Entity helpers shared by the per-entity adapters

pub async fn local_updated_at(
    pool: &Pool,
    table: &str,
    id: &str,
) -> Result<Option<DateTime<Utc>>> {
    let ts: Option<DateTime<Utc>> =
        sqlx::query_scalar(&format!("SELECT updated_at FROM {table} WHERE id = ?"))
            .bind(id)
            .fetch_optional(pool)
            .await?;
    Ok(ts)
}
