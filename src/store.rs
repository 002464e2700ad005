//! Domain write hooks.
//!
//! All local mutations go through these functions: each one writes the entity
//! row and enqueues the matching sync task in a single transaction, so the
//! queue can never miss a mutation or reference one that was rolled back.

use crate::db::{self, Pool};
use crate::entities::{activity_to_remote, pest_to_remote, scout_point_to_remote};
use crate::model::{Activity, Classification, EntityKind, Operation, Pest, ScoutPoint};
use anyhow::{anyhow, Result};
use chrono::Utc;
use serde_json::json;
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;

#[instrument(skip_all)]
pub async fn create_activity(
    pool: &Pool,
    farm_id: &str,
    plot_id: &str,
    title: &str,
    notes: Option<&str>,
) -> Result<Activity> {
    let now = Utc::now();
    let activity = Activity {
        id: Uuid::new_v4().to_string(),
        farm_id: farm_id.to_string(),
        plot_id: plot_id.to_string(),
        title: title.to_string(),
        notes: notes.map(str::to_string),
        synced: false,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };

    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO activities (id, farm_id, plot_id, title, notes, synced, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, 0, ?, ?)",
    )
    .bind(&activity.id)
    .bind(&activity.farm_id)
    .bind(&activity.plot_id)
    .bind(&activity.title)
    .bind(&activity.notes)
    .bind(activity.created_at)
    .bind(activity.updated_at)
    .execute(&mut *tx)
    .await?;
    db::enqueue_sync_tx(
        &mut tx,
        EntityKind::Activity,
        &activity.id,
        Operation::Create,
        &activity_to_remote(&activity),
    )
    .await?;
    tx.commit().await?;
    Ok(activity)
}

#[instrument(skip_all)]
pub async fn update_activity(
    pool: &Pool,
    id: &str,
    title: &str,
    notes: Option<&str>,
) -> Result<Activity> {
    let mut activity = find_activity(pool, id)
        .await?
        .ok_or_else(|| anyhow!("no such activity: {id}"))?;
    activity.title = title.to_string();
    activity.notes = notes.map(str::to_string);
    activity.updated_at = Utc::now();
    activity.synced = false;

    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE activities SET title = ?, notes = ?, synced = 0, updated_at = ? WHERE id = ?")
        .bind(&activity.title)
        .bind(&activity.notes)
        .bind(activity.updated_at)
        .bind(id)
        .execute(&mut *tx)
        .await?;
    db::enqueue_sync_tx(
        &mut tx,
        EntityKind::Activity,
        id,
        Operation::Update,
        &activity_to_remote(&activity),
    )
    .await?;
    tx.commit().await?;
    Ok(activity)
}

#[instrument(skip_all)]
pub async fn delete_activity(pool: &Pool, id: &str) -> Result<()> {
    soft_delete(pool, EntityKind::Activity, "activities", id).await
}

#[instrument(skip_all)]
pub async fn create_scout_point(
    pool: &Pool,
    farm_id: &str,
    plot_id: &str,
    latitude: f64,
    longitude: f64,
    notes: Option<&str>,
) -> Result<ScoutPoint> {
    let now = Utc::now();
    let point = ScoutPoint {
        id: Uuid::new_v4().to_string(),
        farm_id: farm_id.to_string(),
        plot_id: plot_id.to_string(),
        latitude,
        longitude,
        notes: notes.map(str::to_string),
        synced: false,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };

    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO scout_points (id, farm_id, plot_id, latitude, longitude, notes, synced, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?)",
    )
    .bind(&point.id)
    .bind(&point.farm_id)
    .bind(&point.plot_id)
    .bind(point.latitude)
    .bind(point.longitude)
    .bind(&point.notes)
    .bind(point.created_at)
    .bind(point.updated_at)
    .execute(&mut *tx)
    .await?;
    db::enqueue_sync_tx(
        &mut tx,
        EntityKind::ScoutPoint,
        &point.id,
        Operation::Create,
        &scout_point_to_remote(&point),
    )
    .await?;
    tx.commit().await?;
    Ok(point)
}

#[instrument(skip_all)]
pub async fn update_scout_point_notes(pool: &Pool, id: &str, notes: Option<&str>) -> Result<ScoutPoint> {
    let mut point = find_scout_point(pool, id)
        .await?
        .ok_or_else(|| anyhow!("no such scout point: {id}"))?;
    point.notes = notes.map(str::to_string);
    point.updated_at = Utc::now();
    point.synced = false;

    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE scout_points SET notes = ?, synced = 0, updated_at = ? WHERE id = ?")
        .bind(&point.notes)
        .bind(point.updated_at)
        .bind(id)
        .execute(&mut *tx)
        .await?;
    db::enqueue_sync_tx(
        &mut tx,
        EntityKind::ScoutPoint,
        id,
        Operation::Update,
        &scout_point_to_remote(&point),
    )
    .await?;
    tx.commit().await?;
    Ok(point)
}

#[instrument(skip_all)]
pub async fn delete_scout_point(pool: &Pool, id: &str) -> Result<()> {
    soft_delete(pool, EntityKind::ScoutPoint, "scout_points", id).await
}

/// Create a pest record from a completed classification. This is the caller's
/// side of the recognition contract: the queue stores the raw result, and the
/// UI layer turns accepted results into domain records through this hook.
#[instrument(skip_all)]
pub async fn create_pest_from_classification(
    pool: &Pool,
    farm_id: &str,
    plot_id: &str,
    scout_point_id: Option<&str>,
    classification: &Classification,
) -> Result<Pest> {
    let now = Utc::now();
    let pest = Pest {
        id: Uuid::new_v4().to_string(),
        farm_id: farm_id.to_string(),
        plot_id: plot_id.to_string(),
        scout_point_id: scout_point_id.map(str::to_string),
        name: classification.name.clone(),
        confidence: classification.confidence,
        severity: classification.severity.clone(),
        recommendation: classification.recommendation.clone(),
        image_url: classification.image_url.clone(),
        synced: false,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };

    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO pests (id, farm_id, plot_id, scout_point_id, name, confidence, severity, \
         recommendation, image_url, synced, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
    )
    .bind(&pest.id)
    .bind(&pest.farm_id)
    .bind(&pest.plot_id)
    .bind(&pest.scout_point_id)
    .bind(&pest.name)
    .bind(pest.confidence)
    .bind(&pest.severity)
    .bind(&pest.recommendation)
    .bind(&pest.image_url)
    .bind(pest.created_at)
    .bind(pest.updated_at)
    .execute(&mut *tx)
    .await?;
    db::enqueue_sync_tx(
        &mut tx,
        EntityKind::Pest,
        &pest.id,
        Operation::Create,
        &pest_to_remote(&pest),
    )
    .await?;
    tx.commit().await?;
    Ok(pest)
}

#[instrument(skip_all)]
pub async fn delete_pest(pool: &Pool, id: &str) -> Result<()> {
    soft_delete(pool, EntityKind::Pest, "pests", id).await
}

async fn soft_delete(pool: &Pool, kind: EntityKind, table: &str, id: &str) -> Result<()> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;
    let updated = sqlx::query(&format!(
        "UPDATE {table} SET deleted_at = ?, synced = 0, updated_at = ? WHERE id = ? AND deleted_at IS NULL"
    ))
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(&mut *tx)
    .await?;
    if updated.rows_affected() == 0 {
        return Err(anyhow!("no such {}: {id}", kind.as_str()));
    }
    db::enqueue_sync_tx(&mut tx, kind, id, Operation::Delete, &json!({ "id": id })).await?;
    tx.commit().await?;
    Ok(())
}

pub async fn find_activity(pool: &Pool, id: &str) -> Result<Option<Activity>> {
    let row = sqlx::query("SELECT * FROM activities WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| Activity {
        id: r.get("id"),
        farm_id: r.get("farm_id"),
        plot_id: r.get("plot_id"),
        title: r.get("title"),
        notes: r.get("notes"),
        synced: r.get("synced"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
        deleted_at: r.get("deleted_at"),
    }))
}

pub async fn find_scout_point(pool: &Pool, id: &str) -> Result<Option<ScoutPoint>> {
    let row = sqlx::query("SELECT * FROM scout_points WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| ScoutPoint {
        id: r.get("id"),
        farm_id: r.get("farm_id"),
        plot_id: r.get("plot_id"),
        latitude: r.get("latitude"),
        longitude: r.get("longitude"),
        notes: r.get("notes"),
        synced: r.get("synced"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
        deleted_at: r.get("deleted_at"),
    }))
}

pub async fn find_pest(pool: &Pool, id: &str) -> Result<Option<Pest>> {
    let row = sqlx::query("SELECT * FROM pests WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| Pest {
        id: r.get("id"),
        farm_id: r.get("farm_id"),
        plot_id: r.get("plot_id"),
        scout_point_id: r.get("scout_point_id"),
        name: r.get("name"),
        confidence: r.get("confidence"),
        severity: r.get("severity"),
        recommendation: r.get("recommendation"),
        image_url: r.get("image_url"),
        synced: r.get("synced"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
        deleted_at: r.get("deleted_at"),
    }))
}
