//! Per-entity sync adapters.
//!
//! Each domain entity registers its remote table name and both mapping
//! directions here, so the engine iterates a registry instead of matching on
//! entity kinds, and a field missed in a mapping is a compile error rather
//! than a silent drop.

use crate::db::{self, Pool};
use crate::model::{Activity, EntityKind, Pest, ScoutPoint};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

#[async_trait]
pub trait EntitySync: Send + Sync {
    fn kind(&self) -> EntityKind;

    /// Local SQLite table.
    fn local_table(&self) -> &'static str;

    /// Remote table/collection name.
    fn remote_table(&self) -> &'static str;

    /// Reconcile one remote row into the local store. Last-write-wins: the
    /// remote row is applied only if its `updated_at` is strictly newer than
    /// the local one; ties favor local so an in-flight edit is not clobbered.
    /// Returns true if the row was applied.
    async fn apply_remote(&self, pool: &Pool, row: &Value) -> Result<bool>;
}

/// All syncable entity types, in the order the download phase visits them.
pub fn registry() -> Vec<Arc<dyn EntitySync>> {
    vec![
        Arc::new(ActivitySync),
        Arc::new(ScoutPointSync),
        Arc::new(PestSync),
    ]
}

pub fn adapter_for(kind: EntityKind) -> Arc<dyn EntitySync> {
    match kind {
        EntityKind::Activity => Arc::new(ActivitySync),
        EntityKind::ScoutPoint => Arc::new(ScoutPointSync),
        EntityKind::Pest => Arc::new(PestSync),
    }
}

// ---------------------------------------------------------------------------
// Activity

pub struct ActivitySync;

pub fn activity_to_remote(a: &Activity) -> Value {
    json!({
        "id": a.id,
        "farm_id": a.farm_id,
        "plot_id": a.plot_id,
        "title": a.title,
        "notes": a.notes,
        "created_at": a.created_at,
        "updated_at": a.updated_at,
        "deleted_at": a.deleted_at,
    })
}

pub fn activity_from_remote(row: &Value) -> Result<Activity> {
    Ok(Activity {
        id: str_field(row, "id")?,
        farm_id: str_field(row, "farm_id")?,
        plot_id: str_field(row, "plot_id")?,
        title: str_field(row, "title")?,
        notes: opt_str_field(row, "notes"),
        synced: true,
        created_at: time_field(row, "created_at")?,
        updated_at: time_field(row, "updated_at")?,
        deleted_at: opt_time_field(row, "deleted_at")?,
    })
}

#[async_trait]
impl EntitySync for ActivitySync {
    fn kind(&self) -> EntityKind {
        EntityKind::Activity
    }

    fn local_table(&self) -> &'static str {
        "activities"
    }

    fn remote_table(&self) -> &'static str {
        "activities"
    }

    async fn apply_remote(&self, pool: &Pool, row: &Value) -> Result<bool> {
        let remote = activity_from_remote(row)?;
        if !remote_wins(pool, self.local_table(), &remote.id, remote.updated_at).await? {
            return Ok(false);
        }
        sqlx::query(
            "INSERT OR REPLACE INTO activities \
             (id, farm_id, plot_id, title, notes, synced, created_at, updated_at, deleted_at) \
             VALUES (?, ?, ?, ?, ?, 1, ?, ?, ?)",
        )
        .bind(&remote.id)
        .bind(&remote.farm_id)
        .bind(&remote.plot_id)
        .bind(&remote.title)
        .bind(&remote.notes)
        .bind(remote.created_at)
        .bind(remote.updated_at)
        .bind(remote.deleted_at)
        .execute(pool)
        .await?;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Scout point

pub struct ScoutPointSync;

pub fn scout_point_to_remote(sp: &ScoutPoint) -> Value {
    json!({
        "id": sp.id,
        "farm_id": sp.farm_id,
        "plot_id": sp.plot_id,
        "latitude": sp.latitude,
        "longitude": sp.longitude,
        "notes": sp.notes,
        "created_at": sp.created_at,
        "updated_at": sp.updated_at,
        "deleted_at": sp.deleted_at,
    })
}

pub fn scout_point_from_remote(row: &Value) -> Result<ScoutPoint> {
    Ok(ScoutPoint {
        id: str_field(row, "id")?,
        farm_id: str_field(row, "farm_id")?,
        plot_id: str_field(row, "plot_id")?,
        latitude: num_field(row, "latitude")?,
        longitude: num_field(row, "longitude")?,
        notes: opt_str_field(row, "notes"),
        synced: true,
        created_at: time_field(row, "created_at")?,
        updated_at: time_field(row, "updated_at")?,
        deleted_at: opt_time_field(row, "deleted_at")?,
    })
}

#[async_trait]
impl EntitySync for ScoutPointSync {
    fn kind(&self) -> EntityKind {
        EntityKind::ScoutPoint
    }

    fn local_table(&self) -> &'static str {
        "scout_points"
    }

    fn remote_table(&self) -> &'static str {
        "scout_points"
    }

    async fn apply_remote(&self, pool: &Pool, row: &Value) -> Result<bool> {
        let remote = scout_point_from_remote(row)?;
        if !remote_wins(pool, self.local_table(), &remote.id, remote.updated_at).await? {
            return Ok(false);
        }
        sqlx::query(
            "INSERT OR REPLACE INTO scout_points \
             (id, farm_id, plot_id, latitude, longitude, notes, synced, created_at, updated_at, deleted_at) \
             VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?, ?)",
        )
        .bind(&remote.id)
        .bind(&remote.farm_id)
        .bind(&remote.plot_id)
        .bind(remote.latitude)
        .bind(remote.longitude)
        .bind(&remote.notes)
        .bind(remote.created_at)
        .bind(remote.updated_at)
        .bind(remote.deleted_at)
        .execute(pool)
        .await?;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Pest

pub struct PestSync;

pub fn pest_to_remote(p: &Pest) -> Value {
    json!({
        "id": p.id,
        "farm_id": p.farm_id,
        "plot_id": p.plot_id,
        "scout_point_id": p.scout_point_id,
        "name": p.name,
        "confidence": p.confidence,
        "severity": p.severity,
        "recommendation": p.recommendation,
        "image_url": p.image_url,
        "created_at": p.created_at,
        "updated_at": p.updated_at,
        "deleted_at": p.deleted_at,
    })
}

pub fn pest_from_remote(row: &Value) -> Result<Pest> {
    Ok(Pest {
        id: str_field(row, "id")?,
        farm_id: str_field(row, "farm_id")?,
        plot_id: str_field(row, "plot_id")?,
        scout_point_id: opt_str_field(row, "scout_point_id"),
        name: str_field(row, "name")?,
        confidence: num_field(row, "confidence")?,
        severity: str_field(row, "severity")?,
        recommendation: opt_str_field(row, "recommendation"),
        image_url: opt_str_field(row, "image_url"),
        synced: true,
        created_at: time_field(row, "created_at")?,
        updated_at: time_field(row, "updated_at")?,
        deleted_at: opt_time_field(row, "deleted_at")?,
    })
}

#[async_trait]
impl EntitySync for PestSync {
    fn kind(&self) -> EntityKind {
        EntityKind::Pest
    }

    fn local_table(&self) -> &'static str {
        "pests"
    }

    fn remote_table(&self) -> &'static str {
        "pests"
    }

    async fn apply_remote(&self, pool: &Pool, row: &Value) -> Result<bool> {
        let remote = pest_from_remote(row)?;
        if !remote_wins(pool, self.local_table(), &remote.id, remote.updated_at).await? {
            return Ok(false);
        }
        sqlx::query(
            "INSERT OR REPLACE INTO pests \
             (id, farm_id, plot_id, scout_point_id, name, confidence, severity, recommendation, \
              image_url, synced, created_at, updated_at, deleted_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?)",
        )
        .bind(&remote.id)
        .bind(&remote.farm_id)
        .bind(&remote.plot_id)
        .bind(&remote.scout_point_id)
        .bind(&remote.name)
        .bind(remote.confidence)
        .bind(&remote.severity)
        .bind(&remote.recommendation)
        .bind(&remote.image_url)
        .bind(remote.created_at)
        .bind(remote.updated_at)
        .bind(remote.deleted_at)
        .execute(pool)
        .await?;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------

async fn remote_wins(
    pool: &Pool,
    table: &str,
    id: &str,
    remote_updated_at: chrono::DateTime<chrono::Utc>,
) -> Result<bool> {
    match db::local_updated_at(pool, table, id).await? {
        Some(local) => Ok(remote_updated_at > local),
        None => Ok(true),
    }
}

fn str_field(row: &Value, key: &str) -> Result<String> {
    row.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .with_context(|| format!("missing string field `{key}`"))
}

fn opt_str_field(row: &Value, key: &str) -> Option<String> {
    row.get(key).and_then(Value::as_str).map(str::to_string)
}

fn num_field(row: &Value, key: &str) -> Result<f64> {
    row.get(key)
        .and_then(Value::as_f64)
        .with_context(|| format!("missing numeric field `{key}`"))
}

fn time_field(row: &Value, key: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    let raw = row
        .get(key)
        .and_then(Value::as_str)
        .with_context(|| format!("missing timestamp field `{key}`"))?;
    Ok(chrono::DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("bad timestamp in `{key}`: {raw}"))?
        .with_timezone(&chrono::Utc))
}

fn opt_time_field(row: &Value, key: &str) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
    match row.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => time_field(row, key).map(Some),
    }
}
