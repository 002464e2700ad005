use agroscout::connectivity::ConnectivityMonitor;
use agroscout::db;
use agroscout::engine::{EngineConfig, SyncEngine};
use agroscout::entities;
use agroscout::model::{CaptureMetadata, Classification, QueueStatus};
use agroscout::recognition::RecognitionQueue;
use agroscout::remote::{RemoteError, RemoteService};
use agroscout::store;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Insert { table: String },
    Update { table: String, id: String },
    SoftDelete { table: String, id: String },
    Query { table: String },
    Classify,
}

#[derive(Clone, Default)]
struct RecordingRemote {
    mutation_responses: Arc<Mutex<VecDeque<Result<(), RemoteError>>>>,
    remote_rows: Arc<Mutex<HashMap<String, Vec<Value>>>>,
    calls: Arc<Mutex<Vec<Call>>>,
    partitions_offline: Arc<Mutex<bool>>,
    mutation_delay: Arc<Mutex<Option<Duration>>>,
}

impl RecordingRemote {
    fn with_responses(responses: Vec<Result<(), RemoteError>>) -> Self {
        Self {
            mutation_responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    async fn set_remote_rows(&self, table: &str, rows: Vec<Value>) {
        self.remote_rows.lock().await.insert(table.to_string(), rows);
    }

    async fn set_mutation_delay(&self, delay: Duration) {
        *self.mutation_delay.lock().await = Some(delay);
    }

    async fn set_partitions_offline(&self, offline: bool) {
        *self.partitions_offline.lock().await = offline;
    }

    async fn calls(&self) -> Vec<Call> {
        self.calls.lock().await.clone()
    }

    async fn mutation_calls(&self) -> Vec<Call> {
        self.calls()
            .await
            .into_iter()
            .filter(|c| !matches!(c, Call::Query { .. } | Call::Classify))
            .collect()
    }

    async fn query_call_count(&self) -> usize {
        self.calls()
            .await
            .iter()
            .filter(|c| matches!(c, Call::Query { .. }))
            .count()
    }

    async fn pop_mutation_response(&self) -> Result<(), RemoteError> {
        let delay = *self.mutation_delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.mutation_responses
            .lock()
            .await
            .pop_front()
            .unwrap_or(Ok(()))
    }
}

#[async_trait]
impl RemoteService for RecordingRemote {
    async fn insert(&self, table: &str, _record: &Value) -> Result<(), RemoteError> {
        self.calls.lock().await.push(Call::Insert {
            table: table.to_string(),
        });
        self.pop_mutation_response().await
    }

    async fn update(&self, table: &str, id: &str, _fields: &Value) -> Result<(), RemoteError> {
        self.calls.lock().await.push(Call::Update {
            table: table.to_string(),
            id: id.to_string(),
        });
        self.pop_mutation_response().await
    }

    async fn soft_delete(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        self.calls.lock().await.push(Call::SoftDelete {
            table: table.to_string(),
            id: id.to_string(),
        });
        self.pop_mutation_response().await
    }

    async fn query_updated_since(
        &self,
        table: &str,
        _partitions: &[String],
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Value>, RemoteError> {
        self.calls.lock().await.push(Call::Query {
            table: table.to_string(),
        });
        Ok(self
            .remote_rows
            .lock()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_partitions(&self) -> Result<Vec<String>, RemoteError> {
        if *self.partitions_offline.lock().await {
            return Err(RemoteError::Offline("no route to host".into()));
        }
        Ok(vec!["farm-1".into()])
    }

    async fn classify(
        &self,
        _image: &[u8],
        _metadata: &CaptureMetadata,
    ) -> Result<Classification, RemoteError> {
        self.calls.lock().await.push(Call::Classify);
        Err(RemoteError::Offline("not used in engine tests".into()))
    }
}

fn build_engine(
    pool: &sqlx::SqlitePool,
    remote: &RecordingRemote,
    images_dir: std::path::PathBuf,
    max_retries: i32,
) -> SyncEngine {
    let remote: Arc<dyn RemoteService> = Arc::new(remote.clone());
    let recognition = Arc::new(RecognitionQueue::new(
        pool.clone(),
        remote.clone(),
        images_dir,
    ));
    SyncEngine::new(
        pool.clone(),
        remote,
        entities::registry(),
        recognition,
        EngineConfig {
            batch_size: 50,
            max_retries,
            sync_interval: Duration::from_secs(300),
        },
    )
}

async fn force_all_due(pool: &sqlx::SqlitePool) {
    sqlx::query("UPDATE sync_queue SET next_retry_at = datetime('now', '-1 seconds')")
        .execute(pool)
        .await
        .unwrap();
}

#[tokio::test]
async fn offline_create_syncs_once_connectivity_returns() {
    let pool = setup_pool().await;
    let remote = RecordingRemote::default();
    let td = tempfile::tempdir().unwrap();
    let engine = build_engine(&pool, &remote, td.path().into(), 5);

    // Captured while offline: queued locally, not synced.
    let activity = store::create_activity(&pool, "farm-1", "plot-3", "Inspect Plot 3", None)
        .await
        .unwrap();
    assert!(!activity.synced);
    assert_eq!(db::pending_counts(&pool).await.unwrap().sync, 1);

    // Device back online: one cycle drains the queue.
    assert!(engine.sync().await);

    let stored = store::find_activity(&pool, &activity.id).await.unwrap().unwrap();
    assert!(stored.synced);
    assert_eq!(db::pending_counts(&pool).await.unwrap().sync, 0);
    assert_eq!(
        remote.mutation_calls().await,
        vec![Call::Insert {
            table: "activities".into()
        }]
    );
}

#[tokio::test]
async fn create_update_delete_reach_remote_in_causal_order() {
    let pool = setup_pool().await;
    let remote = RecordingRemote::default();
    let td = tempfile::tempdir().unwrap();
    let engine = build_engine(&pool, &remote, td.path().into(), 5);

    let activity = store::create_activity(&pool, "f", "p", "v1", None).await.unwrap();
    store::update_activity(&pool, &activity.id, "v2", None).await.unwrap();
    store::delete_activity(&pool, &activity.id).await.unwrap();

    engine.sync().await;

    assert_eq!(
        remote.mutation_calls().await,
        vec![
            Call::Insert {
                table: "activities".into()
            },
            Call::Update {
                table: "activities".into(),
                id: activity.id.clone()
            },
            Call::SoftDelete {
                table: "activities".into(),
                id: activity.id.clone()
            },
        ]
    );
    assert_eq!(db::pending_counts(&pool).await.unwrap().sync, 0);
}

#[tokio::test]
async fn transient_failures_hit_the_retry_ceiling_then_stop() {
    let pool = setup_pool().await;
    let remote = RecordingRemote::with_responses(
        (0..10)
            .map(|_| Err(RemoteError::Offline("network down".into())))
            .collect(),
    );
    let td = tempfile::tempdir().unwrap();
    let engine = build_engine(&pool, &remote, td.path().into(), 5);

    store::create_activity(&pool, "f", "p", "doomed", None).await.unwrap();

    // Five cycles, forcing the backoff window shut between each.
    for _ in 0..5 {
        engine.sync().await;
        force_all_due(&pool).await;
    }
    assert_eq!(remote.mutation_calls().await.len(), 5);

    let failed = db::failed_sync_tasks(&pool).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].status, QueueStatus::Failed);

    // A sixth cycle makes no further call for the failed item.
    engine.sync().await;
    assert_eq!(remote.mutation_calls().await.len(), 5);
}

#[tokio::test]
async fn validation_errors_fail_immediately_without_retries() {
    let pool = setup_pool().await;
    let remote = RecordingRemote::with_responses(vec![Err(RemoteError::Status {
        code: 422,
        body: "confidence out of range".into(),
    })]);
    let td = tempfile::tempdir().unwrap();
    let engine = build_engine(&pool, &remote, td.path().into(), 5);

    store::create_activity(&pool, "f", "p", "invalid", None).await.unwrap();
    engine.sync().await;
    force_all_due(&pool).await;
    engine.sync().await;

    assert_eq!(remote.mutation_calls().await.len(), 1);
    let failed = db::failed_sync_tasks(&pool).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("confidence out of range"));
}

#[tokio::test]
async fn backoff_schedule_grows_with_each_failure() {
    let pool = setup_pool().await;
    let remote = RecordingRemote::with_responses(
        (0..3)
            .map(|_| Err(RemoteError::Offline("down".into())))
            .collect(),
    );
    let td = tempfile::tempdir().unwrap();
    let engine = build_engine(&pool, &remote, td.path().into(), 5);

    store::create_activity(&pool, "f", "p", "slow", None).await.unwrap();

    let mut schedule: Vec<DateTime<Utc>> = Vec::new();
    for _ in 0..3 {
        engine.sync().await;
        let next: DateTime<Utc> =
            sqlx::query_scalar("SELECT next_retry_at FROM sync_queue LIMIT 1")
                .fetch_one(&pool)
                .await
                .unwrap();
        schedule.push(next);
        force_all_due(&pool).await;
    }
    assert!(schedule[0] < schedule[1]);
    assert!(schedule[1] < schedule[2]);
    // 2^3 = 8 seconds after the third failure.
    assert!(schedule[2] - Utc::now() > ChronoDuration::seconds(6));
}

#[tokio::test]
async fn concurrent_sync_runs_exactly_one_pass() {
    let pool = setup_pool().await;
    let remote = RecordingRemote::default();
    remote.set_mutation_delay(Duration::from_millis(100)).await;
    let td = tempfile::tempdir().unwrap();
    let engine = Arc::new(build_engine(&pool, &remote, td.path().into(), 5));

    store::create_activity(&pool, "f", "p", "once", None).await.unwrap();

    let a = engine.clone();
    let b = engine.clone();
    let (ran_a, ran_b) = tokio::join!(
        tokio::spawn(async move { a.sync().await }),
        tokio::spawn(async move { b.sync().await }),
    );
    let results = [ran_a.unwrap(), ran_b.unwrap()];
    assert!(results.contains(&true));
    assert!(results.contains(&false), "second caller must bounce off");
    assert_eq!(remote.mutation_calls().await.len(), 1);
}

#[tokio::test]
async fn download_applies_only_strictly_newer_remote_rows() {
    let pool = setup_pool().await;
    let remote = RecordingRemote::default();
    let td = tempfile::tempdir().unwrap();
    let engine = build_engine(&pool, &remote, td.path().into(), 5);

    let activity = store::create_activity(&pool, "farm-1", "p", "local title", None)
        .await
        .unwrap();
    // Upload the pending create first so the queue is quiet.
    engine.sync().await;

    // Remote copy older than local: must not clobber (ties also favor local).
    let older = activity.updated_at - ChronoDuration::seconds(60);
    remote
        .set_remote_rows(
            "activities",
            vec![json!({
                "id": activity.id,
                "farm_id": "farm-1",
                "plot_id": "p",
                "title": "stale remote title",
                "notes": null,
                "created_at": activity.created_at,
                "updated_at": older,
                "deleted_at": null,
            })],
        )
        .await;
    engine.sync().await;
    let stored = store::find_activity(&pool, &activity.id).await.unwrap().unwrap();
    assert_eq!(stored.title, "local title");

    // Strictly newer remote copy wins.
    let newer = Utc::now() + ChronoDuration::seconds(60);
    remote
        .set_remote_rows(
            "activities",
            vec![json!({
                "id": activity.id,
                "farm_id": "farm-1",
                "plot_id": "p",
                "title": "fresh remote title",
                "notes": "edited on the dashboard",
                "created_at": activity.created_at,
                "updated_at": newer,
                "deleted_at": null,
            })],
        )
        .await;
    engine.sync().await;
    let stored = store::find_activity(&pool, &activity.id).await.unwrap().unwrap();
    assert_eq!(stored.title, "fresh remote title");
    assert!(stored.synced, "rows applied from remote count as synced");
}

#[tokio::test]
async fn unseen_remote_rows_are_inserted_as_synced() {
    let pool = setup_pool().await;
    let remote = RecordingRemote::default();
    let td = tempfile::tempdir().unwrap();
    let engine = build_engine(&pool, &remote, td.path().into(), 5);

    let now = Utc::now();
    remote
        .set_remote_rows(
            "scout_points",
            vec![json!({
                "id": "sp-remote-1",
                "farm_id": "farm-1",
                "plot_id": "plot-9",
                "latitude": 51.98,
                "longitude": 5.66,
                "notes": null,
                "created_at": now,
                "updated_at": now,
                "deleted_at": null,
            })],
        )
        .await;
    engine.sync().await;

    let stored = store::find_scout_point(&pool, "sp-remote-1").await.unwrap().unwrap();
    assert_eq!(stored.plot_id, "plot-9");
    assert!(stored.synced);
}

#[tokio::test]
async fn restart_retries_tasks_interrupted_mid_flight() {
    let pool = setup_pool().await;
    let remote = RecordingRemote::default();
    let td = tempfile::tempdir().unwrap();

    let activity = store::create_activity(&pool, "f", "p", "interrupted", None)
        .await
        .unwrap();
    // Simulate a crash between claiming the task and the terminal write:
    // the row is stuck in 'processing' and no longer due.
    let task_id = db::due_sync_tasks(&pool, 50).await.unwrap()[0].id;
    db::mark_task_processing(&pool, task_id).await.unwrap();
    assert!(db::due_sync_tasks(&pool, 50).await.unwrap().is_empty());

    // A fresh engine over the same database picks the task back up.
    let engine = build_engine(&pool, &remote, td.path().into(), 5);
    engine.sync().await;

    assert_eq!(
        remote.mutation_calls().await,
        vec![Call::Insert {
            table: "activities".into()
        }]
    );
    let stored = store::find_activity(&pool, &activity.id).await.unwrap().unwrap();
    assert!(stored.synced);
    assert_eq!(db::pending_counts(&pool).await.unwrap().sync, 0);
}

/// Minimal HTTP endpoint so the connectivity probe genuinely succeeds.
async fn spawn_probe_server() -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 204 No Content\r\ncontent-length: 0\r\n\r\n")
                    .await;
            });
        }
    });
    format!("http://{addr}/")
}

#[tokio::test]
async fn app_start_runs_a_single_cycle_until_a_real_transition() {
    let pool = setup_pool().await;
    let remote = RecordingRemote::default();
    let td = tempfile::tempdir().unwrap();
    let engine = Arc::new(build_engine(&pool, &remote, td.path().into(), 5));

    let probe_url = spawn_probe_server().await;
    let monitor = Arc::new(ConnectivityMonitor::new(
        reqwest::Url::parse(&probe_url).unwrap(),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(engine.clone().run(monitor.clone(), shutdown_rx));

    // The app-start probe flips the channel offline-to-online; that must
    // count as one cycle (one download query per entity table), not two.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(remote.query_call_count().await, 3);

    // A later offline-to-online transition triggers exactly one more.
    monitor.report(false).await;
    monitor.report(true).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(remote.query_call_count().await, 6);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn cycle_failure_leaves_engine_idle_and_watermark_unset() {
    let pool = setup_pool().await;
    let remote = RecordingRemote::default();
    remote.set_partitions_offline(true).await;
    let td = tempfile::tempdir().unwrap();
    let engine = build_engine(&pool, &remote, td.path().into(), 5);

    engine.sync().await;
    assert!(db::last_sync_at(&pool).await.unwrap().is_none());

    // The failure did not wedge the single-flight flag.
    remote.set_partitions_offline(false).await;
    assert!(engine.sync().await);
    assert!(db::last_sync_at(&pool).await.unwrap().is_some());
}
