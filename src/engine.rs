//! Sync engine: drains the sync queue to the backend, pulls remote deltas
//! into the local store, and drives the recognition queue, all under a
//! single-flight guarantee.

use crate::connectivity::ConnectivityMonitor;
use crate::db::{self, Pool};
use crate::entities::EntitySync;
use crate::model::{Operation, SyncTask};
use crate::recognition::RecognitionQueue;
use crate::remote::{RemoteError, RemoteService};
use anyhow::Result;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub batch_size: u32,
    pub max_retries: i32,
    pub sync_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_retries: 5,
            sync_interval: Duration::from_secs(300),
        }
    }
}

pub struct SyncEngine {
    pool: Pool,
    remote: Arc<dyn RemoteService>,
    adapters: Vec<Arc<dyn EntitySync>>,
    recognition: Arc<RecognitionQueue>,
    cfg: EngineConfig,
    is_syncing: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        pool: Pool,
        remote: Arc<dyn RemoteService>,
        adapters: Vec<Arc<dyn EntitySync>>,
        recognition: Arc<RecognitionQueue>,
        cfg: EngineConfig,
    ) -> Self {
        Self {
            pool,
            remote,
            adapters,
            recognition,
            cfg,
            is_syncing: AtomicBool::new(false),
        }
    }

    /// One full sync cycle: upload, download, recognition drain. Single
    /// flight: if a cycle is already running this returns `false`
    /// immediately; the caller re-triggers via the timer or the next
    /// connectivity event. Phase failures are logged, never propagated; the
    /// engine always comes back to idle.
    #[instrument(skip_all)]
    pub async fn sync(&self) -> bool {
        if self
            .is_syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let started = Utc::now();
        let mut cycle_ok = true;

        if let Err(err) = self.process_queue().await {
            error!(?err, "upload phase failed");
            cycle_ok = false;
        }
        if let Err(err) = self.download_remote_data().await {
            error!(?err, "download phase failed");
            cycle_ok = false;
        }
        if let Err(err) = self.recognition.drain(self.cfg.batch_size).await {
            error!(?err, "recognition drain failed");
            cycle_ok = false;
        }

        if cycle_ok {
            if let Err(err) = db::set_last_sync_at(&self.pool, started).await {
                warn!(?err, "could not persist sync watermark");
            }
        }

        self.is_syncing.store(false, Ordering::SeqCst);
        true
    }

    /// Upload phase: push pending mutations oldest-first, sequentially, so
    /// Create/Update/Delete on the same entity reach the backend in order.
    /// Per-item failures are recorded on the item and never abort the batch.
    async fn process_queue(&self) -> Result<()> {
        let recovered = db::recover_stale_sync_tasks(&self.pool).await?;
        if recovered > 0 {
            warn!(recovered, "recovered sync tasks interrupted mid-flight");
        }
        let tasks = db::due_sync_tasks(&self.pool, self.cfg.batch_size).await?;
        if tasks.is_empty() {
            return Ok(());
        }
        info!(count = tasks.len(), "processing sync queue");
        for task in tasks {
            db::mark_task_processing(&self.pool, task.id).await?;
            let adapter = self.adapter_for(&task);
            let table = adapter.remote_table();
            let result = match task.op {
                Operation::Create => self.remote.insert(table, &task.payload).await,
                Operation::Update => {
                    self.remote.update(table, &task.entity_id, &task.payload).await
                }
                Operation::Delete => self.remote.soft_delete(table, &task.entity_id).await,
            };
            match result {
                Ok(()) => {
                    db::complete_task(&self.pool, &task, adapter.local_table()).await?;
                    info!(id = task.id, entity = %task.entity_id, op = task.op.as_str(), "task synced");
                }
                Err(err) => self.handle_task_failure(&task, err).await?,
            }
        }
        Ok(())
    }

    /// Permanent failures (validation-class 4xx) go terminal immediately;
    /// transient ones back off exponentially until the retry ceiling.
    async fn handle_task_failure(&self, task: &SyncTask, err: RemoteError) -> Result<()> {
        let message = err.to_string();
        if err.is_permanent() {
            warn!(id = task.id, %message, "permanent failure; not retrying");
            db::fail_task(&self.pool, task.id, &message).await?;
        } else if task.retry_count + 1 >= self.cfg.max_retries {
            warn!(id = task.id, %message, "retry ceiling reached; needs attention");
            db::fail_task(&self.pool, task.id, &message).await?;
        } else {
            let count = db::retry_task(&self.pool, task.id, &message).await?;
            warn!(id = task.id, retry_count = count, %message, "task failed; backing off");
        }
        Ok(())
    }

    /// Download phase: for every registered entity type, pull rows updated in
    /// the user's partitions since the last watermark and reconcile them by
    /// last-write-wins. Per-row failures are logged and skipped.
    async fn download_remote_data(&self) -> Result<()> {
        let partitions = self.remote.list_partitions().await?;
        if partitions.is_empty() {
            return Ok(());
        }
        let since = db::last_sync_at(&self.pool).await?;
        for adapter in &self.adapters {
            let rows = self
                .remote
                .query_updated_since(adapter.remote_table(), &partitions, since)
                .await?;
            let mut applied = 0usize;
            for row in &rows {
                match adapter.apply_remote(&self.pool, row).await {
                    Ok(true) => applied += 1,
                    Ok(false) => {} // local copy is as new or newer
                    Err(err) => {
                        warn!(?err, table = adapter.remote_table(), "skipping bad remote row")
                    }
                }
            }
            if !rows.is_empty() {
                info!(
                    table = adapter.remote_table(),
                    fetched = rows.len(),
                    applied,
                    "downloaded remote records"
                );
            }
        }
        Ok(())
    }

    fn adapter_for(&self, task: &SyncTask) -> Arc<dyn EntitySync> {
        self.adapters
            .iter()
            .find(|a| a.kind() == task.entity_kind)
            .cloned()
            .unwrap_or_else(|| crate::entities::adapter_for(task.entity_kind))
    }

    /// Scheduling loop: a periodic tick while online, plus an immediate cycle
    /// whenever connectivity comes back, plus one app-start pass. Runs until
    /// the shutdown signal flips.
    pub async fn run(
        self: Arc<Self>,
        monitor: Arc<ConnectivityMonitor>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut online_rx = monitor.subscribe();
        let mut ticker = tokio::time::interval(self.cfg.sync_interval);
        // The first tick completes immediately; fold it into the app-start check.
        ticker.tick().await;
        if monitor.is_online().await {
            self.sync().await;
        }
        // The app-start probe may have flipped the watch channel; mark it
        // seen so the select arm below only fires on later transitions.
        let _ = online_rx.borrow_and_update();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if monitor.is_online().await {
                        self.sync().await;
                    }
                }
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *online_rx.borrow_and_update() {
                        info!("connectivity restored; syncing");
                        self.sync().await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("sync engine stopping");
                        break;
                    }
                }
            }
        }
    }
}
