//! Recognition queue: capture now, classify later.
//!
//! A photo submitted while offline (or while the classification backend is
//! unreachable) is persisted to disk plus a queue row, and replayed through
//! the classification call once connectivity returns. Items are processed
//! one at a time; the classification endpoint is request-heavy and must not
//! be called concurrently.

use crate::connectivity::ConnectivityMonitor;
use crate::db::{self, Pool};
use crate::model::{CaptureMetadata, Classification, RecognitionTask};
use crate::remote::RemoteService;
use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Outcome of [`RecognitionQueue::submit`].
#[derive(Debug)]
pub enum Submission {
    /// The device was online; the result is available immediately.
    Classified(Classification),
    /// The device was offline; the capture is queued under this id.
    Queued(i64),
}

pub struct RecognitionQueue {
    pool: Pool,
    remote: Arc<dyn RemoteService>,
    images_dir: PathBuf,
    monitor: Option<Arc<ConnectivityMonitor>>,
    draining: AtomicBool,
}

impl RecognitionQueue {
    pub fn new(pool: Pool, remote: Arc<dyn RemoteService>, images_dir: PathBuf) -> Self {
        Self {
            pool,
            remote,
            images_dir,
            monitor: None,
            draining: AtomicBool::new(false),
        }
    }

    /// Attach a connectivity monitor so a capture made while offline is
    /// queued straight away, without a doomed network attempt.
    pub fn with_monitor(mut self, monitor: Arc<ConnectivityMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Classify now if online, queue otherwise. Besides the up-front check,
    /// only the offline failure class routes to the queue; a genuine
    /// classification error propagates to the caller.
    #[instrument(skip_all)]
    pub async fn submit(
        &self,
        image: &[u8],
        metadata: &CaptureMetadata,
    ) -> Result<Submission> {
        if let Some(monitor) = &self.monitor {
            if !monitor.is_online().await {
                let id = self.enqueue(image, metadata).await?;
                return Ok(Submission::Queued(id));
            }
        }
        // The monitor's view can be stale; a call that still hits a dead
        // network routes to the queue the same way.
        match self.remote.classify(image, metadata).await {
            Ok(classification) => Ok(Submission::Classified(classification)),
            Err(err) if err.is_offline() => {
                let id = self.enqueue(image, metadata).await?;
                Ok(Submission::Queued(id))
            }
            Err(err) => Err(err).context("classification failed"),
        }
    }

    /// Persist the capture and its queue row; returns immediately.
    #[instrument(skip_all)]
    pub async fn enqueue(&self, image: &[u8], metadata: &CaptureMetadata) -> Result<i64> {
        tokio::fs::create_dir_all(&self.images_dir).await?;
        let path = self.images_dir.join(format!("{}.jpg", Uuid::new_v4()));
        tokio::fs::write(&path, image)
            .await
            .with_context(|| format!("persisting capture to {}", path.display()))?;
        let id = db::enqueue_recognition(&self.pool, &path.to_string_lossy(), metadata).await?;
        info!(id, path = %path.display(), "queued capture for classification");
        Ok(id)
    }

    /// Replay pending items, oldest first, one at a time. Returns the number
    /// of items that reached a terminal state this pass.
    #[instrument(skip_all)]
    pub async fn drain(&self, max_batch: u32) -> Result<usize> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(0);
        }
        let result = self.drain_inner(max_batch).await;
        self.draining.store(false, Ordering::SeqCst);
        result
    }

    async fn drain_inner(&self, max_batch: u32) -> Result<usize> {
        let recovered = db::recover_stale_recognitions(&self.pool).await?;
        if recovered > 0 {
            warn!(recovered, "recovered captures interrupted mid-flight");
        }
        let tasks = db::pending_recognitions(&self.pool, max_batch).await?;
        let mut settled = 0;
        for task in tasks {
            db::mark_recognition_processing(&self.pool, task.id).await?;
            match self.classify_task(&task).await {
                Ok(classification) => {
                    let payload = serde_json::to_value(&classification)?;
                    db::complete_recognition(&self.pool, task.id, &payload).await?;
                    remove_image(&task.image_path).await;
                    info!(id = task.id, name = %classification.name, "capture classified");
                    settled += 1;
                }
                Err(DrainError::Offline(msg)) => {
                    // Connectivity dropped mid-drain; the item stays pending
                    // and the rest of the batch waits for the next cycle.
                    warn!(id = task.id, %msg, "went offline during drain");
                    db::requeue_recognition(&self.pool, task.id).await?;
                    break;
                }
                Err(DrainError::Terminal(msg)) => {
                    // Image bytes are retained so a manual retry can reuse them.
                    warn!(id = task.id, %msg, "classification failed");
                    db::fail_recognition(&self.pool, task.id, &msg).await?;
                    settled += 1;
                }
            }
        }
        Ok(settled)
    }

    async fn classify_task(&self, task: &RecognitionTask) -> Result<Classification, DrainError> {
        let image = tokio::fs::read(&task.image_path)
            .await
            .map_err(|e| DrainError::Terminal(format!("capture missing from disk: {e}")))?;
        self.remote
            .classify(&image, &task.metadata)
            .await
            .map_err(|e| {
                if e.is_offline() {
                    DrainError::Offline(e.to_string())
                } else {
                    DrainError::Terminal(e.to_string())
                }
            })
    }

    /// Put a terminally failed item back in rotation.
    pub async fn retry(&self, id: i64) -> Result<()> {
        db::retry_failed_recognition(&self.pool, id).await
    }

    /// Housekeeping sweep: drop terminal rows (and any leftover image bytes)
    /// older than the threshold. Safe to run anytime.
    #[instrument(skip_all)]
    pub async fn cleanup(&self, older_than_days: i64) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(older_than_days);
        let stale = db::stale_recognitions(&self.pool, cutoff).await?;
        let mut removed = 0;
        for task in stale {
            remove_image(&task.image_path).await;
            db::delete_recognition(&self.pool, task.id).await?;
            removed += 1;
        }
        if removed > 0 {
            info!(removed, "cleaned up old recognition items");
        }
        Ok(removed)
    }
}

enum DrainError {
    Offline(String),
    Terminal(String),
}

/// Idempotent delete: a file that is already gone is not an error.
async fn remove_image(path: &str) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(?err, path, "could not remove capture");
        }
    }
}
