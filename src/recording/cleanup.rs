use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sqlx::Row;
use tokio::sync::{RwLock, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::storage::RecordingStorage;
use crate::config::{RecordingConfig, parse_cron};
use crate::metrics::Metrics;
use crate::store::now_ms;
use crate::store::pool::Db;

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupStatus {
    pub last_run_at: Option<i64>,
    /// `idle`, `running`, `ok`, or `error`.
    pub status: String,
    pub invalid_cleaned: u64,
    pub expired_cleaned: u64,
    pub orphan_cleaned: u64,
    pub missing_cleaned: u64,
    pub total_space_freed: u64,
    pub error_message: Option<String>,
}

/// Shared handle: manual trigger plus the last-run status snapshot.
pub struct CleanupHandle {
    status: RwLock<CleanupStatus>,
    trigger_tx: mpsc::Sender<String>,
}

impl CleanupHandle {
    pub async fn status(&self) -> CleanupStatus {
        self.status.read().await.clone()
    }

    /// Queue a manual run; returns the task id (202 semantics — the run is
    /// asynchronous). Fails only when a run is already queued.
    pub fn trigger(&self) -> anyhow::Result<String> {
        let task_id = Uuid::new_v4().to_string();
        self.trigger_tx
            .try_send(task_id.clone())
            .map_err(|_| anyhow::anyhow!("cleanup already queued"))?;
        Ok(task_id)
    }
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub invalid: u64,
    pub expired: u64,
    pub orphan: u64,
    pub missing: u64,
    pub bytes_freed: u64,
}

/// Start the cron-driven retention sweeper. Runs on the configured schedule
/// (UTC), and on manual trigger, until the token is cancelled.
pub fn spawn(
    db: Db,
    storage: Arc<dyn RecordingStorage>,
    cfg: RecordingConfig,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) -> anyhow::Result<Arc<CleanupHandle>> {
    let schedule = parse_cron(&cfg.cleanup_schedule)?;
    let (trigger_tx, mut trigger_rx) = mpsc::channel::<String>(1);

    let handle = Arc::new(CleanupHandle {
        status: RwLock::new(CleanupStatus {
            status: "idle".into(),
            ..CleanupStatus::default()
        }),
        trigger_tx,
    });

    let loop_handle = Arc::clone(&handle);
    tokio::spawn(async move {
        loop {
            let next_tick = schedule
                .upcoming(chrono::Utc)
                .next()
                .map(|when| (when - chrono::Utc::now()).to_std().unwrap_or(Duration::ZERO));
            let sleep = next_tick.unwrap_or(Duration::from_secs(3600));

            tokio::select! {
                () = cancel.cancelled() => break,
                _ = tokio::time::sleep(sleep) => {
                    run_and_record(&db, &storage, &cfg, &metrics, &loop_handle).await;
                }
                Some(task_id) = trigger_rx.recv() => {
                    tracing::info!(%task_id, "manual cleanup triggered");
                    run_and_record(&db, &storage, &cfg, &metrics, &loop_handle).await;
                }
            }
        }
        tracing::info!("cleanup scheduler stopped");
    });

    Ok(handle)
}

async fn run_and_record(
    db: &Db,
    storage: &Arc<dyn RecordingStorage>,
    cfg: &RecordingConfig,
    metrics: &Metrics,
    handle: &CleanupHandle,
) {
    {
        let mut status = handle.status.write().await;
        status.status = "running".into();
    }

    let result = run_sweeps(db, storage, cfg, metrics).await;

    let mut status = handle.status.write().await;
    status.last_run_at = Some(now_ms());
    match result {
        Ok(report) => {
            status.status = "ok".into();
            status.invalid_cleaned = report.invalid;
            status.expired_cleaned = report.expired;
            status.orphan_cleaned = report.orphan;
            status.missing_cleaned = report.missing;
            status.total_space_freed = report.bytes_freed;
            status.error_message = None;
        }
        Err(e) => {
            tracing::error!(error = %e, "cleanup run failed");
            status.status = "error".into();
            status.error_message = Some(e.to_string());
        }
    }
}

/// One full retention pass: invalid, expired, orphan, then missing-file
/// sweeps, in that order. Each step is an atomic set operation, so re-running
/// on a clean state changes nothing.
pub async fn run_sweeps(
    db: &Db,
    storage: &Arc<dyn RecordingStorage>,
    cfg: &RecordingConfig,
    metrics: &Metrics,
) -> anyhow::Result<SweepReport> {
    let mut report = SweepReport::default();

    // 1. Invalid: finished recordings that captured nothing.
    let invalid = sqlx::query(&db.sql(
        "SELECT id, storage_path FROM terminal_recordings
         WHERE ended_at IS NOT NULL AND (file_size_bytes = 0 OR duration_seconds = 0)",
    ))
    .fetch_all(&db.pool)
    .await?;
    let (count, freed) = remove_batch(db, storage, cfg, &rows_to_targets(&invalid)?).await?;
    report.invalid = count;
    report.bytes_freed += freed;
    metrics.cleanup_invalid_total.inc_by(count);

    // 2. Expired: past the retention window, oldest first, bounded per run.
    let cutoff = now_ms() - cfg.retention_days * 24 * 3600 * 1000;
    let mut expired_total = 0u64;
    while i64::try_from(expired_total).unwrap_or(i64::MAX) < cfg.cleanup_max_per_run {
        let remaining = cfg.cleanup_max_per_run - i64::try_from(expired_total).unwrap_or(0);
        let batch = sqlx::query(&db.sql(
            "SELECT id, storage_path FROM terminal_recordings
             WHERE ended_at IS NOT NULL AND ended_at < $1
             ORDER BY ended_at ASC LIMIT $2",
        ))
        .bind(cutoff)
        .bind(cfg.cleanup_batch_size.min(remaining))
        .fetch_all(&db.pool)
        .await?;
        if batch.is_empty() {
            break;
        }
        let (count, freed) = remove_batch(db, storage, cfg, &rows_to_targets(&batch)?).await?;
        expired_total += count;
        report.bytes_freed += freed;
        if count == 0 {
            break;
        }
    }
    report.expired = expired_total;
    metrics.cleanup_expired_total.inc_by(expired_total);

    // 3. Orphans: cast files with no matching row.
    let mut orphans = Vec::new();
    for rel_path in storage.list_cast_files().await? {
        let Some(id) = rel_path
            .rsplit('/')
            .next()
            .and_then(|name| name.strip_suffix(".cast"))
        else {
            continue;
        };
        let known: Option<i64> = sqlx::query_scalar(&db.sql(
            "SELECT 1 FROM terminal_recordings WHERE id = $1",
        ))
        .bind(id)
        .fetch_optional(&db.pool)
        .await?;
        if known.is_none() {
            orphans.push(rel_path);
        }
    }
    report.orphan = orphans.len() as u64;
    report.bytes_freed += delete_files(storage, cfg, orphans).await;
    metrics.cleanup_orphan_total.inc_by(report.orphan);

    // 4. Missing files: rows whose cast is gone.
    let rows = sqlx::query(&db.sql("SELECT id, storage_path FROM terminal_recordings WHERE ended_at IS NOT NULL"))
        .fetch_all(&db.pool)
        .await?;
    let mut missing_ids = Vec::new();
    for (id, path) in rows_to_targets(&rows)? {
        if !storage.exists(&path).await.unwrap_or(true) {
            missing_ids.push(id);
        }
    }
    report.missing = missing_ids.len() as u64;
    delete_rows(db, &missing_ids).await?;
    metrics.cleanup_missing_total.inc_by(report.missing);

    metrics.cleanup_bytes_freed_total.inc_by(report.bytes_freed);
    tracing::info!(
        invalid = report.invalid,
        expired = report.expired,
        orphan = report.orphan,
        missing = report.missing,
        bytes_freed = report.bytes_freed,
        "cleanup sweep finished"
    );
    Ok(report)
}

fn rows_to_targets(rows: &[sqlx::any::AnyRow]) -> anyhow::Result<Vec<(String, String)>> {
    rows.iter()
        .map(|row| {
            Ok((
                row.try_get::<String, _>("id")?,
                row.try_get::<String, _>("storage_path")?,
            ))
        })
        .collect()
}

/// Delete the files through the worker pool, then the rows in one batched
/// statement. Returns `(rows_deleted, bytes_freed)`.
async fn remove_batch(
    db: &Db,
    storage: &Arc<dyn RecordingStorage>,
    cfg: &RecordingConfig,
    targets: &[(String, String)],
) -> anyhow::Result<(u64, u64)> {
    if targets.is_empty() {
        return Ok((0, 0));
    }
    let paths: Vec<String> = targets.iter().map(|(_, p)| p.clone()).collect();
    let freed = delete_files(storage, cfg, paths).await;

    let ids: Vec<String> = targets.iter().map(|(id, _)| id.clone()).collect();
    delete_rows(db, &ids).await?;
    Ok((ids.len() as u64, freed))
}

async fn delete_rows(db: &Db, ids: &[String]) -> anyhow::Result<()> {
    for chunk in ids.chunks(500) {
        let placeholders: Vec<String> = (1..=chunk.len()).map(|i| format!("${i}")).collect();
        let sql = db
            .sql(&format!(
                "DELETE FROM terminal_recordings WHERE id IN ({})",
                placeholders.join(", ")
            ))
            .into_owned();
        let mut query = sqlx::query(&sql);
        for id in chunk {
            query = query.bind(id.clone());
        }
        query.execute(&db.pool).await?;
    }
    Ok(())
}

/// Parallel file deletion through a bounded worker pool. Individual failures
/// are logged; the sweep carries on.
async fn delete_files(
    storage: &Arc<dyn RecordingStorage>,
    cfg: &RecordingConfig,
    paths: Vec<String>,
) -> u64 {
    let semaphore = Arc::new(Semaphore::new(cfg.cleanup_workers.max(1)));
    let mut set: JoinSet<u64> = JoinSet::new();

    for path in paths {
        let storage = Arc::clone(storage);
        let semaphore = Arc::clone(&semaphore);
        set.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return 0;
            };
            match storage.delete(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(error = %e, %path, "cast delete failed");
                    0
                }
            }
        });
    }

    let mut freed = 0u64;
    while let Some(joined) = set.join_next().await {
        if let Ok(bytes) = joined {
            freed += bytes;
        }
    }
    freed
}
