use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use super::{AuditLogger, AuditRecord, store};
use crate::config::AuditConfig;
use crate::metrics::Metrics;
use crate::store::pool::Db;

/// Handle over the background workers. Kept by main for graceful shutdown;
/// dropping it without calling [`AuditWriter::shutdown`] leaves the workers
/// running until the process exits.
pub struct AuditWriter {
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<()>,
    shutdown_timeout: Duration,
}

/// Start the audit pipeline: a bounded channel and `worker_count` consumers
/// sharing one receiver. Each worker batches up to `batch_size` entries or
/// `flush_period`, whichever comes first, and writes the batch in a single
/// transaction.
pub fn spawn(db: Db, cfg: &AuditConfig, metrics: Arc<Metrics>) -> (AuditLogger, AuditWriter) {
    let (tx, rx) = mpsc::channel(cfg.channel_buffer.max(1));
    let rx = Arc::new(Mutex::new(rx));
    let (shutdown_tx, shutdown_rx) = watch::channel(());

    let mut handles = Vec::with_capacity(cfg.worker_count);
    for worker_id in 0..cfg.worker_count {
        handles.push(tokio::spawn(worker(
            worker_id,
            db.clone(),
            Arc::clone(&rx),
            cfg.batch_size.max(1),
            Duration::from_secs(cfg.flush_period_secs.max(1)),
            shutdown_rx.clone(),
            Arc::clone(&metrics),
        )));
    }

    let logger = AuditLogger::new(tx, Duration::from_millis(cfg.offer_timeout_ms), metrics);
    let writer = AuditWriter {
        handles,
        shutdown_tx,
        shutdown_timeout: Duration::from_secs(cfg.shutdown_timeout_secs),
    };
    (logger, writer)
}

impl AuditWriter {
    /// Signal the workers, then wait up to the shutdown timeout for them to
    /// drain residual entries. Workers still running after that are aborted
    /// and their in-flight entries are lost (logged).
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());

        let deadline = tokio::time::sleep(self.shutdown_timeout);
        tokio::pin!(deadline);

        let mut handles = self.handles;
        for handle in &mut handles {
            tokio::select! {
                _ = handle => {}
                () = &mut deadline => {
                    tracing::warn!("audit shutdown timeout; aborting remaining workers");
                    break;
                }
            }
        }
        for handle in &handles {
            handle.abort();
        }
    }
}

async fn worker(
    worker_id: usize,
    db: Db,
    rx: Arc<Mutex<mpsc::Receiver<AuditRecord>>>,
    batch_size: usize,
    flush_period: Duration,
    mut shutdown: watch::Receiver<()>,
    metrics: Arc<Metrics>,
) {
    let mut batch: Vec<AuditRecord> = Vec::with_capacity(batch_size);

    'outer: loop {
        let flush_deadline = tokio::time::sleep(flush_period);
        tokio::pin!(flush_deadline);

        // Fill the local batch until full, the flush timer fires, or shutdown.
        loop {
            tokio::select! {
                record = recv_shared(&rx) => match record {
                    Some(record) => {
                        batch.push(record);
                        if batch.len() >= batch_size {
                            break;
                        }
                    }
                    // All senders dropped.
                    None => {
                        flush(&db, &mut batch, &metrics).await;
                        break 'outer;
                    }
                },
                _ = &mut flush_deadline => break,
                _ = shutdown.changed() => {
                    drain_residual(&rx, &mut batch).await;
                    flush(&db, &mut batch, &metrics).await;
                    break 'outer;
                }
            }
        }

        flush(&db, &mut batch, &metrics).await;
    }

    tracing::debug!(worker_id, "audit worker stopped");
}

async fn recv_shared(rx: &Arc<Mutex<mpsc::Receiver<AuditRecord>>>) -> Option<AuditRecord> {
    rx.lock().await.recv().await
}

/// Pull everything already queued without waiting for new entries.
async fn drain_residual(rx: &Arc<Mutex<mpsc::Receiver<AuditRecord>>>, batch: &mut Vec<AuditRecord>) {
    let mut rx = rx.lock().await;
    while let Ok(record) = rx.try_recv() {
        batch.push(record);
    }
}

async fn flush(db: &Db, batch: &mut Vec<AuditRecord>, metrics: &Metrics) {
    if batch.is_empty() {
        return;
    }
    match store::write_batch(db, batch).await {
        Ok(written) => {
            metrics.audit_written_total.inc_by(written);
        }
        Err(e) => {
            tracing::error!(error = %e, count = batch.len(), "audit batch write failed");
        }
    }
    batch.clear();
}
