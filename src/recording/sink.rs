use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use super::storage::RecordingStorage;
use crate::metrics::Metrics;

/// Flush and cap thresholds. Defaults mirror the recording config; tests
/// shrink them.
#[derive(Debug, Clone)]
pub struct SinkLimits {
    pub flush_bytes: usize,
    pub flush_interval: Duration,
    pub max_bytes: u64,
    pub max_duration: Duration,
}

impl Default for SinkLimits {
    fn default() -> Self {
        Self {
            flush_bytes: 100 * 1024 * 1024,
            flush_interval: Duration::from_secs(600),
            max_bytes: 500 * 1024 * 1024,
            max_duration: Duration::from_secs(2 * 3600),
        }
    }
}

struct SinkState {
    buf: Vec<u8>,
    bytes_flushed: u64,
    last_flush: Instant,
    stopped: bool,
}

/// Per-session Asciinema v2 writer: one JSON header line, then one JSON array
/// per I/O event, timed in seconds since start with microsecond precision.
/// Frames are buffered in memory and flushed to storage off the hot path.
pub struct AsciinemaRecorder {
    rel_path: String,
    storage: Arc<dyn RecordingStorage>,
    metrics: Arc<Metrics>,
    limits: SinkLimits,
    started: Instant,
    state: Mutex<SinkState>,
}

#[derive(Debug, Clone, Copy)]
pub struct RecordingSummary {
    pub duration_seconds: i64,
    pub file_size_bytes: i64,
}

impl AsciinemaRecorder {
    pub fn new(
        rel_path: String,
        storage: Arc<dyn RecordingStorage>,
        metrics: Arc<Metrics>,
        limits: SinkLimits,
        width: u32,
        height: u32,
        shell: &str,
    ) -> Self {
        let header = serde_json::json!({
            "version": 2,
            "width": width,
            "height": height,
            "timestamp": chrono::Utc::now().timestamp(),
            "env": { "SHELL": shell, "TERM": "xterm-256color" },
        });
        let mut buf = header.to_string().into_bytes();
        buf.push(b'\n');

        Self {
            rel_path,
            storage,
            metrics,
            limits,
            started: Instant::now(),
            state: Mutex::new(SinkState {
                buf,
                bytes_flushed: 0,
                last_flush: Instant::now(),
                stopped: false,
            }),
        }
    }

    pub fn rel_path(&self) -> &str {
        &self.rel_path
    }

    pub async fn record_output(&self, data: &[u8]) -> anyhow::Result<()> {
        self.record_frame("o", data).await
    }

    pub async fn record_input(&self, data: &[u8]) -> anyhow::Result<()> {
        self.record_frame("i", data).await
    }

    /// True once a size or duration cap stopped the recording; the terminal
    /// itself stays attached, later frames are silently dropped.
    pub async fn is_stopped(&self) -> bool {
        self.state.lock().await.stopped
    }

    async fn record_frame(&self, kind: &str, data: &[u8]) -> anyhow::Result<()> {
        let elapsed = self.started.elapsed();
        let mut state = self.state.lock().await;
        if state.stopped {
            return Ok(());
        }

        if elapsed > self.limits.max_duration {
            state.stopped = true;
            let flushed = self.flush_locked(&mut state).await?;
            tracing::info!(rel_path = %self.rel_path, "recording duration cap reached");
            let _ = flushed;
            return Ok(());
        }

        let t = elapsed.as_secs_f64();
        let frame = serde_json::json!([t, kind, String::from_utf8_lossy(data)]);
        let line = frame.to_string();
        state.buf.extend_from_slice(line.as_bytes());
        state.buf.push(b'\n');

        let total = state.bytes_flushed + state.buf.len() as u64;
        if total >= self.limits.max_bytes {
            state.stopped = true;
            self.flush_locked(&mut state).await?;
            tracing::warn!(rel_path = %self.rel_path, "recording size cap reached");
            return Ok(());
        }

        if state.buf.len() >= self.limits.flush_bytes
            || state.last_flush.elapsed() >= self.limits.flush_interval
        {
            self.flush_locked(&mut state).await?;
        }
        Ok(())
    }

    async fn flush_locked(&self, state: &mut SinkState) -> anyhow::Result<u64> {
        if state.buf.is_empty() {
            return Ok(0);
        }
        let chunk = std::mem::take(&mut state.buf);
        let len = chunk.len() as u64;
        self.storage.append(&self.rel_path, &chunk).await?;
        state.bytes_flushed += len;
        state.last_flush = Instant::now();
        self.metrics.recording_bytes_total.inc_by(len);
        Ok(len)
    }

    /// Flush the remainder and promote the file; called exactly once at
    /// session close (or cap stop). Idempotent on the storage side.
    pub async fn finalize(&self) -> anyhow::Result<RecordingSummary> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state).await?;
        state.stopped = true;
        let size = self.storage.finalize(&self.rel_path).await?;
        Ok(RecordingSummary {
            duration_seconds: i64::try_from(self.started.elapsed().as_secs()).unwrap_or(i64::MAX),
            file_size_bytes: i64::try_from(size).unwrap_or(i64::MAX),
        })
    }
}

/// Parse a cast file back into its header and frames. Used by tests and by
/// the playback validation path.
pub fn parse_cast(bytes: &[u8]) -> anyhow::Result<(serde_json::Value, Vec<(f64, String, String)>)> {
    let text = std::str::from_utf8(bytes)?;
    let mut lines = text.lines();
    let header: serde_json::Value = serde_json::from_str(
        lines.next().ok_or_else(|| anyhow::anyhow!("empty cast file"))?,
    )?;

    let mut frames = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let frame: (f64, String, String) = serde_json::from_str(line)?;
        frames.push(frame);
    }
    Ok((header, frames))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::storage::ObjectStorage;

    fn recorder(limits: SinkLimits) -> AsciinemaRecorder {
        let storage = Arc::new(ObjectStorage::memory().unwrap());
        let metrics = Arc::new(Metrics::new().unwrap());
        AsciinemaRecorder::new(
            "2026-08-01/test.cast".into(),
            storage,
            metrics,
            limits,
            120,
            40,
            "/bin/bash",
        )
    }

    #[tokio::test]
    async fn write_then_parse_roundtrip() {
        let rec = recorder(SinkLimits::default());
        rec.record_output(b"hello\n").await.unwrap();
        rec.record_input(b"ls -la\n").await.unwrap();
        rec.record_output(b"total 0\n").await.unwrap();
        let summary = rec.finalize().await.unwrap();
        assert!(summary.file_size_bytes > 0);

        let bytes = rec.storage.read("2026-08-01/test.cast").await.unwrap();
        let (header, frames) = parse_cast(&bytes).unwrap();

        assert_eq!(header["version"], 2);
        assert_eq!(header["width"], 120);
        assert_eq!(header["height"], 40);
        assert_eq!(header["env"]["TERM"], "xterm-256color");
        assert_eq!(header["env"]["SHELL"], "/bin/bash");

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].1, "o");
        assert_eq!(frames[0].2, "hello\n");
        assert_eq!(frames[1].1, "i");
        assert_eq!(frames[1].2, "ls -la\n");
        // Frame times never go backwards
        assert!(frames[0].0 <= frames[1].0 && frames[1].0 <= frames[2].0);
    }

    #[tokio::test]
    async fn size_cap_stops_recording() {
        let limits = SinkLimits {
            max_bytes: 256,
            ..SinkLimits::default()
        };
        let rec = recorder(limits);
        for _ in 0..10 {
            rec.record_output(&[b'x'; 64]).await.unwrap();
        }
        assert!(rec.is_stopped().await);

        // Further frames are dropped without error
        rec.record_output(b"after the cap").await.unwrap();
        let summary = rec.finalize().await.unwrap();
        assert!(summary.file_size_bytes <= 512);

        let bytes = rec.storage.read("2026-08-01/test.cast").await.unwrap();
        let (_, frames) = parse_cast(&bytes).unwrap();
        assert!(frames.iter().all(|f| f.2 != "after the cap"));
    }

    #[tokio::test]
    async fn small_flush_threshold_appends_incrementally() {
        let limits = SinkLimits {
            flush_bytes: 1,
            ..SinkLimits::default()
        };
        let rec = recorder(limits);
        rec.record_output(b"one").await.unwrap();
        rec.record_output(b"two").await.unwrap();
        let summary = rec.finalize().await.unwrap();
        assert!(summary.file_size_bytes > 0);

        let bytes = rec.storage.read("2026-08-01/test.cast").await.unwrap();
        let (_, frames) = parse_cast(&bytes).unwrap();
        assert_eq!(frames.len(), 2);
    }

    #[tokio::test]
    async fn finalize_empty_session_still_has_header() {
        let rec = recorder(SinkLimits::default());
        let summary = rec.finalize().await.unwrap();
        assert!(summary.file_size_bytes > 0);

        let bytes = rec.storage.read("2026-08-01/test.cast").await.unwrap();
        let (header, frames) = parse_cast(&bytes).unwrap();
        assert_eq!(header["version"], 2);
        assert!(frames.is_empty());
    }
}
