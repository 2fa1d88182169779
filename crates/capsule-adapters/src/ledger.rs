//! Telemetry sinks: structured tracing output and an append-only JSONL ledger.
//!
//! `emit` never blocks. The ledger hands events to a background writer over a bounded
//! channel and counts what it has to drop when the writer falls behind.

use capsule_core::{TelemetryEvent, TelemetrySink};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const DEFAULT_LEDGER_CAPACITY: usize = 1_024;

/// Logs each event at info level under `capsule::adapters::telemetry`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn emit(&self, event: TelemetryEvent) {
        let fields = serde_json::Value::Object(event.fields);
        tracing::info!(
            target: "capsule::adapters::telemetry",
            event = %event.name,
            capsule_id = %event.capsule_id,
            timestamp_ms = event.timestamp_ms,
            fields = %fields,
            "Telemetry"
        );
    }
}

pub struct LedgerTelemetry {
    tx: mpsc::Sender<TelemetryEvent>,
    dropped: AtomicU64,
}

impl LedgerTelemetry {
    /// Open (or create) `path` for appending and spawn the writer. The writer finishes
    /// once every handle to the sink has been dropped and the queue is flushed.
    pub async fn open(path: impl AsRef<Path>, capacity: usize) -> std::io::Result<(Self, JoinHandle<()>)> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(write_ledger(file, rx));
        tracing::info!(target: "capsule::adapters::telemetry", path = %path.display(), "Telemetry ledger opened");
        Ok((
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            handle,
        ))
    }

    /// Events discarded because the queue was full or the writer had stopped.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl TelemetrySink for LedgerTelemetry {
    fn emit(&self, event: TelemetryEvent) {
        if self.tx.try_send(event).is_err() {
            let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if n.is_power_of_two() {
                tracing::warn!(target: "capsule::adapters::telemetry", dropped = n, "Telemetry ledger is dropping events");
            }
        }
    }
}

async fn write_ledger(mut file: tokio::fs::File, mut rx: mpsc::Receiver<TelemetryEvent>) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }
        let mut buf = Vec::new();
        for event in &batch {
            match serde_json::to_vec(event) {
                Ok(line) => {
                    buf.extend_from_slice(&line);
                    buf.push(b'\n');
                }
                Err(e) => tracing::warn!(target: "capsule::adapters::telemetry", error = %e, "Unserializable event"),
            }
        }
        if let Err(e) = file.write_all(&buf).await {
            tracing::error!(target: "capsule::adapters::telemetry", error = %e, "Ledger write failed; writer stopping");
            return;
        }
        if let Err(e) = file.flush().await {
            tracing::warn!(target: "capsule::adapters::telemetry", error = %e, "Ledger flush failed");
        }
    }
    let _ = file.sync_all().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracing_sink_accepts_events() {
        TracingTelemetry.emit(TelemetryEvent::new("capsule.completed", "c-1").with("ok", true));
    }

    #[tokio::test]
    async fn full_queue_counts_drops() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, handle) = LedgerTelemetry::open(dir.path().join("ledger.jsonl"), 1).await.unwrap();
        for i in 0..64 {
            sink.emit(TelemetryEvent::new("capsule.selected", &format!("c-{}", i)));
        }
        let dropped = sink.dropped();
        drop(sink);
        handle.await.unwrap();
        let written = std::fs::read_to_string(dir.path().join("ledger.jsonl")).unwrap();
        assert_eq!(written.lines().count() as u64 + dropped, 64);
    }
}
