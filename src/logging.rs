//! JSONL sink for client telemetry posted to `/api/event_logging/batch`.
//!
//! Diagnostic logging goes through `tracing`; this file only keeps the events
//! clients hand us, one JSON object per line, rotated to `<path>.bak` once the
//! file outgrows its size limit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::config::EventLogConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEntry {
    pub timestamp: DateTime<Utc>,
    pub event: serde_json::Value,
}

impl EventEntry {
    pub fn new(event: serde_json::Value) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}

/// Split a posted batch into individual events. Arrays are flattened, objects
/// are logged as-is, any other JSON value is wrapped as `{"raw_data": v}`.
pub fn batch_events(value: serde_json::Value) -> Vec<serde_json::Value> {
    match value {
        serde_json::Value::Array(items) => items,
        obj @ serde_json::Value::Object(_) => vec![obj],
        scalar => vec![serde_json::json!({ "raw_data": scalar })],
    }
}

pub struct EventLog {
    path: PathBuf,
    max_bytes: u64,
    writer: BufWriter<File>,
    written: u64,
}

impl EventLog {
    pub fn open(path: impl AsRef<Path>, max_bytes: u64) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();

        Ok(Self {
            path,
            max_bytes,
            writer: BufWriter::new(file),
            written,
        })
    }

    pub fn from_config(config: &EventLogConfig) -> std::io::Result<Self> {
        Self::open(&config.path, config.max_size_mb.saturating_mul(1024 * 1024))
    }

    pub fn append(&mut self, events: &[serde_json::Value]) -> std::io::Result<usize> {
        for event in events {
            let line = serde_json::to_string(&EventEntry::new(event.clone()))?;
            writeln!(self.writer, "{line}")?;
            self.written += line.len() as u64 + 1;
        }
        self.writer.flush()?;

        if self.max_bytes > 0 && self.written > self.max_bytes {
            self.rotate()?;
        }
        Ok(events.len())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        let mut backup = self.path.clone().into_os_string();
        backup.push(".bak");
        std::fs::rename(&self.path, &backup)?;

        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.written = 0;
        tracing::info!(path = %self.path.display(), "Rotated event log");
        Ok(())
    }
}

#[derive(Clone)]
pub struct SharedEventLog(Arc<Mutex<EventLog>>);

impl SharedEventLog {
    pub fn new(log: EventLog) -> Self {
        Self(Arc::new(Mutex::new(log)))
    }

    pub fn open(config: &EventLogConfig) -> std::io::Result<Self> {
        Ok(Self::new(EventLog::from_config(config)?))
    }

    pub fn append(&self, events: &[serde_json::Value]) -> std::io::Result<usize> {
        let mut log = self
            .0
            .lock()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "event log lock poisoned"))?;
        log.append(events)
    }

    /// [`append`](Self::append) on the blocking pool, for use from async handlers.
    pub async fn append_blocking(&self, events: Vec<serde_json::Value>) -> std::io::Result<usize> {
        let log = self.clone();
        tokio::task::spawn_blocking(move || log.append(&events))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn read_lines(path: &Path) -> Vec<EventEntry> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_batch_events_shapes() {
        assert_eq!(batch_events(json!([{"a": 1}, {"b": 2}])).len(), 2);
        assert_eq!(batch_events(json!({"a": 1})), vec![json!({"a": 1})]);
        assert_eq!(batch_events(json!(42)), vec![json!({"raw_data": 42})]);
        assert!(batch_events(json!([])).is_empty());
    }

    #[test]
    fn test_append_writes_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("events.log");
        let log = SharedEventLog::new(EventLog::open(&path, 1024 * 1024).unwrap());

        assert_eq!(log.append(&[json!({"name": "start"}), json!({"name": "stop"})]).unwrap(), 2);

        let entries = read_lines(&path);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].event, json!({"name": "stop"}));
    }

    #[tokio::test]
    async fn test_append_blocking_from_async_context() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let log = SharedEventLog::new(EventLog::open(&path, 1024 * 1024).unwrap());

        let writers: Vec<_> = (0..4)
            .map(|i| {
                let log = log.clone();
                tokio::spawn(async move { log.append_blocking(vec![json!({"writer": i})]).await })
            })
            .collect();
        for w in writers {
            assert_eq!(w.await.unwrap().unwrap(), 1);
        }

        assert_eq!(read_lines(&path).len(), 4);
    }

    #[test]
    fn test_rotates_past_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let mut log = EventLog::open(&path, 64).unwrap();

        log.append(&[json!({"payload": "x".repeat(80)})]).unwrap();
        assert!(dir.path().join("events.log.bak").exists());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);

        log.append(&[json!({"small": true})]).unwrap();
        assert_eq!(read_lines(log.path()).len(), 1);
    }

    #[test]
    fn test_existing_file_size_counts_toward_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        std::fs::write(&path, "x".repeat(100)).unwrap();

        let mut log = EventLog::open(&path, 128).unwrap();
        log.append(&[json!({"k": "v"})]).unwrap();
        assert!(dir.path().join("events.log.bak").exists());
    }
}
