//! Historical alarm store.
//!
//! Appends every cleared alarm instance to a JSONL file. Alarm listeners run
//! on the poll task, so entries are handed to a dedicated writer thread and
//! the file I/O never blocks polling. Write failures are logged by that
//! thread; evaluation carries on.

use chrono::{DateTime, Utc};
use line_core::{AlarmError, AlarmEvent, AlarmEventKind, AlarmInstance, AlarmListener};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use tracing::warn;

/// One line of the history file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmHistoryEntry {
    pub recorded_at: DateTime<Utc>,
    /// Seconds between raise and clear.
    pub duration_s: f64,
    pub instance: AlarmInstance,
}

/// JSONL writer for completed alarms, backed by its own thread.
pub struct AlarmHistory {
    tx: Mutex<Option<Sender<AlarmHistoryEntry>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AlarmHistory {
    /// Open `path` in append mode, creating parent directories.
    pub fn new(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let writer = BufWriter::with_capacity(8192, file);
        let (tx, rx) = mpsc::channel();
        let path = path.to_path_buf();
        let worker = thread::Builder::new()
            .name("alarm-history".to_string())
            .spawn(move || write_entries(writer, rx, path))?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue `instance` for the history file.
    pub fn record(&self, instance: &AlarmInstance) -> io::Result<()> {
        let recorded_at = Utc::now();
        let cleared = instance.cleared_at.unwrap_or(recorded_at);
        let entry = AlarmHistoryEntry {
            recorded_at,
            duration_s: (cleared - instance.raised_at).num_milliseconds() as f64 / 1000.0,
            instance: instance.clone(),
        };
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            return Err(writer_stopped());
        };
        tx.send(entry).map_err(|_| writer_stopped())
    }

    /// Stop accepting entries and wait until the queued ones are on disk.
    pub fn close(&self) {
        drop(self.tx.lock().take());
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("Alarm history writer panicked");
            }
        }
    }
}

impl Drop for AlarmHistory {
    fn drop(&mut self) {
        self.close();
    }
}

fn writer_stopped() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "alarm history writer stopped")
}

fn write_entries(mut writer: BufWriter<File>, rx: Receiver<AlarmHistoryEntry>, path: PathBuf) {
    for entry in rx {
        let written = serde_json::to_writer(&mut writer, &entry)
            .map_err(io::Error::from)
            .and_then(|()| writer.write_all(b"\n"))
            .and_then(|()| writer.flush());
        if let Err(err) = written {
            warn!(
                path = %path.display(),
                alarm_no = entry.instance.alarm_no,
                error = %err,
                "Failed to append alarm history"
            );
        }
    }
}

impl AlarmListener for AlarmHistory {
    fn name(&self) -> &'static str {
        "alarm-history"
    }

    fn on_alarm_event(&self, event: &AlarmEvent) -> Result<(), AlarmError> {
        if event.kind != AlarmEventKind::Cleared {
            return Ok(());
        }
        self.record(&event.instance)
            .map_err(|e| AlarmError::Listener {
                listener: self.name(),
                reason: e.to_string(),
            })
    }
}
