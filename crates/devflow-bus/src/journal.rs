//! NDJSON event journal.
//!
//! The journal is the canonical feed for external subscribers: one JSON
//! event per line, append-only, written by a plain sync subscriber so it
//! rides the bus's worker pool.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use devflow_types::Event;
use tracing::error;

use crate::bus::{BusError, EventBus};

impl EventBus {
    /// Attach the persistence sink: every event is appended to `path` as a
    /// newline-delimited JSON record. Returns the subscription id so the
    /// sink can be detached like any other subscriber.
    pub fn attach_journal(&self, path: impl AsRef<Path>) -> Result<String, BusError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let writer: Arc<Mutex<File>> = Arc::new(Mutex::new(file));

        let id = self.subscribe_sync(None, move |event| {
            let line = match serde_json::to_string(event) {
                Ok(line) => line,
                Err(e) => {
                    error!(error = %e, "failed to serialize event for journal");
                    return;
                }
            };
            let mut file = writer.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = writeln!(file, "{line}") {
                error!(error = %e, "failed to append event to journal");
            }
        });
        Ok(id)
    }
}

/// Read a journal back into memory, in write order.
///
/// Blank lines are skipped; a malformed line is an error because the journal
/// is append-only and nothing should ever rewrite it.
pub fn read_journal(path: impl AsRef<Path>) -> Result<Vec<Event>, BusError> {
    let file = File::open(path.as_ref())?;
    let mut events = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event = serde_json::from_str(&line).map_err(|e| {
            BusError::Journal(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        events.push(event);
    }
    Ok(events)
}
