//! JSON state files under the profile directory.
//!
//! Loads never fail: a missing file is empty state and a malformed one is
//! logged and treated as empty. Saves that fail are logged; the in-memory
//! value stays authoritative.

use crate::{Clock, Timestamp};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// A JSON file holding one value.
#[derive(Debug, Clone)]
pub struct JsonFile {
    path: PathBuf,
}

impl JsonFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<root>/<dir>/<name>.json`
    pub fn in_profile(root: &Path, dir: &str, name: &str) -> Self {
        Self::new(root.join(dir).join(format!("{name}.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the file. Returns `None` when the file is missing or
    /// does not hold a `T`.
    pub fn load<T: DeserializeOwned>(&self) -> Option<T> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no saved state");
                return None;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read saved state");
                return None;
            }
        };

        match serde_json::from_str(&contents) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring malformed saved state");
                None
            }
        }
    }

    /// Write `value`, creating parent directories as needed.
    pub fn save<T: Serialize>(&self, value: &T) -> crate::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec(value)?;
        // Write then rename so a crash never leaves a half-written file.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        trace!(path = %self.path.display(), "saved state");
        Ok(())
    }

    /// Save, logging instead of returning failures.
    pub fn save_or_warn<T: Serialize>(&self, value: &T) {
        if let Err(e) = self.save(value) {
            warn!(path = %self.path.display(), error = %e, "failed to save state");
        }
    }
}

/// Coalesces saves of a value into one write per window.
///
/// The window opens at the first [`schedule`](Debounced::schedule) after a
/// write and closes `delay` later. Later schedules replace the pending value
/// but never move the deadline, so a steady stream of changes still reaches
/// disk. The pending value is written by [`poll`](Debounced::poll) once the
/// window has closed, or immediately on [`flush`](Debounced::flush).
pub struct Debounced {
    file: JsonFile,
    delay: u64,
    clock: Arc<dyn Clock>,
    pending: Option<serde_json::Value>,
    deadline: Option<Timestamp>,
}

impl Debounced {
    pub fn new(file: JsonFile, delay: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            file,
            delay,
            clock,
            pending: None,
            deadline: None,
        }
    }

    pub fn file(&self) -> &JsonFile {
        &self.file
    }

    /// Queue `value` for writing, opening a window if none is open.
    pub fn schedule<T: Serialize>(&mut self, value: &T) {
        match serde_json::to_value(value) {
            Ok(value) => {
                self.pending = Some(value);
                if self.deadline.is_none() {
                    self.deadline = Some(self.clock.now() + self.delay);
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize state for saving"),
        }
    }

    /// Whether a write is queued.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Write the queued value if its window has passed.
    pub fn poll(&mut self) {
        match self.deadline {
            Some(deadline) if self.clock.now() >= deadline => self.flush(),
            _ => {}
        }
    }

    /// Write the queued value now.
    pub fn flush(&mut self) {
        self.deadline = None;
        if let Some(value) = self.pending.take() {
            self.file.save_or_warn(&value);
        }
    }
}

impl Drop for Debounced {
    fn drop(&mut self) {
        self.flush();
    }
}
