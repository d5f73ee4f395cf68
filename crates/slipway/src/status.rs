//! Status sink: append-only build status events plus a materialized current
//! state, keyed by a build identifier.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use crate::errors::Error;
use crate::jsonfile::{atomic_write_json, load_json};
use crate::types::{BuildRecord, BuildState, StatusEvent};

pub const STATUS_FILE: &str = "status.json";

#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn send_started(&self) -> Result<(), Error>;

    async fn send_status(&self, message: &str) -> Result<(), Error>;

    /// Record an error while the build keeps running. Later record-dependent
    /// steps observe it through [`BuildRecord::has_errors`].
    async fn send_error(&self, message: &str, error: &str) -> Result<(), Error>;

    async fn send_finished(&self) -> Result<(), Error>;

    /// Terminal failure of the whole build.
    async fn send_failed(&self, message: &str, error: &str) -> Result<(), Error>;

    /// Materialized current state, or `None` before the first event.
    async fn load(&self) -> Result<Option<BuildRecord>, Error>;
}

/// File-backed [`StatusSink`], one status file per build directory.
#[derive(Debug)]
pub struct FileStatusSink {
    path: PathBuf,
    build_id: String,
    lock: Mutex<()>,
}

impl FileStatusSink {
    pub fn new(build_dir: &Path, build_id: impl Into<String>) -> Self {
        Self {
            path: build_dir.join(STATUS_FILE),
            build_id: build_id.into(),
            lock: Mutex::new(()),
        }
    }

    fn mutate(&self, apply: impl FnOnce(&mut BuildRecord)) -> Result<(), Error> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut record: BuildRecord =
            load_json(&self.path)?.unwrap_or_else(|| BuildRecord::new(&self.build_id));
        apply(&mut record);
        atomic_write_json(&self.path, &record)
    }

    fn push_event(record: &mut BuildRecord, message: &str) {
        record.events.push(StatusEvent {
            at: Utc::now(),
            message: message.to_string(),
        });
    }
}

#[async_trait]
impl StatusSink for FileStatusSink {
    async fn send_started(&self) -> Result<(), Error> {
        info!(build = %self.build_id, "build started");
        self.mutate(|record| {
            record.state = BuildState::Started;
            Self::push_event(record, "build started");
        })
    }

    async fn send_status(&self, message: &str) -> Result<(), Error> {
        info!(build = %self.build_id, message, "status");
        self.mutate(|record| Self::push_event(record, message))
    }

    async fn send_error(&self, message: &str, error: &str) -> Result<(), Error> {
        info!(build = %self.build_id, message, error, "error recorded, build continues");
        self.mutate(|record| {
            Self::push_event(record, message);
            record.errors.push(error.to_string());
        })
    }

    async fn send_finished(&self) -> Result<(), Error> {
        info!(build = %self.build_id, "build finished");
        self.mutate(|record| {
            record.state = BuildState::Finished;
            record.finished_at = Some(Utc::now());
            Self::push_event(record, "build finished");
        })
    }

    async fn send_failed(&self, message: &str, error: &str) -> Result<(), Error> {
        info!(build = %self.build_id, message, error, "build failed");
        self.mutate(|record| {
            record.state = BuildState::Failed;
            record.finished_at = Some(Utc::now());
            Self::push_event(record, message);
            record.errors.push(error.to_string());
        })
    }

    async fn load(&self) -> Result<Option<BuildRecord>, Error> {
        load_json(&self.path)
    }
}

/// In-memory [`StatusSink`] for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStatusSink {
    build_id: String,
    record: Mutex<Option<BuildRecord>>,
}

impl MemoryStatusSink {
    pub fn new(build_id: impl Into<String>) -> Self {
        Self {
            build_id: build_id.into(),
            record: Mutex::new(None),
        }
    }

    /// Pre-seed the record, e.g. with accumulated errors.
    pub fn seed(&self, record: BuildRecord) {
        *self.record.lock().unwrap_or_else(|e| e.into_inner()) = Some(record);
    }

    fn mutate(&self, apply: impl FnOnce(&mut BuildRecord)) {
        let mut guard = self.record.lock().unwrap_or_else(|e| e.into_inner());
        let record = guard.get_or_insert_with(|| BuildRecord::new(&self.build_id));
        apply(record);
    }
}

#[async_trait]
impl StatusSink for MemoryStatusSink {
    async fn send_started(&self) -> Result<(), Error> {
        self.mutate(|record| {
            record.state = BuildState::Started;
            FileStatusSink::push_event(record, "build started");
        });
        Ok(())
    }

    async fn send_status(&self, message: &str) -> Result<(), Error> {
        self.mutate(|record| FileStatusSink::push_event(record, message));
        Ok(())
    }

    async fn send_error(&self, message: &str, error: &str) -> Result<(), Error> {
        self.mutate(|record| {
            FileStatusSink::push_event(record, message);
            record.errors.push(error.to_string());
        });
        Ok(())
    }

    async fn send_finished(&self) -> Result<(), Error> {
        self.mutate(|record| {
            record.state = BuildState::Finished;
            record.finished_at = Some(Utc::now());
        });
        Ok(())
    }

    async fn send_failed(&self, message: &str, error: &str) -> Result<(), Error> {
        self.mutate(|record| {
            record.state = BuildState::Failed;
            record.finished_at = Some(Utc::now());
            FileStatusSink::push_event(record, message);
            record.errors.push(error.to_string());
        });
        Ok(())
    }

    async fn load(&self) -> Result<Option<BuildRecord>, Error> {
        Ok(self
            .record
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }
}
