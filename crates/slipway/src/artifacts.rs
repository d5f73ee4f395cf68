//! Build-scoped artifact storage plus the append-only build event log.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::errors::Error;
use crate::jsonfile::atomic_write_json;

pub const EVENTS_FILE: &str = "events.jsonl";
const ARTIFACTS_DIR: &str = "artifacts";
const UPLOADS_DIR: &str = "uploads";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum BuildEventKind {
    PhaseStarted { phase: String },
    PhaseFinished { phase: String, ok: bool },
    StepStarted { phase: String, step: String },
    StepFinished { phase: String, step: String, ok: bool },
    StepSkipped { phase: String, step: String, reason: String },
    ArtifactsUploaded { tag: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: BuildEventKind,
}

impl BuildEvent {
    pub fn now(kind: BuildEventKind) -> Self {
        Self {
            at: Utc::now(),
            kind,
        }
    }
}

/// Entry of an upload manifest: one artifact file at upload time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub size: u64,
}

/// Name-addressed artifact storage under one build directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Initialize the artifacts root under `build_dir`, creating it if
    /// needed.
    pub fn init(build_dir: &Path) -> Result<Self, Error> {
        let root = build_dir.join(ARTIFACTS_DIR);
        fs::create_dir_all(&root).map_err(|e| {
            Error::io(format!("failed to create artifacts dir {}", root.display()), e)
        })?;
        debug!(root = %root.display(), "initialized artifacts dir");
        Ok(Self { root })
    }

    pub fn path(&self, section: Option<&str>, name: &str) -> PathBuf {
        match section {
            Some(section) => self.root.join(section).join(name),
            None => self.root.join(name),
        }
    }

    pub fn save(&self, section: Option<&str>, name: &str, data: &[u8]) -> Result<PathBuf, Error> {
        let path = self.path(section, name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::io(format!("failed to create artifact dir {}", parent.display()), e)
            })?;
        }
        fs::write(&path, data)
            .map_err(|e| Error::io(format!("failed to save artifact {}", path.display()), e))?;
        debug!(artifact = %path.display(), "saved artifact");
        Ok(path)
    }

    pub fn save_json<T: Serialize>(
        &self,
        section: Option<&str>,
        name: &str,
        value: &T,
    ) -> Result<PathBuf, Error> {
        let path = self.path(section, name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::io(format!("failed to create artifact dir {}", parent.display()), e)
            })?;
        }
        atomic_write_json(&path, value)?;
        debug!(artifact = %path.display(), "saved artifact");
        Ok(path)
    }

    /// A missing artifact is "not yet computed", not an error.
    pub fn load(&self, section: Option<&str>, name: &str) -> Result<Option<Vec<u8>>, Error> {
        let path = self.path(section, name);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path)
            .map_err(|e| Error::io(format!("failed to load artifact {}", path.display()), e))?;
        Ok(Some(data))
    }

    pub fn load_json<T: DeserializeOwned>(
        &self,
        section: Option<&str>,
        name: &str,
    ) -> Result<Option<T>, Error> {
        crate::jsonfile::load_json(&self.path(section, name))
    }

    pub fn append_event(&self, event: &BuildEvent) -> Result<(), Error> {
        let path = self.root.join(EVENTS_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::io(format!("failed to open event log {}", path.display()), e))?;
        let mut writer = std::io::BufWriter::new(file);
        let line = serde_json::to_string(event)
            .map_err(|e| Error::input(format!("failed to serialize build event: {e}")))?;
        writeln!(writer, "{line}")
            .map_err(|e| Error::io(format!("failed to append event to {}", path.display()), e))?;
        writer
            .flush()
            .map_err(|e| Error::io(format!("failed to flush event log {}", path.display()), e))?;
        Ok(())
    }

    pub fn read_events(&self) -> Result<Vec<BuildEvent>, Error> {
        let path = self.root.join(EVENTS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&path)
            .map_err(|e| Error::io(format!("failed to open event log {}", path.display()), e))?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(|e| {
                Error::io(format!("failed to read event log {}", path.display()), e)
            })?;
            let event = serde_json::from_str(&line)
                .map_err(|e| Error::input(format!("failed to parse build event: {e}")))?;
            events.push(event);
        }
        Ok(events)
    }

    /// Snapshot the current artifact set into an upload manifest tagged with
    /// `tag` (conventionally `after-<phase>`). Runs after every phase,
    /// failed ones included, so partial artifacts stay retrievable.
    pub fn upload(&self, tag: &str) -> Result<PathBuf, Error> {
        let mut entries = Vec::new();
        for entry in WalkDir::new(&self.root) {
            let entry = entry.map_err(|e| {
                Error::input(format!("failed to walk artifacts dir: {e}"))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|e| Error::input(format!("artifact outside root: {e}")))?;
            if relative.starts_with(UPLOADS_DIR) {
                continue;
            }
            let meta = entry.metadata().map_err(|e| {
                Error::input(format!("failed to stat artifact {}: {e}", relative.display()))
            })?;
            entries.push(ManifestEntry {
                path: relative.to_string_lossy().replace('\\', "/"),
                size: meta.len(),
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        let manifest_path = self.path(Some(UPLOADS_DIR), &format!("{tag}.json"));
        if let Some(parent) = manifest_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::io(format!("failed to create uploads dir {}", parent.display()), e)
            })?;
        }
        atomic_write_json(&manifest_path, &entries)?;

        self.append_event(&BuildEvent::now(BuildEventKind::ArtifactsUploaded {
            tag: tag.to_string(),
        }))?;
        debug!(tag, files = entries.len(), "uploaded artifacts snapshot");
        Ok(manifest_path)
    }
}
