//! Durable deployment record store: version records and build jobs, keyed by
//! deployment identity.
//!
//! The store is the single source of truth for "what has been deployed".
//! Duplicate detection on insert is the concurrency-safety mechanism: two
//! concurrent allocations of the same full version cannot both succeed, so a
//! double-run is detected instead of silently overwritten.

use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::errors::{Error, TimeoutKind};
use crate::jsonfile::{atomic_write_json, load_json};
use crate::types::{BuildJob, BuildJobEvent, BuildJobStatus, VersionRecord, VersionStatus};

/// Target `MAJOR.MINOR` line of a short version string.
fn line_of(short_version: &str) -> String {
    short_version.splitn(3, '.').take(2).collect::<Vec<_>>().join(".")
}

pub fn full_version(short_version: &str, build_str: &str) -> String {
    format!("{short_version}+{build_str}")
}

pub trait RecordStore: Send + Sync {
    /// Version records of one unit scoped to a target line, optionally only
    /// the ones that actually deployed.
    fn find_versions(
        &self,
        deployment_id: &str,
        target_line: &str,
        only_deployed: bool,
    ) -> Result<Vec<VersionRecord>, Error>;

    /// Insert a new `pending` record. Fails with
    /// [`Error::DuplicateVersion`] when the `(deployment_id, full_version)`
    /// pair already exists.
    fn create_version(
        &self,
        deployment_id: &str,
        short_version: &str,
        build_str: &str,
        fingerprint: &str,
    ) -> Result<VersionRecord, Error>;

    /// Look up one record. A version containing `+` matches the full
    /// version exactly; otherwise the most recent record with that short
    /// version wins.
    fn get_version(&self, deployment_id: &str, version: &str)
    -> Result<Option<VersionRecord>, Error>;

    fn record_success(
        &self,
        deployment_id: &str,
        full_version: &str,
    ) -> Result<VersionRecord, Error>;

    /// Mark a record failed with an already-normalized error message (see
    /// [`crate::errors::render_chain`]).
    fn record_failure(
        &self,
        deployment_id: &str,
        full_version: &str,
        error: &str,
    ) -> Result<VersionRecord, Error>;

    /// Create a build-job tracking record. At most one job may exist per
    /// `(deployment_id, full_version)` pair.
    fn create_build_job(
        &self,
        deployment_id: &str,
        full_version: &str,
    ) -> Result<BuildJob, Error>;

    fn check_build_job(
        &self,
        deployment_id: &str,
        full_version: &str,
    ) -> Result<Option<BuildJob>, Error>;

    /// Overwrite the job's current status and append the transition to its
    /// history.
    fn update_build_job(
        &self,
        deployment_id: &str,
        full_version: &str,
        status: BuildJobStatus,
        meta: Option<serde_json::Value>,
    ) -> Result<BuildJob, Error>;

    fn build_job_started(
        &self,
        deployment_id: &str,
        full_version: &str,
    ) -> Result<BuildJob, Error> {
        self.update_build_job(deployment_id, full_version, BuildJobStatus::Started, None)
    }

    fn build_job_success(
        &self,
        deployment_id: &str,
        full_version: &str,
    ) -> Result<BuildJob, Error> {
        self.update_build_job(deployment_id, full_version, BuildJobStatus::Success, None)
    }

    fn build_job_error(
        &self,
        deployment_id: &str,
        full_version: &str,
        message: &str,
    ) -> Result<BuildJob, Error> {
        self.update_build_job(
            deployment_id,
            full_version,
            BuildJobStatus::Error,
            Some(serde_json::json!({ "error": message })),
        )
    }
}

/// File-backed [`RecordStore`]: one versions file and one jobs file per
/// deployment id, written atomically under a single root directory.
#[derive(Debug)]
pub struct FileRecordStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl FileRecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| Error::io(format!("failed to create store dir {}", root.display()), e))?;
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    fn slug(deployment_id: &str) -> String {
        deployment_id.replace(':', "___")
    }

    fn versions_path(&self, deployment_id: &str) -> PathBuf {
        self.root.join(format!("{}.versions.json", Self::slug(deployment_id)))
    }

    fn jobs_path(&self, deployment_id: &str) -> PathBuf {
        self.root.join(format!("{}.jobs.json", Self::slug(deployment_id)))
    }

    fn load_versions(&self, deployment_id: &str) -> Result<Vec<VersionRecord>, Error> {
        Ok(load_json(&self.versions_path(deployment_id))?.unwrap_or_default())
    }

    fn load_jobs(&self, deployment_id: &str) -> Result<Vec<BuildJob>, Error> {
        Ok(load_json(&self.jobs_path(deployment_id))?.unwrap_or_default())
    }

    fn mutate_version(
        &self,
        deployment_id: &str,
        full: &str,
        apply: impl FnOnce(&mut VersionRecord),
    ) -> Result<VersionRecord, Error> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut records = self.load_versions(deployment_id)?;
        let record = records
            .iter_mut()
            .find(|r| r.full_version == full)
            .ok_or_else(|| {
                Error::input(format!("no version record {full} for {deployment_id}"))
            })?;
        apply(record);
        let updated = record.clone();
        atomic_write_json(&self.versions_path(deployment_id), &records)?;
        Ok(updated)
    }
}

impl RecordStore for FileRecordStore {
    fn find_versions(
        &self,
        deployment_id: &str,
        target_line: &str,
        only_deployed: bool,
    ) -> Result<Vec<VersionRecord>, Error> {
        let records = self.load_versions(deployment_id)?;
        Ok(records
            .into_iter()
            .filter(|r| r.target_version == target_line)
            .filter(|r| !only_deployed || r.status == VersionStatus::Deployed)
            .collect())
    }

    fn create_version(
        &self,
        deployment_id: &str,
        short_version: &str,
        build_str: &str,
        fingerprint: &str,
    ) -> Result<VersionRecord, Error> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut records = self.load_versions(deployment_id)?;
        let full = full_version(short_version, build_str);

        if records.iter().any(|r| r.full_version == full) {
            return Err(Error::DuplicateVersion {
                deployment_id: deployment_id.to_string(),
                full_version: full,
            });
        }

        let record = VersionRecord {
            deployment_id: deployment_id.to_string(),
            short_version: short_version.to_string(),
            full_version: full,
            target_version: line_of(short_version),
            fingerprint: fingerprint.to_string(),
            build_str: build_str.to_string(),
            status: VersionStatus::Pending,
            deployment_time: None,
            error: None,
        };
        records.push(record.clone());
        atomic_write_json(&self.versions_path(deployment_id), &records)?;
        debug!(deployment_id, version = %record.full_version, "created pending version record");
        Ok(record)
    }

    fn get_version(
        &self,
        deployment_id: &str,
        version: &str,
    ) -> Result<Option<VersionRecord>, Error> {
        let records = self.load_versions(deployment_id)?;
        if version.contains('+') {
            Ok(records.into_iter().find(|r| r.full_version == version))
        } else {
            Ok(records
                .into_iter()
                .rev()
                .find(|r| r.short_version == version))
        }
    }

    fn record_success(
        &self,
        deployment_id: &str,
        full: &str,
    ) -> Result<VersionRecord, Error> {
        self.mutate_version(deployment_id, full, |r| {
            r.status = VersionStatus::Deployed;
            r.deployment_time = Some(Utc::now());
            r.error = None;
        })
    }

    fn record_failure(
        &self,
        deployment_id: &str,
        full: &str,
        error: &str,
    ) -> Result<VersionRecord, Error> {
        let message = if error.trim().is_empty() {
            "Unknown error".to_string()
        } else {
            error.to_string()
        };
        self.mutate_version(deployment_id, full, |r| {
            r.status = VersionStatus::Failed;
            r.deployment_time = Some(Utc::now());
            r.error = Some(message);
        })
    }

    fn create_build_job(
        &self,
        deployment_id: &str,
        full: &str,
    ) -> Result<BuildJob, Error> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut jobs = self.load_jobs(deployment_id)?;

        if jobs.iter().any(|j| j.full_version == full) {
            return Err(Error::DuplicateBuildJob {
                deployment_id: deployment_id.to_string(),
                full_version: full.to_string(),
            });
        }

        let job = BuildJob {
            deployment_id: deployment_id.to_string(),
            full_version: full.to_string(),
            status: BuildJobStatus::Requested,
            started: false,
            complete: false,
            history: vec![BuildJobEvent {
                status: BuildJobStatus::Requested,
                at: Utc::now(),
                meta: None,
            }],
        };
        jobs.push(job.clone());
        atomic_write_json(&self.jobs_path(deployment_id), &jobs)?;
        Ok(job)
    }

    fn check_build_job(
        &self,
        deployment_id: &str,
        full: &str,
    ) -> Result<Option<BuildJob>, Error> {
        let jobs = self.load_jobs(deployment_id)?;
        Ok(jobs.into_iter().find(|j| j.full_version == full))
    }

    fn update_build_job(
        &self,
        deployment_id: &str,
        full: &str,
        status: BuildJobStatus,
        meta: Option<serde_json::Value>,
    ) -> Result<BuildJob, Error> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut jobs = self.load_jobs(deployment_id)?;
        let job = jobs
            .iter_mut()
            .find(|j| j.full_version == full)
            .ok_or_else(|| Error::MissingBuildJob {
                deployment_id: deployment_id.to_string(),
                full_version: full.to_string(),
            })?;

        job.status = status;
        if status == BuildJobStatus::Started {
            job.started = true;
        }
        if matches!(status, BuildJobStatus::Success | BuildJobStatus::Error) {
            job.complete = true;
        }
        job.history.push(BuildJobEvent {
            status,
            at: Utc::now(),
            meta,
        });

        let updated = job.clone();
        atomic_write_json(&self.jobs_path(deployment_id), &jobs)?;
        Ok(updated)
    }
}

/// Poll a build job until it completes.
///
/// Fails with a `never-started` timeout when no `started` transition appears
/// within `start_timeout`, and a `never-completed` timeout when the job does
/// not complete within `complete_timeout` (both measured from entry).
/// Returns the completed job; the caller inspects its terminal status.
pub async fn wait_for_build_job(
    store: &dyn RecordStore,
    deployment_id: &str,
    full_version: &str,
    poll_interval: Duration,
    start_timeout: Duration,
    complete_timeout: Duration,
) -> Result<BuildJob, Error> {
    let entered = tokio::time::Instant::now();
    let start_deadline = entered + start_timeout;
    let complete_deadline = entered + complete_timeout;
    let subject = format!("{deployment_id}@{full_version}");

    loop {
        let job = store.check_build_job(deployment_id, full_version)?;

        if let Some(job) = &job
            && job.complete
        {
            return Ok(job.clone());
        }

        let now = tokio::time::Instant::now();
        let started = job.as_ref().is_some_and(|j| j.started);
        if !started && now >= start_deadline {
            return Err(Error::Timeout {
                kind: TimeoutKind::NeverStarted,
                subject,
                waited: start_timeout,
            });
        }
        if now >= complete_deadline {
            return Err(Error::Timeout {
                kind: TimeoutKind::NeverCompleted,
                subject,
                waited: complete_timeout,
            });
        }

        tokio::time::sleep(poll_interval).await;
    }
}

/// Poll an external visibility check (e.g. a registry listing) until it
/// reports true or the wall-clock budget is spent.
pub async fn wait_until_visible<F, Fut>(
    subject: &str,
    poll_interval: Duration,
    timeout: Duration,
    mut check: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if check().await? {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Timeout {
                kind: TimeoutKind::Visibility,
                subject: subject.to_string(),
                waited: timeout,
            });
        }
        tokio::time::sleep(poll_interval).await;
    }
}
