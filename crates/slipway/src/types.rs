//! Core data model: deployable units, version records, build jobs, plans and
//! reports.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a deployable unit is shipped as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnitKind {
    RegistryPackage,
    Serverless,
    HostedApp,
    DesktopInstaller,
}

impl UnitKind {
    /// Registry packages gate bundle deploys: if any package publish fails,
    /// no bundle-kind unit is deployed in the same build.
    pub fn is_package(&self) -> bool {
        matches!(self, UnitKind::RegistryPackage)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitKind::RegistryPackage => "registry-package",
            UnitKind::Serverless => "serverless",
            UnitKind::HostedApp => "hosted-app",
            UnitKind::DesktopInstaller => "desktop-installer",
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one deployable unit within a service, rendered as
/// `service:kind:name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeploymentId {
    pub service: String,
    pub kind: UnitKind,
    pub name: String,
}

impl DeploymentId {
    pub fn new(service: impl Into<String>, kind: UnitKind, name: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.service, self.kind, self.name)
    }
}

/// A declared local dependency edge between two units of the same service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDependency {
    pub is_dev: bool,
}

/// One thing that can be versioned and shipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployableUnit {
    pub name: String,
    pub kind: UnitKind,
    pub root: PathBuf,
    pub file_patterns: Vec<String>,
    /// Target `MAJOR.MINOR` line version allocation is scoped to.
    pub auto_version_line: String,
    pub environment: String,
    pub local_dependencies: BTreeMap<String, LocalDependency>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VersionStatus {
    Pending,
    Deployed,
    Failed,
}

/// One allocated version of one unit. Created `pending` at plan time and
/// moved to exactly one terminal state when the publish attempt settles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub deployment_id: String,
    pub short_version: String,
    pub full_version: String,
    pub target_version: String,
    pub fingerprint: String,
    pub build_str: String,
    pub status: VersionStatus,
    pub deployment_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildJobStatus {
    Requested,
    Started,
    Success,
    Error,
}

/// One append-only transition in a build job's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildJobEvent {
    pub status: BuildJobStatus,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

/// Tracking record for a build handed off to an external builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildJob {
    pub deployment_id: String,
    pub full_version: String,
    pub status: BuildJobStatus,
    pub started: bool,
    pub complete: bool,
    pub history: Vec<BuildJobEvent>,
}

/// A dependency as resolved for one plan entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedDependency {
    pub resolved_name: String,
    pub resolved_version: String,
}

/// Planning outcome for one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub unit: String,
    pub kind: UnitKind,
    pub should_deploy: bool,
    pub version: VersionRecord,
    pub fingerprint: String,
    pub dependency_versions: BTreeMap<String, ResolvedDependency>,
}

/// Build-scoped plan across all units. Superseded entirely on the next
/// build; persisted only as an audit artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    pub service: String,
    pub environment: String,
    pub build_str: String,
    pub entries: BTreeMap<String, PlanEntry>,
}

impl DeploymentPlan {
    pub fn entries_of_kind(&self, package: bool) -> Vec<&PlanEntry> {
        self.entries
            .values()
            .filter(|e| e.kind.is_package() == package)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    /// Fingerprint matched the latest deployed version; nothing to do.
    UpToDate,
    /// A registry-package publish failed, so bundle deploys were skipped.
    PackageFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedUnit {
    pub name: String,
    pub reason: SkipReason,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SucceededUnit {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedUnit {
    pub name: String,
    pub error: String,
}

/// Aggregate outcome of one build's deploy step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployReport {
    pub skipped: Vec<SkippedUnit>,
    pub succeeded: Vec<SucceededUnit>,
    pub failed: Vec<FailedUnit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildState {
    Started,
    Finished,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Materialized current state of one build, as maintained by a status sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub build_id: String,
    pub state: BuildState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub events: Vec<StatusEvent>,
    pub errors: Vec<String>,
}

impl BuildRecord {
    pub fn new(build_id: impl Into<String>) -> Self {
        Self {
            build_id: build_id.into(),
            state: BuildState::Started,
            started_at: Utc::now(),
            finished_at: None,
            events: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_id_renders_service_kind_name() {
        let id = DeploymentId::new("shop", UnitKind::Serverless, "api");
        assert_eq!(id.to_string(), "shop:serverless:api");
    }

    #[test]
    fn unit_kind_serializes_kebab_case() {
        let json = serde_json::to_string(&UnitKind::RegistryPackage).expect("serialize");
        assert_eq!(json, "\"registry-package\"");
        let kind: UnitKind = serde_json::from_str("\"desktop-installer\"").expect("deserialize");
        assert_eq!(kind, UnitKind::DesktopInstaller);
    }

    #[test]
    fn only_registry_packages_are_packages() {
        assert!(UnitKind::RegistryPackage.is_package());
        assert!(!UnitKind::Serverless.is_package());
        assert!(!UnitKind::HostedApp.is_package());
        assert!(!UnitKind::DesktopInstaller.is_package());
    }

    #[test]
    fn version_record_roundtrips_through_json() {
        let record = VersionRecord {
            deployment_id: "shop:serverless:api".to_string(),
            short_version: "2.3.0".to_string(),
            full_version: "2.3.0+20240101000000000.abc.full-deploy.production".to_string(),
            target_version: "2.3".to_string(),
            fingerprint: "deadbeef".to_string(),
            build_str: "20240101000000000.abc.full-deploy.production".to_string(),
            status: VersionStatus::Pending,
            deployment_time: None,
            error: None,
        };
        let json = serde_json::to_string(&record).expect("serialize");
        let back: VersionRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, record);
    }

    #[test]
    fn fresh_build_record_has_no_errors() {
        let record = BuildRecord::new("shop/20240101000000000.abc.full-deploy.production");
        assert!(!record.has_errors());
        assert_eq!(record.state, BuildState::Started);
    }
}
