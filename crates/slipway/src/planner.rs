//! Deployment planner: fingerprint, decide, allocate and execute across all
//! units of a service in dependency order.
//!
//! Planning visits units dependencies-first (the scheduler barrier
//! guarantees a dependency's fingerprint and version are final before any
//! dependent reads them), so each unit's dependency tokens are built from
//! already-settled plan entries. Execution publishes registry packages
//! first; if any package fails, every bundle-kind deploy in the build is
//! skipped outright rather than shipped against unpublished dependencies.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::artifacts::ArtifactStore;
use crate::config::ServiceSpec;
use crate::errors::{Error, ErrorCollector, render_chain};
use crate::fingerprint::{dependency_token, fingerprint};
use crate::fsview::FileSystemView;
use crate::hooks::HookRunner;
use crate::records::RecordStore;
use crate::types::{
    DeployReport, DeployableUnit, DeploymentId, DeploymentPlan, FailedUnit, PlanEntry,
    ResolvedDependency, SkipReason, SkippedUnit, SucceededUnit, UnitKind, VersionRecord,
};

pub const PACKAGE_PLAN_FILE: &str = "package-plan.json";
pub const BUNDLE_PLAN_FILE: &str = "bundle-plan.json";
pub const DEPLOY_REPORT_FILE: &str = "deploy-report.json";
const DEPLOYMENT_SECTION: &str = "deployment";
const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Opaque credential bundle for one environment. Fetched once per build,
/// never cached beyond it.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub access: String,
    pub secret: String,
    pub region: String,
}

pub trait CredentialProvider: Send + Sync {
    fn credentials_for(&self, environment: &str) -> Result<Credentials, Error>;
}

/// Provider returning the same bundle for every environment.
#[derive(Debug, Default)]
pub struct StaticCredentials(pub Credentials);

impl CredentialProvider for StaticCredentials {
    fn credentials_for(&self, _environment: &str) -> Result<Credentials, Error> {
        Ok(self.0.clone())
    }
}

/// Capability that physically ships a unit. One publisher is registered per
/// unit kind; publish failures surface as errors, never as silent success.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        unit: &DeployableUnit,
        version: &VersionRecord,
        credentials: &Credentials,
    ) -> Result<(), Error>;
}

pub struct DeploymentPlanner {
    root: PathBuf,
    spec: ServiceSpec,
    environment: String,
    build_str: String,
    fs: Arc<dyn FileSystemView>,
    store: Arc<dyn RecordStore>,
    hooks: Arc<dyn HookRunner>,
    credentials: Arc<dyn CredentialProvider>,
    publishers: BTreeMap<UnitKind, Arc<dyn Publisher>>,
    max_concurrency: usize,
}

impl DeploymentPlanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        root: impl Into<PathBuf>,
        spec: ServiceSpec,
        environment: impl Into<String>,
        build_str: impl Into<String>,
        fs: Arc<dyn FileSystemView>,
        store: Arc<dyn RecordStore>,
        hooks: Arc<dyn HookRunner>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            root: root.into(),
            spec,
            environment: environment.into(),
            build_str: build_str.into(),
            fs,
            store,
            hooks,
            credentials,
            publishers: BTreeMap::new(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }

    pub fn with_publisher(mut self, kind: UnitKind, publisher: Arc<dyn Publisher>) -> Self {
        self.publishers.insert(kind, publisher);
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Build the plan for this build: every unit's fingerprint, deploy
    /// decision and (when needed) freshly allocated pending version.
    pub fn plan(&self) -> Result<DeploymentPlan, Error> {
        let graph = self.spec.dependency_graph();
        let priorities = slipway_worker::assign_priorities(&graph)?;
        let tag = self.spec.env_tag(&self.environment);

        let units = self.spec.units(&self.environment);
        let groups = slipway_worker::priority_groups(units, |u| {
            priorities
                .get(&u.name)
                .copied()
                .unwrap_or(slipway_worker::BASE_PRIORITY)
        });

        let mut entries: BTreeMap<String, PlanEntry> = BTreeMap::new();
        for group in groups {
            for unit in group {
                let entry = self.plan_unit(&unit, &tag, &entries)?;
                entries.insert(unit.name.clone(), entry);
            }
        }

        Ok(DeploymentPlan {
            service: self.spec.service.clone(),
            environment: self.environment.clone(),
            build_str: self.build_str.clone(),
            entries,
        })
    }

    fn plan_unit(
        &self,
        unit: &DeployableUnit,
        tag: &str,
        entries: &BTreeMap<String, PlanEntry>,
    ) -> Result<PlanEntry, Error> {
        let unit_root = self.root.join(&unit.root);
        let files = self.fs.list_files(&unit_root, &unit.file_patterns)?;

        let mut tokens = Vec::new();
        let mut dependency_versions = BTreeMap::new();
        for dep in unit.local_dependencies.keys() {
            let resolved = entries.get(dep).ok_or_else(|| {
                Error::input(format!(
                    "dependency {dep:?} of {:?} has not been planned yet",
                    unit.name
                ))
            })?;
            tokens.push(dependency_token(
                dep,
                &resolved.version.short_version,
                &resolved.fingerprint,
            ));
            dependency_versions.insert(
                dep.clone(),
                ResolvedDependency {
                    resolved_name: dep.clone(),
                    resolved_version: resolved.version.short_version.clone(),
                },
            );
        }

        let digest = fingerprint(self.fs.as_ref(), &unit_root, &files, &tokens)?;

        let deployment_id =
            DeploymentId::new(&self.spec.service, unit.kind, &unit.name).to_string();
        let deployed = self
            .store
            .find_versions(&deployment_id, &unit.auto_version_line, true)?;
        let deployed_shorts: Vec<String> =
            deployed.iter().map(|r| r.short_version.clone()).collect();
        let latest =
            slipway_version::check_latest(&deployed_shorts, &unit.auto_version_line, tag)?;

        // Unchanged inputs never cut a new version: when the latest deployed
        // record carries the same fingerprint, reuse it as-is.
        if let Some(latest) = latest
            && let Some(record) = deployed.iter().rev().find(|r| r.short_version == latest)
            && record.fingerprint == digest
        {
            info!(
                unit = %unit.name,
                version = %record.short_version,
                "content unchanged, reusing deployed version"
            );
            return Ok(PlanEntry {
                unit: unit.name.clone(),
                kind: unit.kind,
                should_deploy: false,
                version: record.clone(),
                fingerprint: digest,
                dependency_versions,
            });
        }

        let all = self
            .store
            .find_versions(&deployment_id, &unit.auto_version_line, false)?;
        let existing: Vec<String> = all.iter().map(|r| r.short_version.clone()).collect();
        let next = slipway_version::next_version(&existing, &unit.auto_version_line, tag)?;
        let record = self
            .store
            .create_version(&deployment_id, &next, &self.build_str, &digest)?;
        info!(unit = %unit.name, version = %record.short_version, "allocated new version");

        Ok(PlanEntry {
            unit: unit.name.clone(),
            kind: unit.kind,
            should_deploy: true,
            version: record,
            fingerprint: digest,
            dependency_versions,
        })
    }

    /// Execute a plan: publish packages first, then bundles, recording every
    /// settlement in the store and in the persisted deploy report.
    ///
    /// Per-unit failures are collected rather than aborting siblings; after
    /// everything settles a single failure is returned as-is and several are
    /// combined into one aggregate.
    pub async fn deploy_all(
        &self,
        plan: &DeploymentPlan,
        artifacts: &ArtifactStore,
    ) -> Result<DeployReport, Error> {
        let packages = plan.entries_of_kind(true);
        let bundles = plan.entries_of_kind(false);
        artifacts.save_json(Some(DEPLOYMENT_SECTION), PACKAGE_PLAN_FILE, &packages)?;
        artifacts.save_json(Some(DEPLOYMENT_SECTION), BUNDLE_PLAN_FILE, &bundles)?;

        let priorities = slipway_worker::assign_priorities(&self.spec.dependency_graph())?;
        let credentials = self.credentials.credentials_for(&self.environment)?;
        let units: BTreeMap<String, DeployableUnit> = self
            .spec
            .units(&self.environment)
            .into_iter()
            .map(|u| (u.name.clone(), u))
            .collect();

        let mut report = DeployReport::default();
        let mut collector = ErrorCollector::new();

        for entry in plan.entries.values().filter(|e| !e.should_deploy) {
            report.skipped.push(SkippedUnit {
                name: entry.unit.clone(),
                reason: SkipReason::UpToDate,
                version: entry.version.short_version.clone(),
            });
        }

        let package_work: Vec<&PlanEntry> =
            packages.into_iter().filter(|e| e.should_deploy).collect();
        let results = self
            .execute(package_work, &units, &priorities, &credentials)
            .await;
        self.absorb(results, &mut report, &mut collector);
        let package_failed = !report.failed.is_empty();

        let bundle_work: Vec<&PlanEntry> =
            bundles.into_iter().filter(|e| e.should_deploy).collect();
        if package_failed {
            warn!("a package publish failed; skipping all bundle deploys this build");
            for entry in bundle_work {
                report.skipped.push(SkippedUnit {
                    name: entry.unit.clone(),
                    reason: SkipReason::PackageFailure,
                    version: entry.version.short_version.clone(),
                });
            }
        } else {
            let results = self
                .execute(bundle_work, &units, &priorities, &credentials)
                .await;
            self.absorb(results, &mut report, &mut collector);
        }

        artifacts.save_json(Some(DEPLOYMENT_SECTION), DEPLOY_REPORT_FILE, &report)?;
        collector.into_result().map(|()| report)
    }

    async fn execute<'a>(
        &self,
        entries: Vec<&'a PlanEntry>,
        units: &BTreeMap<String, DeployableUnit>,
        priorities: &BTreeMap<String, i64>,
        credentials: &Credentials,
    ) -> Vec<Result<(String, String), (String, Error)>> {
        slipway_worker::run(
            entries,
            |entry| {
                priorities
                    .get(&entry.unit)
                    .copied()
                    .unwrap_or(slipway_worker::BASE_PRIORITY)
            },
            self.max_concurrency,
            |entry| async move {
                match self.deploy_entry(entry, units, credentials).await {
                    Ok(()) => Ok((entry.unit.clone(), entry.version.short_version.clone())),
                    Err(err) => Err((entry.unit.clone(), err)),
                }
            },
        )
        .await
    }

    fn absorb(
        &self,
        results: Vec<Result<(String, String), (String, Error)>>,
        report: &mut DeployReport,
        collector: &mut ErrorCollector,
    ) {
        for result in results {
            match result {
                Ok((name, version)) => report.succeeded.push(SucceededUnit { name, version }),
                Err((name, err)) => {
                    report.failed.push(FailedUnit {
                        name,
                        error: render_chain(&err),
                    });
                    collector.push(err);
                }
            }
        }
    }

    async fn deploy_entry(
        &self,
        entry: &PlanEntry,
        units: &BTreeMap<String, DeployableUnit>,
        credentials: &Credentials,
    ) -> Result<(), Error> {
        let unit = units.get(&entry.unit).ok_or_else(|| {
            Error::input(format!("plan entry {:?} matches no declared unit", entry.unit))
        })?;

        let result = self.run_publish(unit, entry, credentials).await;
        let deployment_id = &entry.version.deployment_id;

        match result {
            Ok(()) => {
                self.store
                    .record_success(deployment_id, &entry.version.full_version)?;
                info!(unit = %unit.name, version = %entry.version.short_version, "deployed");
                Ok(())
            }
            Err(err) => {
                let message = render_chain(&err);
                // Best-effort: a failed status write must not mask the
                // original publish failure.
                if let Err(store_err) = self.store.record_failure(
                    deployment_id,
                    &entry.version.full_version,
                    &message,
                ) {
                    warn!(unit = %unit.name, error = %store_err, "failed to record deploy failure");
                }
                Err(err)
            }
        }
    }

    async fn run_publish(
        &self,
        unit: &DeployableUnit,
        entry: &PlanEntry,
        credentials: &Credentials,
    ) -> Result<(), Error> {
        let publisher = self.publishers.get(&unit.kind).ok_or_else(|| {
            Error::input(format!("no publisher registered for kind {}", unit.kind))
        })?;

        let scope = self.root.join(&unit.root);
        let mut env = BTreeMap::new();
        env.insert("SLIPWAY_DEPLOY_UNIT".to_string(), unit.name.clone());
        env.insert(
            "SLIPWAY_DEPLOY_VERSION".to_string(),
            entry.version.full_version.clone(),
        );
        env.insert("SLIPWAY_ENVIRONMENT".to_string(), self.environment.clone());

        self.hooks.run_before(&scope, "deploy", &env).await?;
        publisher.publish(unit, &entry.version, credentials).await?;
        self.hooks.run_after(&scope, "deploy", &env).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::fs;
    use std::path::Path;
    use std::sync::Mutex;

    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::fsview::LocalFileSystem;
    use crate::hooks::NoopHooks;
    use crate::records::FileRecordStore;
    use crate::types::VersionStatus;

    const BUILD: &str = "20240315120000123.abc.full-deploy.production";

    #[derive(Default)]
    struct MemPublisher {
        published: Mutex<Vec<String>>,
        fail: BTreeSet<String>,
    }

    impl MemPublisher {
        fn failing(names: &[&str]) -> Self {
            Self {
                published: Mutex::new(Vec::new()),
                fail: names.iter().map(|s| s.to_string()).collect(),
            }
        }

        fn published(&self) -> Vec<String> {
            self.published.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl Publisher for MemPublisher {
        async fn publish(
            &self,
            unit: &DeployableUnit,
            version: &VersionRecord,
            _credentials: &Credentials,
        ) -> Result<(), Error> {
            if self.fail.contains(&unit.name) {
                return Err(Error::Publish {
                    unit: unit.name.clone(),
                    message: format!("{} refused by registry", unit.name),
                });
            }
            self.published
                .lock()
                .expect("lock")
                .push(format!("{}@{}", unit.name, version.short_version));
            Ok(())
        }
    }

    struct Harness {
        td: TempDir,
        store: Arc<FileRecordStore>,
        publisher: Arc<MemPublisher>,
        planner: DeploymentPlanner,
        artifacts: ArtifactStore,
    }

    fn harness(spec_toml: &str, files: &[(&str, &str)], failing: &[&str]) -> Harness {
        let td = tempdir().expect("tempdir");
        for (rel, content) in files {
            let path = td.path().join(rel);
            fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
            fs::write(path, content).expect("write");
        }

        let spec = ServiceSpec::from_toml(spec_toml).expect("spec");
        let store =
            Arc::new(FileRecordStore::new(td.path().join(".slipway/records")).expect("store"));
        let publisher = Arc::new(MemPublisher::failing(failing));
        let artifacts = ArtifactStore::init(&td.path().join(".slipway")).expect("artifacts");

        let planner = DeploymentPlanner::new(
            td.path(),
            spec,
            "production",
            BUILD,
            Arc::new(LocalFileSystem::new()),
            Arc::clone(&store) as Arc<dyn RecordStore>,
            Arc::new(NoopHooks),
            Arc::new(StaticCredentials::default()),
        )
        .with_publisher(UnitKind::RegistryPackage, Arc::clone(&publisher) as _)
        .with_publisher(UnitKind::Serverless, Arc::clone(&publisher) as _)
        .with_publisher(UnitKind::HostedApp, Arc::clone(&publisher) as _)
        .with_max_concurrency(1);

        Harness {
            td,
            store,
            publisher,
            planner,
            artifacts,
        }
    }

    fn touch(root: &Path, rel: &str, content: &str) {
        fs::write(root.join(rel), content).expect("write");
    }

    const TWO_UNIT_SPEC: &str = r#"
        [service]
        name = "shop"

        [deployments.util]
        kind = "registry-package"
        root = "packages/util"
        files = ["src/**/*"]
        auto_version = "1.4"

        [deployments.api]
        kind = "serverless"
        root = "services/api"
        files = ["src/**/*"]
        auto_version = "2.3"
        dependencies = ["util"]
    "#;

    const TWO_UNIT_FILES: &[(&str, &str)] = &[
        ("packages/util/src/index.js", "util v1"),
        ("services/api/src/handler.js", "api v1"),
    ];

    #[test]
    fn plan_resolves_dependencies_before_dependents() {
        let h = harness(TWO_UNIT_SPEC, TWO_UNIT_FILES, &[]);
        let plan = h.planner.plan().expect("plan");

        let util = &plan.entries["util"];
        let api = &plan.entries["api"];
        assert!(util.should_deploy);
        assert!(api.should_deploy);
        assert_eq!(util.version.short_version, "1.4.0");
        assert_eq!(api.version.short_version, "2.3.0");

        let resolved = &api.dependency_versions["util"];
        assert_eq!(resolved.resolved_version, "1.4.0");
        assert!(api.dependency_versions.len() == 1);
    }

    #[tokio::test]
    async fn unchanged_rerun_is_a_no_op() {
        let h = harness(TWO_UNIT_SPEC, TWO_UNIT_FILES, &[]);

        let plan = h.planner.plan().expect("plan");
        h.planner
            .deploy_all(&plan, &h.artifacts)
            .await
            .expect("deploy");

        let replanned = h.planner.plan().expect("replan");
        assert!(!replanned.entries["util"].should_deploy);
        assert!(!replanned.entries["api"].should_deploy);

        // No new records were allocated on the second pass.
        let versions = h
            .store
            .find_versions("shop:registry-package:util", "1.4", false)
            .expect("find");
        assert_eq!(versions.len(), 1);
    }

    #[tokio::test]
    async fn dependency_change_cascades_to_dependents() {
        let h = harness(TWO_UNIT_SPEC, TWO_UNIT_FILES, &[]);

        let plan = h.planner.plan().expect("plan");
        h.planner
            .deploy_all(&plan, &h.artifacts)
            .await
            .expect("deploy");

        touch(h.td.path(), "packages/util/src/index.js", "util v2");
        let replanned = h.planner.plan().expect("replan");

        let util = &replanned.entries["util"];
        let api = &replanned.entries["api"];
        assert!(util.should_deploy);
        assert_eq!(util.version.short_version, "1.4.1");
        // The api files are untouched, but its dependency token changed.
        assert!(api.should_deploy);
        assert_eq!(api.version.short_version, "2.3.1");
        assert_eq!(api.dependency_versions["util"].resolved_version, "1.4.1");
    }

    #[tokio::test]
    async fn deploy_records_success_and_publishes_in_order() {
        let h = harness(TWO_UNIT_SPEC, TWO_UNIT_FILES, &[]);

        let plan = h.planner.plan().expect("plan");
        let report = h
            .planner
            .deploy_all(&plan, &h.artifacts)
            .await
            .expect("deploy");

        assert_eq!(report.succeeded.len(), 2);
        assert!(report.failed.is_empty());
        assert_eq!(h.publisher.published(), vec!["util@1.4.0", "api@2.3.0"]);

        let util = h
            .store
            .get_version("shop:registry-package:util", "1.4.0")
            .expect("get")
            .expect("exists");
        assert_eq!(util.status, VersionStatus::Deployed);
    }

    #[tokio::test]
    async fn package_failure_skips_all_bundles() {
        let h = harness(TWO_UNIT_SPEC, TWO_UNIT_FILES, &["util"]);

        let plan = h.planner.plan().expect("plan");
        let err = h
            .planner
            .deploy_all(&plan, &h.artifacts)
            .await
            .expect_err("package failed");
        assert!(err.to_string().contains("util refused by registry"));

        // Nothing bundle-kind was attempted.
        assert!(h.publisher.published().is_empty());

        let report: DeployReport = h
            .artifacts
            .load_json(Some("deployment"), DEPLOY_REPORT_FILE)
            .expect("load")
            .expect("exists");
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].name, "util");
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].name, "api");
        assert_eq!(report.skipped[0].reason, SkipReason::PackageFailure);

        let util = h
            .store
            .get_version("shop:registry-package:util", "1.4.0")
            .expect("get")
            .expect("exists");
        assert_eq!(util.status, VersionStatus::Failed);
        assert!(util.error.as_deref().is_some_and(|e| e.contains("refused")));
    }

    #[tokio::test]
    async fn sibling_failures_are_collected_into_one_aggregate() {
        let spec = r#"
            [service]
            name = "shop"

            [deployments.alpha]
            kind = "serverless"
            root = "services/alpha"
            files = ["src/**/*"]
            auto_version = "1.0"

            [deployments.beta]
            kind = "serverless"
            root = "services/beta"
            files = ["src/**/*"]
            auto_version = "1.0"

            [deployments.gamma]
            kind = "serverless"
            root = "services/gamma"
            files = ["src/**/*"]
            auto_version = "1.0"
        "#;
        let files = &[
            ("services/alpha/src/a.js", "a"),
            ("services/beta/src/b.js", "b"),
            ("services/gamma/src/c.js", "c"),
        ];
        let h = harness(spec, files, &["alpha", "beta"]);

        let plan = h.planner.plan().expect("plan");
        let err = h
            .planner
            .deploy_all(&plan, &h.artifacts)
            .await
            .expect_err("two failures");

        let rendered = err.to_string();
        assert!(rendered.contains("alpha refused by registry"));
        assert!(rendered.contains("beta refused by registry"));

        let report: DeployReport = h
            .artifacts
            .load_json(Some("deployment"), DEPLOY_REPORT_FILE)
            .expect("load")
            .expect("exists");
        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.succeeded[0].name, "gamma");
        assert_eq!(report.failed.len(), 2);
        let messages: Vec<&str> = report.failed.iter().map(|f| f.error.as_str()).collect();
        assert_ne!(messages[0], messages[1]);
    }

    #[tokio::test]
    async fn up_to_date_units_appear_as_skipped() {
        let h = harness(TWO_UNIT_SPEC, TWO_UNIT_FILES, &[]);

        let plan = h.planner.plan().expect("plan");
        h.planner
            .deploy_all(&plan, &h.artifacts)
            .await
            .expect("deploy");

        let replanned = h.planner.plan().expect("replan");
        let report = h
            .planner
            .deploy_all(&replanned, &h.artifacts)
            .await
            .expect("deploy");

        assert!(report.succeeded.is_empty());
        assert_eq!(report.skipped.len(), 2);
        assert!(
            report
                .skipped
                .iter()
                .all(|s| s.reason == SkipReason::UpToDate)
        );
    }

    #[test]
    fn prerelease_tags_follow_the_environment() {
        let spec = r#"
            [service]
            name = "shop"

            [environment_tags]
            staging = "rc"

            [deployments.api]
            kind = "serverless"
            root = "services/api"
            files = ["src/**/*"]
            auto_version = "2.3"
        "#;
        let td = tempdir().expect("tempdir");
        let path = td.path().join("services/api/src/handler.js");
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, "api").expect("write");

        let store =
            Arc::new(FileRecordStore::new(td.path().join(".slipway/records")).expect("store"));
        let planner = DeploymentPlanner::new(
            td.path(),
            ServiceSpec::from_toml(spec).expect("spec"),
            "staging",
            BUILD,
            Arc::new(LocalFileSystem::new()),
            store as Arc<dyn RecordStore>,
            Arc::new(NoopHooks),
            Arc::new(StaticCredentials::default()),
        );

        let plan = planner.plan().expect("plan");
        assert_eq!(plan.entries["api"].version.short_version, "2.3.0-rc.0");
    }
}
