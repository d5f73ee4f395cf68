//! Service spec: the TOML file declaring a service's deployable units.
//!
//! ```toml
//! [service]
//! name = "shop"
//!
//! [environment_tags]
//! staging = "rc"
//!
//! [deployments.util]
//! kind = "registry-package"
//! root = "packages/util"
//! files = ["src/**/*", "package.json"]
//! auto_version = "1.4"
//!
//! [deployments.api]
//! kind = "serverless"
//! root = "services/api"
//! files = ["src/**/*", "package.json"]
//! auto_version = "2.3"
//! dependencies = ["util"]
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::Error;
use crate::types::{DeployableUnit, LocalDependency, UnitKind};

pub const SERVICE_SPEC_FILE: &str = "slipway.service.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawService {
    name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentDecl {
    pub kind: UnitKind,
    pub root: PathBuf,
    pub files: Vec<String>,
    pub auto_version: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub dev_dependencies: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawSpec {
    service: RawService,
    #[serde(default)]
    environment_tags: BTreeMap<String, String>,
    #[serde(default)]
    deployments: BTreeMap<String, DeploymentDecl>,
}

/// Validated service specification.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub service: String,
    environment_tags: BTreeMap<String, String>,
    deployments: BTreeMap<String, DeploymentDecl>,
}

impl ServiceSpec {
    pub fn load(dir: &Path) -> Result<Self, Error> {
        let path = dir.join(SERVICE_SPEC_FILE);
        let content = fs::read_to_string(&path)
            .map_err(|e| Error::io(format!("failed to read service spec {}", path.display()), e))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, Error> {
        let raw: RawSpec = toml::from_str(content)
            .map_err(|e| Error::input(format!("failed to parse service spec: {e}")))?;
        let spec = Self {
            service: raw.service.name,
            environment_tags: raw.environment_tags,
            deployments: raw.deployments,
        };
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.service.trim().is_empty() {
            return Err(Error::input("service name must not be empty"));
        }

        for (name, decl) in &self.deployments {
            slipway_version::parse_line(&decl.auto_version).map_err(|e| {
                Error::input(format!("deployment {name:?}: {e}"))
            })?;
            if decl.files.is_empty() {
                return Err(Error::input(format!(
                    "deployment {name:?} declares no file patterns"
                )));
            }
        }

        // Unknown dependency names and cycles are both rejected here, before
        // any fingerprint or priority work can run against them.
        slipway_worker::assign_priorities(&self.dependency_graph())?;
        Ok(())
    }

    /// Dependency graph over unit names, dev edges included.
    pub fn dependency_graph(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.deployments
            .iter()
            .map(|(name, decl)| {
                let deps = decl
                    .dependencies
                    .iter()
                    .chain(&decl.dev_dependencies)
                    .cloned()
                    .collect();
                (name.clone(), deps)
            })
            .collect()
    }

    pub fn deployments(&self) -> &BTreeMap<String, DeploymentDecl> {
        &self.deployments
    }

    /// Deployable units for one target environment.
    pub fn units(&self, environment: &str) -> Vec<DeployableUnit> {
        self.deployments
            .iter()
            .map(|(name, decl)| {
                let mut local_dependencies = BTreeMap::new();
                for dep in &decl.dependencies {
                    local_dependencies.insert(dep.clone(), LocalDependency { is_dev: false });
                }
                for dep in &decl.dev_dependencies {
                    local_dependencies.insert(dep.clone(), LocalDependency { is_dev: true });
                }
                DeployableUnit {
                    name: name.clone(),
                    kind: decl.kind,
                    root: decl.root.clone(),
                    file_patterns: decl.files.clone(),
                    auto_version_line: decl.auto_version.clone(),
                    environment: environment.to_string(),
                    local_dependencies,
                }
            })
            .collect()
    }

    /// Prerelease tag for an environment. An explicit mapping wins;
    /// production defaults to untagged; any other unmapped environment uses
    /// its own name as the tag.
    pub fn env_tag(&self, environment: &str) -> String {
        match self.environment_tags.get(environment) {
            Some(tag) => tag.clone(),
            None if environment == "production" => String::new(),
            None => environment.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: &str = r#"
        [service]
        name = "shop"

        [environment_tags]
        staging = "rc"

        [deployments.util]
        kind = "registry-package"
        root = "packages/util"
        files = ["src/**/*", "package.json"]
        auto_version = "1.4"

        [deployments.api]
        kind = "serverless"
        root = "services/api"
        files = ["src/**/*"]
        auto_version = "2.3"
        dependencies = ["util"]
        dev_dependencies = ["testkit"]

        [deployments.testkit]
        kind = "registry-package"
        root = "packages/testkit"
        files = ["src/**/*"]
        auto_version = "0.9"
    "#;

    #[test]
    fn parses_a_complete_spec() {
        let spec = ServiceSpec::from_toml(SPEC).expect("parse");
        assert_eq!(spec.service, "shop");
        assert_eq!(spec.deployments().len(), 3);
    }

    #[test]
    fn units_carry_environment_and_dependency_edges() {
        let spec = ServiceSpec::from_toml(SPEC).expect("parse");
        let units = spec.units("staging");

        let api = units.iter().find(|u| u.name == "api").expect("api unit");
        assert_eq!(api.environment, "staging");
        assert_eq!(api.kind, UnitKind::Serverless);
        assert!(!api.local_dependencies["util"].is_dev);
        assert!(api.local_dependencies["testkit"].is_dev);
    }

    #[test]
    fn env_tag_mapping_and_defaults() {
        let spec = ServiceSpec::from_toml(SPEC).expect("parse");
        assert_eq!(spec.env_tag("staging"), "rc");
        assert_eq!(spec.env_tag("production"), "");
        assert_eq!(spec.env_tag("uat"), "uat");
    }

    #[test]
    fn explicit_production_mapping_wins_over_default() {
        let spec = ServiceSpec::from_toml(
            r#"
            [service]
            name = "shop"

            [environment_tags]
            production = "prod"
        "#,
        )
        .expect("parse");
        assert_eq!(spec.env_tag("production"), "prod");
    }

    #[test]
    fn unknown_dependency_is_rejected_at_load() {
        let err = ServiceSpec::from_toml(
            r#"
            [service]
            name = "shop"

            [deployments.api]
            kind = "serverless"
            root = "services/api"
            files = ["src/**/*"]
            auto_version = "2.3"
            dependencies = ["ghost"]
        "#,
        )
        .expect_err("unknown dep");
        assert!(err.to_string().contains("unknown unit"));
    }

    #[test]
    fn dependency_cycle_is_rejected_at_load() {
        let err = ServiceSpec::from_toml(
            r#"
            [service]
            name = "shop"

            [deployments.a]
            kind = "registry-package"
            root = "packages/a"
            files = ["src/**/*"]
            auto_version = "1.0"
            dependencies = ["b"]

            [deployments.b]
            kind = "registry-package"
            root = "packages/b"
            files = ["src/**/*"]
            auto_version = "1.0"
            dependencies = ["a"]
        "#,
        )
        .expect_err("cycle");
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn bad_auto_version_line_is_rejected() {
        let err = ServiceSpec::from_toml(
            r#"
            [service]
            name = "shop"

            [deployments.api]
            kind = "serverless"
            root = "services/api"
            files = ["src/**/*"]
            auto_version = "2.3.1"
        "#,
        )
        .expect_err("bad line");
        assert!(err.to_string().contains("invalid target line"));
    }

    #[test]
    fn empty_file_patterns_are_rejected() {
        let err = ServiceSpec::from_toml(
            r#"
            [service]
            name = "shop"

            [deployments.api]
            kind = "serverless"
            root = "services/api"
            files = []
            auto_version = "2.3"
        "#,
        )
        .expect_err("no files");
        assert!(err.to_string().contains("no file patterns"));
    }

    #[test]
    fn load_reads_the_conventional_file_name() {
        let td = tempfile::tempdir().expect("tempdir");
        fs::write(td.path().join(SERVICE_SPEC_FILE), SPEC).expect("write");
        let spec = ServiceSpec::load(td.path()).expect("load");
        assert_eq!(spec.service, "shop");
    }
}
