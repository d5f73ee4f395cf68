//! Deployment planning and versioning engine for monorepo CI builds.
//!
//! Given a service of many deployable units (registry packages, serverless
//! function sets, hosted apps, desktop installers), slipway computes a
//! content fingerprint per unit that accounts for transitive local
//! dependencies, decides whether a new version needs to be cut by comparing
//! against the last successfully deployed one, allocates the next semantic
//! version collision-free, orders work so dependents ship only after their
//! dependencies, and records outcomes durably so re-runs and partial
//! failures are safely resumable.
//!
//! The main entry points:
//!
//! - [`config::ServiceSpec`] declares the service and its units.
//! - [`planner::DeploymentPlanner`] plans and executes one build's deploys.
//! - [`phase::PhaseRunner`] drives the surrounding install, prebuild, build
//!   and postbuild phases with failure containment.
//! - [`records::RecordStore`] is the durable source of truth for what has
//!   been deployed.

pub mod artifacts;
pub mod buildinfo;
pub mod config;
pub mod errors;
pub mod fingerprint;
pub mod fsview;
pub mod hooks;
mod jsonfile;
pub mod phase;
pub mod planner;
pub mod records;
pub mod status;
pub mod types;

pub use slipway_version as version;
pub use slipway_worker as worker;

pub use errors::{Error, ErrorCollector};
pub use types::{DeployReport, DeployableUnit, DeploymentPlan, UnitKind, VersionRecord};
