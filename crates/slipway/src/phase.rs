//! Phase runner: drives one build through install, prebuild, build and
//! postbuild, with failure containment between phases.
//!
//! A build phase failure does not stop postbuild (finalization and cleanup
//! must always get their chance); any other phase failure is terminal.
//! Artifacts are snapshotted after every phase, failed ones included.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::artifacts::{ArtifactStore, BuildEvent, BuildEventKind};
use crate::buildinfo::{BuildInfo, BuildMode};
use crate::errors::{Error, render_anyhow, render_chain};
use crate::hooks::HookRunner;
use crate::status::StatusSink;
use crate::types::BuildRecord;

/// Delay before reading the build record back, covering status writes still
/// in flight from the previous phase.
const RECORD_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseName {
    Install,
    Prebuild,
    Build,
    Postbuild,
}

impl PhaseName {
    pub const ALL: [PhaseName; 4] = [
        PhaseName::Install,
        PhaseName::Prebuild,
        PhaseName::Build,
        PhaseName::Postbuild,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseName::Install => "install",
            PhaseName::Prebuild => "prebuild",
            PhaseName::Build => "build",
            PhaseName::Postbuild => "postbuild",
        }
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step names per phase for a build mode. Test-only builds stop at tests;
/// full deploys run the whole ship-and-verify tail.
pub fn phase_steps(mode: BuildMode, phase: PhaseName) -> &'static [&'static str] {
    match (mode, phase) {
        (_, PhaseName::Install) => &["install-dependencies"],
        (_, PhaseName::Prebuild) => &["service-spec", "build-info"],
        (_, PhaseName::Build) => &["run-tests"],
        (BuildMode::TestOnly, PhaseName::Postbuild) => &["finalize"],
        (BuildMode::FullDeploy, PhaseName::Postbuild) => &[
            "stash-dev-dependencies",
            "do-deploys",
            "restore-dev-dependencies",
            "do-migrations",
            "health-check",
            "docs-publish",
            "finalize",
        ],
    }
}

pub struct StepContext<'a> {
    pub root: &'a Path,
    pub build: &'a BuildInfo,
    pub artifacts: &'a ArtifactStore,
    pub status: &'a dyn StatusSink,
    /// Loaded build record, for steps that declared they need one.
    pub record: Option<BuildRecord>,
}

/// One atomic unit of work within a phase.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the step must load the build record before working. A
    /// missing record fails the step immediately; a record already carrying
    /// errors skips the step's work instead of compounding failures.
    fn requires_record(&self) -> bool {
        false
    }

    /// Finalization must never be skipped, errors or not.
    fn runs_despite_errors(&self) -> bool {
        false
    }

    async fn run(&self, ctx: &StepContext<'_>) -> anyhow::Result<()>;
}

#[derive(Debug)]
pub enum BuildOutcome {
    Succeeded,
    /// The build completed its phases but collected failures.
    Failed,
    /// An unexpected internal error outside the collected-failure path.
    Errored(Error),
}

impl BuildOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, BuildOutcome::Succeeded)
    }
}

pub struct PhaseRunner {
    root: PathBuf,
    build_id: String,
    build: BuildInfo,
    steps: BTreeMap<String, Arc<dyn Step>>,
    hooks: Arc<dyn HookRunner>,
    status: Arc<dyn StatusSink>,
    artifacts: ArtifactStore,
    grace: Duration,
}

impl PhaseRunner {
    pub fn new(
        root: impl Into<PathBuf>,
        project: &str,
        build: BuildInfo,
        status: Arc<dyn StatusSink>,
        hooks: Arc<dyn HookRunner>,
        artifacts: ArtifactStore,
    ) -> Self {
        let build_id = format!("{project}/{}", build.build_str());
        Self {
            root: root.into(),
            build_id,
            build,
            steps: BTreeMap::new(),
            hooks,
            status,
            artifacts,
            grace: RECORD_GRACE,
        }
    }

    pub fn register_step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.insert(step.name().to_string(), step);
        self
    }

    pub fn with_record_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Run the whole build to a terminal status.
    pub async fn run_build(&self) -> BuildOutcome {
        match self.drive().await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(build = %self.build_id, error = %render_chain(&err), "build aborted by internal error");
                BuildOutcome::Errored(err)
            }
        }
    }

    async fn drive(&self) -> Result<BuildOutcome, Error> {
        self.status.send_started().await?;
        let mut build_failure: Option<String> = None;

        for phase in PhaseName::ALL {
            match self.run_phase(phase).await {
                Ok(()) => {}
                Err(err) if phase == PhaseName::Build => {
                    // Build failures are contained: postbuild still runs so
                    // finalization gets its chance.
                    let message = render_chain(&err);
                    self.status
                        .send_error("build phase failed", &message)
                        .await?;
                    build_failure = Some(message);
                }
                Err(err) => {
                    let message = render_chain(&err);
                    self.status
                        .send_failed(&format!("{phase} phase failed"), &message)
                        .await?;
                    return Ok(BuildOutcome::Failed);
                }
            }
        }

        match build_failure {
            None => {
                self.status.send_finished().await?;
                Ok(BuildOutcome::Succeeded)
            }
            Some(message) => {
                self.status.send_failed("build phase failed", &message).await?;
                Ok(BuildOutcome::Failed)
            }
        }
    }

    async fn run_phase(&self, phase: PhaseName) -> Result<(), Error> {
        info!(build = %self.build_id, %phase, "running phase");
        self.artifacts
            .append_event(&BuildEvent::now(BuildEventKind::PhaseStarted {
                phase: phase.to_string(),
            }))?;

        let result = self.run_phase_steps(phase).await;

        if let Err(err) = self
            .artifacts
            .append_event(&BuildEvent::now(BuildEventKind::PhaseFinished {
                phase: phase.to_string(),
                ok: result.is_ok(),
            }))
        {
            warn!(%phase, error = %err, "failed to append phase event");
        }

        // Partial artifacts from a failed phase must stay retrievable.
        if let Err(err) = self.artifacts.upload(&format!("after-{phase}")) {
            warn!(%phase, error = %err, "artifact upload failed");
        }

        result
    }

    async fn run_phase_steps(&self, phase: PhaseName) -> Result<(), Error> {
        let env = self.hook_env(phase, None);
        let hook = format!("phase-{phase}");
        self.hooks.run_before(&self.root, &hook, &env).await?;

        for name in phase_steps(self.build.mode, phase) {
            self.run_step(phase, name).await?;
        }

        self.hooks.run_after(&self.root, &hook, &env).await?;
        Ok(())
    }

    async fn run_step(&self, phase: PhaseName, name: &str) -> Result<(), Error> {
        let step = self
            .steps
            .get(name)
            .ok_or_else(|| Error::input(format!("no step registered as {name:?}")))?;

        self.artifacts
            .append_event(&BuildEvent::now(BuildEventKind::StepStarted {
                phase: phase.to_string(),
                step: name.to_string(),
            }))?;

        let env = self.hook_env(phase, Some(name));
        let hook = format!("step-{name}");
        self.hooks.run_before(&self.root, &hook, &env).await?;

        let record = if step.requires_record() {
            tokio::time::sleep(self.grace).await;
            let record = self.status.load().await?.ok_or_else(|| {
                Error::MissingBuildRecord {
                    build_id: self.build_id.clone(),
                }
            })?;
            if record.has_errors() && !step.runs_despite_errors() {
                info!(step = name, "build record carries errors, skipping step");
                self.artifacts
                    .append_event(&BuildEvent::now(BuildEventKind::StepSkipped {
                        phase: phase.to_string(),
                        step: name.to_string(),
                        reason: "prior-errors".to_string(),
                    }))?;
                self.hooks.run_after(&self.root, &hook, &env).await?;
                return Ok(());
            }
            Some(record)
        } else {
            None
        };

        let ctx = StepContext {
            root: &self.root,
            build: &self.build,
            artifacts: &self.artifacts,
            status: self.status.as_ref(),
            record,
        };
        let result = step.run(&ctx).await;

        if let Err(err) = self
            .artifacts
            .append_event(&BuildEvent::now(BuildEventKind::StepFinished {
                phase: phase.to_string(),
                step: name.to_string(),
                ok: result.is_ok(),
            }))
        {
            warn!(step = name, error = %err, "failed to append step event");
        }

        match result {
            Ok(()) => {
                self.hooks.run_after(&self.root, &hook, &env).await?;
                Ok(())
            }
            Err(err) => Err(Error::Step {
                step: name.to_string(),
                message: render_anyhow(&err),
            }),
        }
    }

    fn hook_env(&self, phase: PhaseName, step: Option<&str>) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("SLIPWAY_BUILD_STR".to_string(), self.build.build_str());
        env.insert("SLIPWAY_PHASE".to_string(), phase.to_string());
        if let Some(step) = step {
            env.insert("SLIPWAY_STEP".to_string(), step.to_string());
        }
        env
    }
}
