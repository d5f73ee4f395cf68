//! Build strings: the opaque identifier tying every record of one build
//! together.
//!
//! Format: `YYYYMMDDHHMMSSmmm.<commit>.<mode>.<env>`, e.g.
//! `20240315120000123.4f9c2aa.full-deploy.staging`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::Error;

const STAMP_FORMAT: &str = "%Y%m%d%H%M%S%3f";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildMode {
    /// Run tests only; nothing is deployed and the environment is `none`.
    TestOnly,
    /// Full pipeline: tests, deploys, migrations, finalization.
    FullDeploy,
}

impl BuildMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildMode::TestOnly => "test-only",
            BuildMode::FullDeploy => "full-deploy",
        }
    }
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "test-only" => Ok(BuildMode::TestOnly),
            "full-deploy" => Ok(BuildMode::FullDeploy),
            other => Err(Error::input(format!("unknown build mode {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub timestamp: DateTime<Utc>,
    pub commit: String,
    pub mode: BuildMode,
    pub env: String,
}

impl BuildInfo {
    /// Stamp a new build with the current time. Test-only builds always
    /// target the `none` environment, whatever the caller passed.
    pub fn new(commit: impl Into<String>, mode: BuildMode, env: impl Into<String>) -> Self {
        let env = match mode {
            BuildMode::TestOnly => "none".to_string(),
            BuildMode::FullDeploy => env.into(),
        };
        Self {
            timestamp: Utc::now(),
            commit: commit.into(),
            mode,
            env,
        }
    }

    pub fn build_str(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.timestamp.format(STAMP_FORMAT),
            self.commit,
            self.mode,
            self.env
        )
    }

    pub fn parse(build_str: &str) -> Result<Self, Error> {
        let parts: Vec<&str> = build_str.split('.').collect();
        let [stamp, commit, mode, env] = parts.as_slice() else {
            return Err(Error::input(format!(
                "malformed build string {build_str:?}: expected STAMP.COMMIT.MODE.ENV"
            )));
        };

        let naive = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).map_err(|e| {
            Error::input(format!("bad timestamp in build string {build_str:?}: {e}"))
        })?;

        Ok(Self {
            timestamp: naive.and_utc(),
            commit: commit.to_string(),
            mode: mode.parse()?,
            env: env.to_string(),
        })
    }
}
