//! Before/after hook execution around steps, phases and publishes.
//!
//! Hooks are declared by the target scope (a unit root or the service root)
//! and run as external processes with an environment-variable overlay. A
//! scope with no matching hook is a no-op; a hook that fails fails the
//! enclosing step or phase.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use crate::errors::Error;

#[async_trait]
pub trait HookRunner: Send + Sync {
    async fn run_before(
        &self,
        scope: &Path,
        hook: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<(), Error>;

    async fn run_after(
        &self,
        scope: &Path,
        hook: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<(), Error>;
}

/// Hook runner that treats every scope as declaring no hooks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

#[async_trait]
impl HookRunner for NoopHooks {
    async fn run_before(
        &self,
        scope: &Path,
        hook: &str,
        _env: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        debug!(scope = %scope.display(), hook, "no before hook declared");
        Ok(())
    }

    async fn run_after(
        &self,
        scope: &Path,
        hook: &str,
        _env: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        debug!(scope = %scope.display(), hook, "no after hook declared");
        Ok(())
    }
}
