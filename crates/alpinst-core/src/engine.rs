use crate::concurrency::{CancelToken, InstallLock};
use crate::context::PlanContext;
use crate::progress::ProgressEvent;
use crate::sequencer::{RunOutcome, Sequencer};
use crate::step::{StepKind, ValidationError};
use crate::steps::default_steps;
use crate::{CoreError, RunError};
use alpinst_runtime::{
    CommandRunner, Environment, HostRunner, InstallerConfig, SystemEnvironment,
};
use alpinst_schema::InstallPlan;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use tracing::{debug, info};

/// Entry point shared by the batch and interactive front-ends.
///
/// Owns the installer configuration, the command runner and the environment.
/// `install` takes the install lock, gathers the plan context once and hands
/// the plan to a fresh `Sequencer`.
pub struct Engine {
    config: InstallerConfig,
    runner: Arc<dyn CommandRunner>,
    environment: Arc<dyn Environment>,
    cancel: CancelToken,
}

impl Engine {
    /// Real host: `HostRunner` and `SystemEnvironment`.
    pub fn new(config: InstallerConfig) -> Self {
        let environment = Arc::new(SystemEnvironment::new(&config));
        Self::with_parts(config, Arc::new(HostRunner::new()), environment)
    }

    pub fn with_parts(
        config: InstallerConfig,
        runner: Arc<dyn CommandRunner>,
        environment: Arc<dyn Environment>,
    ) -> Self {
        Self {
            config,
            runner,
            environment,
            cancel: CancelToken::new(),
        }
    }

    pub fn config(&self) -> &InstallerConfig {
        &self.config
    }

    /// Token checked by every run of this engine at step boundaries.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn gather_context(&self, plan: &InstallPlan) -> PlanContext {
        PlanContext::gather(plan, self.environment.as_ref(), &self.config.base_packages)
    }

    /// Runs every validator without touching the target. Returns the
    /// context used, so a caller can go on to `install` with the same facts.
    pub fn validate(&self, plan: &InstallPlan) -> Result<PlanContext, Vec<ValidationError>> {
        let ctx = self.gather_context(plan);
        let mut errors = Vec::new();
        for step in default_steps() {
            if let Err(e) = step.validate(plan, &ctx) {
                errors.extend(e);
            }
        }
        if errors.is_empty() {
            Ok(ctx)
        } else {
            Err(errors)
        }
    }

    /// One step's validator, for front-ends that check answers as they
    /// arrive.
    pub fn validate_step(
        &self,
        kind: StepKind,
        plan: &InstallPlan,
        ctx: &PlanContext,
    ) -> Result<(), Vec<ValidationError>> {
        default_steps()
            .into_iter()
            .find(|s| s.kind() == kind)
            .map_or(Ok(()), |s| s.validate(plan, ctx))
    }

    /// Validate and apply `plan`. Fails fast with `CoreError::Locked` when
    /// another installer owns the target.
    pub fn install(
        &self,
        plan: InstallPlan,
        progress: Option<Sender<ProgressEvent>>,
    ) -> Result<RunOutcome, RunError> {
        let lock_path = &self.config.lock_file;
        let _lock = InstallLock::try_acquire(lock_path)?
            .ok_or_else(|| CoreError::Locked(lock_path.display().to_string()))?;
        debug!("holding install lock {}", lock_path.display());

        let ctx = self.gather_context(&plan);
        info!(
            "installing to {} (host {} {}, target {})",
            self.config.staging_root.display(),
            ctx.host.arch,
            ctx.host.libc,
            plan.target_libc()
                .map_or_else(|| "unset".to_owned(), |v| v.to_string()),
        );
        Sequencer::new(self.runner.as_ref(), &self.config)
            .with_cancel(self.cancel.clone())
            .with_progress(progress)
            .run(plan, &ctx)
    }
}
