use crate::context::PlanContext;
use crate::step::{ApplyScope, ExecutionError, Findings, StepController, StepKind, ValidationError};
use crate::steps::{implied_packages, package_list};
use alpinst_runtime::apk;
use alpinst_schema::InstallPlan;
use std::collections::HashSet;

pub struct PackagesStep;

impl StepController for PackagesStep {
    fn kind(&self) -> StepKind {
        StepKind::Packages
    }

    fn validate(&self, plan: &InstallPlan, ctx: &PlanContext) -> Result<(), Vec<ValidationError>> {
        let mut f = Findings::new(StepKind::Packages);
        let Some(sel) = plan.packages() else {
            f.constraint("packages", "not answered");
            return f.finish();
        };

        let mut seen = HashSet::new();
        for (i, name) in sel.names.iter().enumerate() {
            let field = format!("names[{i}]");
            if name.as_str().is_empty() {
                f.constraint(field, "empty");
            } else if !name.is_well_formed() {
                f.constraint(field, format!("'{name}' is not a valid package name"));
            } else if !seen.insert(name.as_str()) {
                f.constraint(field, format!("'{name}' listed twice"));
            }
        }

        // Unreachable mirrors are reported by the mirror step; resolving
        // against nothing would only repeat that for every package.
        if ctx.has_index() {
            let implied = implied_packages(plan);
            for name in package_list(plan, &ctx.base_packages) {
                if ctx.provides(&name) {
                    continue;
                }
                let origin = if ctx.base_packages.contains(&name) {
                    "base package"
                } else if implied.contains(&name.as_str()) {
                    "implied package"
                } else {
                    "package"
                };
                f.constraint("names", format!("{origin} '{name}' is not in the repository index"));
            }
        }
        f.finish()
    }

    fn apply(&mut self, plan: &InstallPlan, scope: &ApplyScope<'_>) -> Result<(), ExecutionError> {
        let fail = |e| ExecutionError::new(StepKind::Packages, e);
        let target = plan
            .target_libc()
            .ok_or_else(|| ExecutionError::not_answered(StepKind::Packages))?;
        let list = package_list(plan, &scope.config.base_packages);
        let proxy = plan.network().and_then(|n| n.proxy.as_deref());
        apk::install(scope.session, scope.config, target, scope.staging, &list, proxy)
            .map_err(fail)
    }
}
