//! Mirror and signing keys.
//!
//! Trust is decided by the target's C library alone: the key set named by
//! the mirror must be the target's, its keys must be on the medium, and
//! every repository index must carry a signature that verifies with one of
//! them. Any mismatch is an integrity error and the run never reaches the
//! package step.

use crate::context::PlanContext;
use crate::step::{ApplyScope, ExecutionError, Findings, StepController, StepKind, ValidationError};
use alpinst_runtime::{apk, keys, mirror, MirrorStatus, SignatureCheck};
use alpinst_schema::InstallPlan;
use tracing::info;

pub struct MirrorStep;

impl StepController for MirrorStep {
    fn kind(&self) -> StepKind {
        StepKind::Mirror
    }

    fn validate(&self, plan: &InstallPlan, ctx: &PlanContext) -> Result<(), Vec<ValidationError>> {
        let mut f = Findings::new(StepKind::Mirror);
        let Some(sel) = plan.mirror() else {
            f.constraint("mirror", "not answered");
            return f.finish();
        };

        let fields = std::iter::once("url".to_owned())
            .chain((0..sel.extra_repositories.len()).map(|i| format!("extra_repositories[{i}]")));
        let mut reachable = Vec::new();
        for (field, url) in fields.zip(sel.repositories()) {
            if !mirror::is_valid_repository(url) {
                f.constraint(field, format!("'{url}' is not an http(s) URL or absolute path"));
                continue;
            }
            match ctx.mirror_status(url) {
                Some(MirrorStatus::Reachable { index }) => reachable.push((field, url, index)),
                Some(MirrorStatus::Unreachable { reason }) => {
                    f.constraint(field, format!("{url} is unreachable: {reason}"));
                }
                None => f.constraint(field, format!("{url} was not fetched")),
            }
        }

        if let Some(target) = plan.target_libc() {
            if sel.key_set != target {
                f.integrity(
                    "key_set",
                    format!("key set {} does not match the {target} target", sel.key_set),
                );
                return f.finish();
            }
        }

        if ctx.keys.keys(sel.key_set).is_empty() {
            f.integrity("key_set", format!("no {} signing keys on this medium", sel.key_set));
            return f.finish();
        }
        for (field, url, index) in reachable {
            match &index.signer {
                None => f.integrity(field, format!("index of {url} is not signed")),
                Some(signer) if !ctx.keys.has_key(sel.key_set, signer) => f.integrity(
                    field,
                    format!("index of {url} is signed by {signer}, not a {} key", sel.key_set),
                ),
                Some(signer) => match &index.signature {
                    SignatureCheck::Verified => {}
                    SignatureCheck::Invalid { reason } => f.integrity(
                        field,
                        format!("signature of index of {url} by {signer} does not verify: {reason}"),
                    ),
                    SignatureCheck::Unchecked => f.integrity(
                        field,
                        format!("signature of index of {url} by {signer} was not checked"),
                    ),
                },
            }
        }
        f.finish()
    }

    fn apply(&mut self, plan: &InstallPlan, scope: &ApplyScope<'_>) -> Result<(), ExecutionError> {
        let fail = |e| ExecutionError::new(StepKind::Mirror, e);
        let sel = plan
            .mirror()
            .ok_or_else(|| ExecutionError::not_answered(StepKind::Mirror))?;
        let target = plan
            .target_libc()
            .ok_or_else(|| ExecutionError::not_answered(StepKind::Packages))?;
        let installed =
            keys::install_keys(&scope.config.keys_dir, target, scope.staging).map_err(fail)?;
        info!("trusting {} {target} key(s) for {}", installed.len(), sel.url);
        apk::write_repositories(scope.staging, sel).map_err(fail)
    }
}
