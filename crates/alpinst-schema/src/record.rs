//! Setup records: the plan an installation actually ran, plus run metadata.

use crate::plan::InstallPlan;
use crate::planfile::{PlanError, PlanFile};
use crate::types::PlanDigest;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

/// Immutable snapshot of a completed installation.
///
/// Rendered with the plan file schema plus `installed_at`,
/// `installer_version` and `plan_digest`, so it can be fed straight back to
/// [`crate::planfile::load`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupRecord {
    plan: InstallPlan,
    installed_at: DateTime<Utc>,
    installer_version: String,
    plan_digest: PlanDigest,
}

#[derive(Serialize)]
struct RecordFile<'a> {
    installed_at: String,
    installer_version: &'a str,
    plan_digest: &'a str,
    #[serde(flatten)]
    plan: PlanFile,
}

impl SetupRecord {
    pub fn new(plan: InstallPlan, installer_version: &str) -> Result<Self, PlanError> {
        Self::with_timestamp(plan, installer_version, Utc::now())
    }

    pub fn with_timestamp(
        plan: InstallPlan,
        installer_version: &str,
        installed_at: DateTime<Utc>,
    ) -> Result<Self, PlanError> {
        let plan_digest = plan_digest(&plan)?;
        Ok(Self {
            plan,
            installed_at,
            installer_version: installer_version.to_owned(),
            plan_digest,
        })
    }

    pub fn plan(&self) -> &InstallPlan {
        &self.plan
    }

    pub fn installed_at(&self) -> DateTime<Utc> {
        self.installed_at
    }

    pub fn installer_version(&self) -> &str {
        &self.installer_version
    }

    pub fn plan_digest(&self) -> &PlanDigest {
        &self.plan_digest
    }

    pub fn to_toml(&self) -> Result<String, PlanError> {
        let file = RecordFile {
            installed_at: self
                .installed_at
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            installer_version: &self.installer_version,
            plan_digest: self.plan_digest.as_str(),
            plan: PlanFile::from_plan(&self.plan)?,
        };
        Ok(toml::to_string(&file)?)
    }
}

/// blake3 of the plan's canonical JSON form. Equal plans give equal digests.
pub fn plan_digest(plan: &InstallPlan) -> Result<PlanDigest, PlanError> {
    let canonical = serde_json::to_string(&PlanFile::from_plan(plan)?)?;
    Ok(PlanDigest::new(
        blake3::hash(canonical.as_bytes()).to_hex().to_string(),
    ))
}
