//! TOML plan files.
//!
//! A plan file carries `version` plus one section per sub-record. Loading is
//! strict: unknown top-level keys, missing required sections, unsupported
//! versions and unknown fields inside a section are all errors, reported
//! before any step looks at the plan. The metadata keys of a setup record are
//! accepted and ignored, so a record loads as the plan it was made from.

use crate::plan::{
    BootloaderConfig, Disk, InstallPlan, KeyboardLayout, MirrorSelection, NetworkConfig,
    PackageSelection, Section, UserAccount,
};
use crate::record::SetupRecord;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const PLAN_VERSION: i64 = 1;

/// Keys written by [`crate::record::SetupRecord`] and ignored by [`load`].
pub const METADATA_KEYS: &[&str] = &["installed_at", "installer_version", "plan_digest"];

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("failed to read plan file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse plan: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize plan: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("failed to encode plan: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("plan error: unknown top-level key '{0}'")]
    UnknownKey(String),
    #[error("plan error: missing required section '{0}'")]
    MissingSection(String),
    #[error("plan error: unsupported plan version {0}, expected {PLAN_VERSION}")]
    UnsupportedVersion(String),
}

/// On-disk shape of a complete plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub(crate) struct PlanFile {
    pub(crate) version: i64,
    pub(crate) keyboard: KeyboardLayout,
    pub(crate) network: NetworkConfig,
    pub(crate) mirror: MirrorSelection,
    pub(crate) packages: PackageSelection,
    pub(crate) bootloader: BootloaderConfig,
    pub(crate) disks: Vec<Disk>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) users: Vec<UserAccount>,
}

impl PlanFile {
    pub(crate) fn from_plan(plan: &InstallPlan) -> Result<Self, PlanError> {
        fn require<T: Clone>(value: Option<&T>, section: Section) -> Result<T, PlanError> {
            value
                .cloned()
                .ok_or_else(|| PlanError::MissingSection(section.key().to_owned()))
        }

        Ok(Self {
            version: PLAN_VERSION,
            keyboard: require(plan.keyboard(), Section::Keyboard)?,
            network: require(plan.network(), Section::Network)?,
            mirror: require(plan.mirror(), Section::Mirror)?,
            packages: require(plan.packages(), Section::Packages)?,
            bootloader: require(plan.bootloader(), Section::Bootloader)?,
            disks: plan
                .disks()
                .map(<[Disk]>::to_vec)
                .ok_or_else(|| PlanError::MissingSection(Section::Disks.key().to_owned()))?,
            users: plan.users().map(<[UserAccount]>::to_vec).unwrap_or_default(),
        })
    }

    fn into_plan(self) -> InstallPlan {
        let mut plan = InstallPlan::new();
        plan.set_keyboard(self.keyboard);
        plan.set_network(self.network);
        plan.set_disks(self.disks);
        plan.set_mirror(self.mirror);
        plan.set_packages(self.packages);
        plan.set_bootloader(self.bootloader);
        plan.set_users(self.users);
        plan
    }
}

fn check_structure(table: &toml::Table) -> Result<(), PlanError> {
    for key in table.keys() {
        let known = key == "version"
            || METADATA_KEYS.contains(&key.as_str())
            || Section::ALL.iter().any(|s| s.key() == key);
        if !known {
            return Err(PlanError::UnknownKey(key.clone()));
        }
    }

    match table.get("version") {
        None => return Err(PlanError::MissingSection("version".to_owned())),
        Some(toml::Value::Integer(PLAN_VERSION)) => {}
        Some(other) => return Err(PlanError::UnsupportedVersion(other.to_string())),
    }

    for section in Section::ALL {
        if section.required() && !table.contains_key(section.key()) {
            return Err(PlanError::MissingSection(section.key().to_owned()));
        }
    }
    Ok(())
}

/// Parse a plan file.
pub fn load(input: &str) -> Result<InstallPlan, PlanError> {
    let mut table: toml::Table = input.parse()?;
    check_structure(&table)?;
    for key in METADATA_KEYS {
        table.remove(*key);
    }
    let file: PlanFile = toml::Value::Table(table).try_into()?;
    Ok(file.into_plan())
}

pub fn load_file(path: impl AsRef<Path>) -> Result<InstallPlan, PlanError> {
    let content = fs::read_to_string(path)?;
    load(&content)
}

/// Render a plan as a plan file. Every section except `users` must be set.
pub fn dump(plan: &InstallPlan) -> Result<String, PlanError> {
    let file = PlanFile::from_plan(plan)?;
    Ok(toml::to_string(&file)?)
}

/// Render a setup record: the plan file schema plus run metadata.
pub fn dump_record(record: &SetupRecord) -> Result<String, PlanError> {
    record.to_toml()
}
