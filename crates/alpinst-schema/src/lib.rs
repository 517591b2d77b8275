//! Install plan model, plan files, and setup records for alpinst.
//!
//! This crate defines the data layer: the `InstallPlan` aggregate with one
//! sub-record per installation domain, the strict TOML plan file format
//! (`planfile::load` / `planfile::dump`), setup records written after a
//! completed install, and the built-in plan templates.

pub mod plan;
pub mod planfile;
pub mod preset;
pub mod record;
pub mod size;
pub mod types;
pub mod variant;

pub use plan::{
    AddressMethod, BootloaderConfig, Disk, Encryption, Filesystem, Firmware, FsType, InstallPlan,
    Interface, KeyboardLayout, LogicalVolume, MirrorSelection, NetworkConfig, PackageSelection,
    Partition, PartitionFlag, PlanSlice, Section, UserAccount, VolumeGroup,
};
pub use planfile::{dump, dump_record, load, load_file, PlanError, METADATA_KEYS, PLAN_VERSION};
pub use preset::{get_template, list_templates, PlanTemplate, BUILTIN_TEMPLATES};
pub use record::{plan_digest, SetupRecord};
pub use size::{ByteSize, GIB, KIB, MIB, TIB};
pub use types::{PackageName, PartitionId, PlanDigest};
pub use variant::LibcVariant;
