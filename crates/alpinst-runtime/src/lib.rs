//! System-facing half of the alpinst installer.
//!
//! This crate implements everything that touches the machine: a
//! `CommandRunner` abstraction with per-step deadlines (`HostRunner` for real
//! runs, `RecordingRunner` for tests and dry runs), the staging root under
//! which the target is assembled, partitioning and formatting, signing key
//! management by target C library, `apk` invocation, mirror index fetching,
//! bootloader installation, account creation, target configuration files,
//! installer configuration, and host prerequisite checks.

pub mod accounts;
pub mod apk;
pub mod bootloader;
pub mod command;
pub mod config;
pub mod disk;
pub mod environment;
pub mod host;
pub mod keys;
pub mod mirror;
pub mod mock;
pub mod prereq;
pub mod staging;
pub mod target_config;

pub use command::{CommandOutput, CommandRunner, HostRunner, Invocation, Session};
pub use config::InstallerConfig;
pub use environment::{Environment, MirrorQuery, SystemEnvironment};
pub use host::HostFacts;
pub use keys::KeyInventory;
pub use mirror::{MirrorIndex, MirrorStatus, SignatureCheck};
pub use mock::{RecordingRunner, StaticEnvironment};
pub use prereq::{check_install_prereqs, check_layer_prereqs, format_missing, MissingPrereq};
pub use staging::StagingRoot;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("'{program}' exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("'{program}' exceeded the step timeout of {secs}s")]
    Timeout { program: String, secs: u64 },
    #[error("unexpected output from '{program}': {detail}")]
    UnexpectedOutput { program: String, detail: String },
    #[error("device {device} holds {actual} bytes, less than the declared {declared}")]
    DeviceTooSmall {
        device: String,
        declared: u64,
        actual: u64,
    },
    #[error("device node {0} did not appear")]
    DeviceMissing(String),
    #[error("no {variant} signing keys in {dir}")]
    KeysMissing { variant: String, dir: String },
    #[error("invalid signing key {0}: not a PEM public key")]
    InvalidKey(String),
    #[error("mirror error: {0}")]
    Mirror(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("path escapes the staging root: {0}")]
    PathEscape(String),
}
