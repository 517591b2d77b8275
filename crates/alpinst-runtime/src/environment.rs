//! Read-only questions about the environment, asked once before validation.

use crate::config::InstallerConfig;
use crate::host::HostFacts;
use crate::keys::KeyInventory;
use crate::mirror::{IndexFetcher, MirrorStatus};
use crate::RuntimeError;
use alpinst_schema::LibcVariant;
use std::path::PathBuf;

/// What to fetch a repository index for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MirrorQuery<'a> {
    pub arch: &'a str,
    /// HTTP requests go through this proxy when set.
    pub proxy: Option<&'a str>,
    /// Key set the index signature is checked against.
    pub key_set: Option<LibcVariant>,
}

impl<'a> MirrorQuery<'a> {
    pub fn new(arch: &'a str) -> Self {
        Self {
            arch,
            proxy: None,
            key_set: None,
        }
    }

    pub fn proxy(mut self, proxy: Option<&'a str>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn key_set(mut self, variant: Option<LibcVariant>) -> Self {
        self.key_set = variant;
        self
    }
}

pub trait Environment: Send + Sync {
    fn host(&self) -> HostFacts;
    fn keys(&self) -> Result<KeyInventory, RuntimeError>;
    /// Never fails: an unusable repository is a status, not an error.
    fn mirror(&self, url: &str, query: MirrorQuery<'_>) -> MirrorStatus;
}

/// Queries the real host, key directory and network.
pub struct SystemEnvironment {
    keys_dir: PathBuf,
    arch: Option<String>,
    fetcher: IndexFetcher,
}

impl SystemEnvironment {
    pub fn new(config: &InstallerConfig) -> Self {
        Self {
            keys_dir: config.keys_dir.clone(),
            arch: config.arch.clone(),
            fetcher: IndexFetcher::new(),
        }
    }
}

impl Environment for SystemEnvironment {
    fn host(&self) -> HostFacts {
        HostFacts::detect(self.arch.as_deref())
    }

    fn keys(&self) -> Result<KeyInventory, RuntimeError> {
        KeyInventory::scan(&self.keys_dir)
    }

    fn mirror(&self, url: &str, query: MirrorQuery<'_>) -> MirrorStatus {
        let key_dir = query.key_set.map(|v| self.keys_dir.join(v.as_str()));
        let Some(proxy) = query.proxy else {
            return self.fetcher.inspect(url, query.arch, key_dir.as_deref());
        };
        match IndexFetcher::with_proxy(proxy) {
            Ok(fetcher) => fetcher.inspect(url, query.arch, key_dir.as_deref()),
            Err(e) => MirrorStatus::Unreachable {
                reason: e.to_string(),
            },
        }
    }
}
