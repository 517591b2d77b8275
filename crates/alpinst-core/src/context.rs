//! Environment facts gathered once, before validation, so that every
//! validator stays a pure function of the plan and this context.

use alpinst_runtime::{Environment, HostFacts, KeyInventory, MirrorQuery, MirrorStatus};
use alpinst_schema::InstallPlan;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize)]
pub struct PlanContext {
    pub host: HostFacts,
    pub keys: KeyInventory,
    /// Index status per repository URL named by the plan.
    pub mirrors: BTreeMap<String, MirrorStatus>,
    /// Packages installed on every target.
    pub base_packages: Vec<String>,
}

impl PlanContext {
    pub fn gather(
        plan: &InstallPlan,
        environment: &dyn Environment,
        base_packages: &[String],
    ) -> Self {
        let host = environment.host();
        let keys = environment.keys().unwrap_or_else(|e| {
            warn!("cannot read signing keys: {e}");
            KeyInventory::new()
        });
        let proxy = plan.network().and_then(|n| n.proxy.as_deref());
        let mut mirrors = BTreeMap::new();
        if let Some(mirror) = plan.mirror() {
            let query = MirrorQuery::new(&host.arch)
                .proxy(proxy)
                .key_set(Some(mirror.key_set));
            for repo in mirror.repositories() {
                if !mirrors.contains_key(repo) {
                    debug!("fetching index of repository {repo}");
                    mirrors.insert(repo.to_owned(), environment.mirror(repo, query));
                }
            }
        }
        Self {
            host,
            keys,
            mirrors,
            base_packages: base_packages.to_vec(),
        }
    }

    pub fn mirror_status(&self, url: &str) -> Option<&MirrorStatus> {
        self.mirrors.get(url)
    }

    /// Whether any reachable repository index is available.
    pub fn has_index(&self) -> bool {
        self.mirrors.values().any(|m| m.index().is_some())
    }

    /// Whether a package name resolves in any reachable repository.
    pub fn provides(&self, name: &str) -> bool {
        self.mirrors
            .values()
            .filter_map(MirrorStatus::index)
            .any(|i| i.provides(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alpinst_runtime::{MirrorIndex, StaticEnvironment};
    use alpinst_schema::{LibcVariant, MirrorSelection};

    #[test]
    fn fetches_each_repository_once() {
        let mut plan = InstallPlan::new();
        plan.set_mirror(MirrorSelection {
            url: "https://m/main".to_owned(),
            key_set: LibcVariant::Musl,
            extra_repositories: vec!["https://m/main".to_owned(), "https://m/community".to_owned()],
        });
        let index = MirrorIndex {
            packages: ["openssh".to_owned()].into_iter().collect(),
            signer: None,
            ..MirrorIndex::default()
        };
        let environment = StaticEnvironment::new(LibcVariant::Musl)
            .with_mirror("https://m/main", MirrorStatus::Reachable { index });
        let ctx = PlanContext::gather(&plan, &environment, &[]);

        assert_eq!(ctx.mirrors.len(), 2);
        assert!(ctx.has_index());
        assert!(ctx.provides("openssh"));
        assert!(!ctx.provides("vim"));
        assert!(ctx.mirror_status("https://m/community").unwrap().index().is_none());
    }
}
