//! Namespace eligibility for sync
//!
//! Precedence: the legacy single source namespace wins outright, then the
//! deny set, then the allow set (with `*` matching everything).

use crate::config::{NamespaceFilterConfig, NAMESPACE_WILDCARD};

#[derive(Clone, Debug, Default)]
pub struct NamespaceFilter {
    config: NamespaceFilterConfig,
}

impl NamespaceFilter {
    pub fn new(config: NamespaceFilterConfig) -> Self {
        Self { config }
    }

    /// Whether resources in `namespace` may be synced
    pub fn allowed(&self, namespace: &str) -> bool {
        if let Some(only) = self.config.single_namespace() {
            return namespace == only;
        }

        if self.config.deny.contains(namespace) {
            return false;
        }

        self.config.allow.contains(NAMESPACE_WILDCARD) || self.config.allow.contains(namespace)
    }
}
