//! Immutable configuration handed to the sync components
//!
//! The binary parses flags once and builds a [`SyncConfig`]; every component
//! receives the slice it needs through its constructor and never reads
//! process-wide state afterwards.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::{Error, Result};

/// Allow-list entry that matches every namespace
pub const NAMESPACE_WILDCARD: &str = "*";

/// Default label selector for pods managed by the connect injector
pub const DEFAULT_POD_LABEL_SELECTOR: &str = "consul.hashicorp.com/connect-inject-status=injected";

/// Which source namespaces are eligible for sync
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NamespaceFilterConfig {
    /// Legacy single-namespace override; empty means unset
    pub source_namespace: String,
    pub allow: BTreeSet<String>,
    pub deny: BTreeSet<String>,
}

impl NamespaceFilterConfig {
    /// Build from flag values. When the legacy override is set the lists are dropped.
    pub fn new<A, D>(source_namespace: impl Into<String>, allow: A, deny: D) -> Self
    where
        A: IntoIterator<Item = String>,
        D: IntoIterator<Item = String>,
    {
        let source_namespace = source_namespace.into();
        if !source_namespace.is_empty() {
            return Self {
                source_namespace,
                allow: BTreeSet::new(),
                deny: BTreeSet::new(),
            };
        }
        Self {
            source_namespace,
            allow: allow.into_iter().collect(),
            deny: deny.into_iter().collect(),
        }
    }

    /// Namespace the event source can be scoped to, if any
    pub fn single_namespace(&self) -> Option<&str> {
        (!self.source_namespace.is_empty()).then_some(self.source_namespace.as_str())
    }
}

/// Destination naming policy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamingConfig {
    pub service_prefix: String,
    pub add_namespace_suffix: bool,
    /// Destination namespace in non-mirrored mode
    pub write_namespace: String,
    pub enable_namespace_mirroring: bool,
    pub mirroring_prefix: String,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            service_prefix: String::new(),
            add_namespace_suffix: false,
            write_namespace: "default".to_string(),
            enable_namespace_mirroring: false,
            mirroring_prefix: String::new(),
        }
    }
}

/// Work queue retry and concurrency settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueConfig {
    pub max_retries: u32,
    pub workers: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            workers: 2,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
        }
    }
}

/// How to reach the Consul agents
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsulConfig {
    /// Base URL used when no host agent applies
    pub http_addr: String,
    /// Port of the node-local agent reached through the pod host IP
    pub agent_port: u16,
    pub use_host_agent: bool,
    pub token: Option<String>,
    /// Pass the destination namespace to Consul (Enterprise namespaces)
    pub enable_namespaces: bool,
    /// TTL written on checks this operator registers
    pub check_ttl: String,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            http_addr: "http://127.0.0.1:8500".to_string(),
            agent_port: 8500,
            use_host_agent: true,
            token: None,
            enable_namespaces: false,
            check_ttl: "100000h".to_string(),
        }
    }
}

/// Complete operator configuration
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncConfig {
    pub namespaces: NamespaceFilterConfig,
    pub naming: NamingConfig,
    pub queue: QueueConfig,
    pub consul: ConsulConfig,
    pub pod_label_selector: Option<String>,
}

impl SyncConfig {
    /// Reject configurations the components cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.queue.workers == 0 {
            return Err(Error::ConfigError(
                "at least one worker is required".to_string(),
            ));
        }
        if self.queue.backoff_base > self.queue.backoff_max {
            return Err(Error::ConfigError(format!(
                "backoff base {:?} exceeds backoff max {:?}",
                self.queue.backoff_base, self.queue.backoff_max
            )));
        }
        reqwest::Url::parse(&self.consul.http_addr).map_err(|e| {
            Error::ConfigError(format!(
                "invalid Consul address {}: {}",
                self.consul.http_addr, e
            ))
        })?;
        if self.consul.check_ttl.is_empty() {
            return Err(Error::ConfigError("check TTL must not be empty".to_string()));
        }
        Ok(())
    }
}
