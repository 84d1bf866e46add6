//! Per-key units of work
//!
//! [`HealthCheckHandler`] mirrors a pod's Kubernetes readiness into a Consul
//! TTL check attached to the pod's service instance. It only ever touches the
//! check whose ID it derives from the key, so checks registered by anything
//! else on the same service instance are left alone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::config::ConsulConfig;
use crate::consul::{
    health_check_id, service_instance_id, types::HEALTH_CHECK_NOTES, types::PASSING_OUTPUT,
    AgentTarget, CheckRegistration, CheckStatus, CheckUpdate, MeshRegistry, HEALTH_CHECK_NAME,
};
use crate::error::Result;

use super::event_source::ObjectKey;
use super::namespace_filter::NamespaceFilter;
use super::naming::{DestinationName, NameTranslator};
use super::pods::{
    host_ip, pod_readiness, service_name_override, source_service_name, PodLookup, PodReadiness,
};

/// Processes one dequeued key.
///
/// An `Err` asks the controller to retry the key later; `Ok` completes it.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, key: &ObjectKey) -> Result<()>;
}

/// Status and output the owned check should carry
#[derive(Clone, Debug, PartialEq, Eq)]
struct DesiredCheck {
    status: CheckStatus,
    output: String,
}

impl DesiredCheck {
    fn from_readiness(key: &ObjectKey, readiness: PodReadiness) -> Self {
        match readiness {
            PodReadiness::Ready => Self {
                status: CheckStatus::Passing,
                output: PASSING_OUTPUT.to_string(),
            },
            PodReadiness::NotReady { detail: Some(detail) } => Self {
                status: CheckStatus::Critical,
                output: format!("Pod \"{key}\" is not ready: {detail}"),
            },
            PodReadiness::NotReady { detail: None } => Self {
                status: CheckStatus::Critical,
                output: format!("Pod \"{key}\" is not ready"),
            },
        }
    }
}

/// Syncs pod readiness transitions to Consul TTL checks
pub struct HealthCheckHandler {
    pods: Arc<dyn PodLookup>,
    registry: Arc<dyn MeshRegistry>,
    filter: NamespaceFilter,
    translator: NameTranslator,
    check_ttl: String,
    enable_namespaces: bool,
    /// Agent that holds each pod's check, needed once the pod is gone
    agents: Mutex<HashMap<ObjectKey, AgentTarget>>,
}

impl HealthCheckHandler {
    pub fn new(
        pods: Arc<dyn PodLookup>,
        registry: Arc<dyn MeshRegistry>,
        filter: NamespaceFilter,
        translator: NameTranslator,
        consul: &ConsulConfig,
    ) -> Self {
        Self {
            pods,
            registry,
            filter,
            translator,
            check_ttl: consul.check_ttl.clone(),
            enable_namespaces: consul.enable_namespaces,
            agents: Mutex::new(HashMap::new()),
        }
    }

    fn agents(&self) -> std::sync::MutexGuard<'_, HashMap<ObjectKey, AgentTarget>> {
        self.agents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consul namespace to address, when namespaces are enabled
    fn consul_namespace(&self, destination_namespace: &str) -> Option<String> {
        self.enable_namespaces
            .then(|| destination_namespace.to_string())
    }

    /// Remove the owned check of a pod that no longer exists
    ///
    /// The cached agent is dropped up front; a retry, or a handler that never
    /// saw the pod, finds the check's node through the registry instead.
    async fn remove_check(&self, key: &ObjectKey) -> Result<()> {
        let cached = self.agents().remove(key);
        let namespace =
            self.consul_namespace(&self.translator.destination_namespace(&key.namespace));
        let ns = namespace.as_deref();
        let check_id = health_check_id(&key.namespace, &key.name);

        let agent = match cached {
            Some(agent) => {
                let checks = self.registry.agent_checks(&agent, ns).await?;
                checks.contains_key(&check_id).then_some(agent)
            }
            None => self.registry.locate_check(&check_id, ns).await?,
        };

        match agent {
            Some(agent) => {
                self.registry.deregister_check(&agent, &check_id, ns).await?;
                info!(check_id = %check_id, "Deregistered health check for deleted pod");
            }
            None => debug!(check_id = %check_id, "Pod gone and no owned check registered"),
        }
        Ok(())
    }

    /// Make the owned check carry `desired`, writing only what differs
    async fn upsert_check(
        &self,
        key: &ObjectKey,
        agent: &AgentTarget,
        destination: &DestinationName,
        desired: DesiredCheck,
    ) -> Result<()> {
        let check_id = health_check_id(&key.namespace, &key.name);
        let service_id = service_instance_id(&key.name, &destination.name);
        let namespace = self.consul_namespace(&destination.namespace);
        let ns = namespace.as_deref();

        let checks = self.registry.agent_checks(agent, ns).await?;
        let existing = checks.get(&check_id);

        if let Some(existing) = existing {
            if existing.service_id == service_id {
                if existing.status == desired.status && existing.output == desired.output {
                    debug!(check_id = %check_id, status = %desired.status, "Health check unchanged");
                    return Ok(());
                }
                self.update(agent, &check_id, &desired, ns).await?;
                info!(
                    check_id = %check_id,
                    from = %existing.status,
                    to = %desired.status,
                    "Updated health check"
                );
                return Ok(());
            }

            // Destination name changed since the check was registered
            self.registry
                .deregister_check(agent, &check_id, ns)
                .await?;
            info!(
                check_id = %check_id,
                old_service_id = %existing.service_id,
                "Removed health check attached to a stale service instance"
            );
        }

        let registration = CheckRegistration {
            id: check_id.clone(),
            name: HEALTH_CHECK_NAME.to_string(),
            notes: HEALTH_CHECK_NOTES.to_string(),
            service_id: service_id.clone(),
            ttl: self.check_ttl.clone(),
            status: desired.status,
            namespace: namespace.clone(),
        };
        self.registry.register_ttl_check(agent, &registration).await?;
        self.update(agent, &check_id, &desired, ns).await?;
        info!(
            check_id = %check_id,
            service_id = %service_id,
            status = %desired.status,
            "Registered health check"
        );
        Ok(())
    }

    async fn update(
        &self,
        agent: &AgentTarget,
        check_id: &str,
        desired: &DesiredCheck,
        namespace: Option<&str>,
    ) -> Result<()> {
        let update = CheckUpdate {
            status: desired.status,
            output: desired.output.clone(),
        };
        self.registry
            .update_ttl_check(agent, check_id, &update, namespace)
            .await
    }
}

#[async_trait]
impl Handler for HealthCheckHandler {
    #[instrument(skip(self), fields(key = %key))]
    async fn handle(&self, key: &ObjectKey) -> Result<()> {
        let Some(pod) = self.pods.get_pod(key).await? else {
            return self.remove_check(key).await;
        };

        if !self.filter.allowed(&key.namespace) {
            debug!("Namespace not allowed for sync, skipping");
            return Ok(());
        }

        let Some(ip) = host_ip(&pod) else {
            debug!("Pod not scheduled yet, skipping");
            return Ok(());
        };
        let agent = AgentTarget::Host(ip.to_string());
        self.agents().insert(key.clone(), agent.clone());

        let desired = DesiredCheck::from_readiness(key, pod_readiness(&pod));
        let destination = self.translator.translate(
            &source_service_name(&pod),
            &key.namespace,
            service_name_override(&pod),
        );

        self.upsert_check(key, &agent, &destination, desired).await
    }
}
