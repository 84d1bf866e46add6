//! Pod state lookups and readiness helpers

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{api::Api, Client, ResourceExt};

use crate::error::Result;

use super::event_source::ObjectKey;

/// Annotation that names the Consul service explicitly
pub const SERVICE_NAME_ANNOTATION: &str = "consul.hashicorp.com/service-name";

/// Label used as the source service name when present
pub const APP_LABEL: &str = "app";

const CONDITION_TYPE_READY: &str = "Ready";
const CONDITION_STATUS_TRUE: &str = "True";

/// Current-state reads of pods
#[async_trait]
pub trait PodLookup: Send + Sync {
    /// The pod for `key`, or `None` if it no longer exists
    async fn get_pod(&self, key: &ObjectKey) -> Result<Option<Pod>>;
}

/// [`PodLookup`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubePods {
    client: Client,
}

impl KubePods {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodLookup for KubePods {
    async fn get_pod(&self, key: &ObjectKey) -> Result<Option<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &key.namespace);
        Ok(api.get_opt(&key.name).await?)
    }
}

/// Readiness as reported by the pod's `Ready` condition
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PodReadiness {
    Ready,
    NotReady { detail: Option<String> },
}

/// Read the `Ready` condition; a missing condition counts as not ready
pub fn pod_readiness(pod: &Pod) -> PodReadiness {
    let ready = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == CONDITION_TYPE_READY));

    match ready {
        Some(c) if c.status == CONDITION_STATUS_TRUE => PodReadiness::Ready,
        Some(c) => PodReadiness::NotReady {
            detail: c
                .message
                .clone()
                .filter(|m| !m.is_empty())
                .or_else(|| c.reason.clone().filter(|r| !r.is_empty())),
        },
        None => PodReadiness::NotReady { detail: None },
    }
}

/// Source name the destination service name is derived from
pub fn source_service_name(pod: &Pod) -> String {
    pod.labels()
        .get(APP_LABEL)
        .filter(|app| !app.is_empty())
        .cloned()
        .unwrap_or_else(|| pod.name_any())
}

/// Explicit service name set on the pod, if any
pub fn service_name_override(pod: &Pod) -> Option<&str> {
    pod.annotations()
        .get(SERVICE_NAME_ANNOTATION)
        .map(String::as_str)
}

/// IP of the node running the pod, once scheduled
pub fn host_ip(pod: &Pod) -> Option<&str> {
    pod.status
        .as_ref()
        .and_then(|s| s.host_ip.as_deref())
        .filter(|ip| !ip.is_empty())
}
