//! Wire types for the Consul agent check API

use serde::{Deserialize, Serialize};

/// Check ID suffix that marks a check as owned by this operator
pub const HEALTH_CHECK_SUFFIX: &str = "kubernetes-health-check";

/// Display name of checks registered by this operator
pub const HEALTH_CHECK_NAME: &str = "Kubernetes Health Check";

/// Notes attached to registered checks
pub const HEALTH_CHECK_NOTES: &str =
    "Mirrors the Kubernetes readiness of the pod backing this service instance";

/// Output written while the pod is ready
pub const PASSING_OUTPUT: &str = "Kubernetes health checks passing";

/// Status of a Consul health check
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passing,
    Warning,
    Critical,
    /// Any status this operator never writes (e.g. maintenance)
    #[serde(other)]
    Unknown,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Passing => "passing",
            CheckStatus::Warning => "warning",
            CheckStatus::Critical => "critical",
            CheckStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A check as reported by `GET /v1/agent/checks`
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct AgentCheck {
    #[serde(rename = "CheckID")]
    pub check_id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Status")]
    pub status: CheckStatus,
    #[serde(rename = "Output", default)]
    pub output: String,
    #[serde(rename = "ServiceID", default)]
    pub service_id: String,
    #[serde(rename = "ServiceName", default)]
    pub service_name: String,
}

/// Body of `PUT /v1/agent/check/register`
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CheckRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Notes")]
    pub notes: String,
    #[serde(rename = "ServiceID")]
    pub service_id: String,
    #[serde(rename = "TTL")]
    pub ttl: String,
    #[serde(rename = "Status")]
    pub status: CheckStatus,
    #[serde(rename = "Namespace", skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Body of `PUT /v1/agent/check/update/:check_id`
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CheckUpdate {
    #[serde(rename = "Status")]
    pub status: CheckStatus,
    #[serde(rename = "Output")]
    pub output: String,
}

/// One entry of `GET /v1/health/state/:state`
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct HealthCheckEntry {
    #[serde(rename = "Node")]
    pub node: String,
    #[serde(rename = "CheckID")]
    pub check_id: String,
}

/// Body of `GET /v1/catalog/node/:node`; Consul answers `null` for unknown nodes
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct CatalogNode {
    #[serde(rename = "Node")]
    pub node: NodeInfo,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct NodeInfo {
    #[serde(rename = "Node")]
    pub name: String,
    #[serde(rename = "Address")]
    pub address: String,
}

/// Which Consul agent a request is sent to
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AgentTarget {
    /// The configured base address
    Default,
    /// The node-local agent on a pod's host IP
    Host(String),
}

/// ID of the TTL check owned by this operator for a pod
pub fn health_check_id(namespace: &str, pod_name: &str) -> String {
    format!("{namespace}/{pod_name}/{HEALTH_CHECK_SUFFIX}")
}

/// ID of the service instance registered for a pod
pub fn service_instance_id(pod_name: &str, service_name: &str) -> String {
    format!("{pod_name}-{service_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_check_id_format() {
        assert_eq!(
            health_check_id("default", "web-1"),
            "default/web-1/kubernetes-health-check"
        );
    }

    #[test]
    fn test_agent_check_deserializes_foreign_status() {
        let check: AgentCheck = serde_json::from_value(serde_json::json!({
            "Node": "node-1",
            "CheckID": "service:web-1-web",
            "Name": "Service check",
            "Status": "maintenance",
            "ServiceID": "web-1-web"
        }))
        .unwrap();

        assert_eq!(check.status, CheckStatus::Unknown);
        assert_eq!(check.output, "");
    }

    #[test]
    fn test_catalog_node_null_means_unknown() {
        let node: Option<CatalogNode> = serde_json::from_str("null").unwrap();
        assert!(node.is_none());

        let node: Option<CatalogNode> = serde_json::from_value(serde_json::json!({
            "Node": {"ID": "1b2c", "Node": "node-1", "Address": "10.0.0.5"},
            "Services": {}
        }))
        .unwrap();
        assert_eq!(node.unwrap().node.address, "10.0.0.5");
    }

    #[test]
    fn test_registration_omits_namespace_when_unset() {
        let registration = CheckRegistration {
            id: health_check_id("default", "web-1"),
            name: HEALTH_CHECK_NAME.to_string(),
            notes: HEALTH_CHECK_NOTES.to_string(),
            service_id: service_instance_id("web-1", "web"),
            ttl: "100000h".to_string(),
            status: CheckStatus::Critical,
            namespace: None,
        };
        let value = serde_json::to_value(&registration).unwrap();
        assert_eq!(value["Status"], "critical");
        assert_eq!(value["ServiceID"], "web-1-web");
        assert!(value.get("Namespace").is_none());
    }
}
