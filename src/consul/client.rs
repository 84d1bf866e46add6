//! Consul agent HTTP client
//!
//! Implements [`MeshRegistry`] on top of the agent check endpoints. Each call
//! is addressed to an [`AgentTarget`] so that checks land on the agent that
//! holds the pod's service registration.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, Url};
use tracing::{debug, instrument};

use crate::config::ConsulConfig;
use crate::error::{Error, Result};

use super::types::{
    AgentCheck, AgentTarget, CatalogNode, CheckRegistration, CheckUpdate, HealthCheckEntry,
};

const TOKEN_HEADER: &str = "X-Consul-Token";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Read and write access to health checks in the mesh registry
#[async_trait]
pub trait MeshRegistry: Send + Sync {
    /// All checks known to an agent, keyed by check ID
    async fn agent_checks(
        &self,
        agent: &AgentTarget,
        namespace: Option<&str>,
    ) -> Result<HashMap<String, AgentCheck>>;

    /// Register a TTL check against an existing service instance
    async fn register_ttl_check(
        &self,
        agent: &AgentTarget,
        registration: &CheckRegistration,
    ) -> Result<()>;

    /// Set the status and output of a TTL check
    async fn update_ttl_check(
        &self,
        agent: &AgentTarget,
        check_id: &str,
        update: &CheckUpdate,
        namespace: Option<&str>,
    ) -> Result<()>;

    /// Remove a check by ID
    async fn deregister_check(
        &self,
        agent: &AgentTarget,
        check_id: &str,
        namespace: Option<&str>,
    ) -> Result<()>;

    /// Agent of the node that holds `check_id`, found through the catalog
    async fn locate_check(
        &self,
        check_id: &str,
        namespace: Option<&str>,
    ) -> Result<Option<AgentTarget>>;

    /// Address of the current Raft leader; fails when there is none
    async fn leader(&self) -> Result<String>;
}

/// reqwest-backed [`MeshRegistry`]
#[derive(Clone, Debug)]
pub struct ConsulClient {
    http: Client,
    base: Url,
    agent_port: u16,
    use_host_agent: bool,
    token: Option<String>,
}

impl ConsulClient {
    pub fn new(config: &ConsulConfig) -> Result<Self> {
        let base = Url::parse(&config.http_addr).map_err(|e| {
            Error::ConfigError(format!("invalid Consul address {}: {}", config.http_addr, e))
        })?;

        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("health-sync-operator/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(Error::HttpError)?;

        Ok(Self {
            http,
            base,
            agent_port: config.agent_port,
            use_host_agent: config.use_host_agent,
            token: config.token.clone(),
        })
    }

    /// Resolve the URL for `path` on the given agent
    fn agent_url(&self, agent: &AgentTarget, path: &str) -> Result<Url> {
        let mut url = self.base.clone();
        if let (true, AgentTarget::Host(host)) = (self.use_host_agent, agent) {
            url.set_host(Some(host))
                .map_err(|e| Error::ConfigError(format!("invalid agent host {host}: {e}")))?;
            url.set_port(Some(self.agent_port))
                .map_err(|_| Error::ConfigError(format!("cannot set port on {url}")))?;
        }
        url.set_path(path);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url, namespace: Option<&str>) -> RequestBuilder {
        let mut builder = self.http.request(method, url);
        if let Some(token) = &self.token {
            builder = builder.header(TOKEN_HEADER, token);
        }
        if let Some(ns) = namespace {
            builder = builder.query(&[("ns", ns)]);
        }
        builder
    }
}

/// Turn non-2xx answers into [`Error::ConsulError`]
async fn check_response(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(Error::ConsulError {
        status: status.as_u16(),
        message: message.trim().to_string(),
    })
}

#[async_trait]
impl MeshRegistry for ConsulClient {
    #[instrument(skip(self))]
    async fn agent_checks(
        &self,
        agent: &AgentTarget,
        namespace: Option<&str>,
    ) -> Result<HashMap<String, AgentCheck>> {
        let url = self.agent_url(agent, "/v1/agent/checks")?;
        let resp = self.request(Method::GET, url, namespace).send().await?;
        let checks = check_response(resp)
            .await?
            .json::<HashMap<String, AgentCheck>>()
            .await?;
        debug!(count = checks.len(), "Fetched agent checks");
        Ok(checks)
    }

    #[instrument(skip(self, registration), fields(check_id = %registration.id))]
    async fn register_ttl_check(
        &self,
        agent: &AgentTarget,
        registration: &CheckRegistration,
    ) -> Result<()> {
        let url = self.agent_url(agent, "/v1/agent/check/register")?;
        let resp = self
            .request(Method::PUT, url, registration.namespace.as_deref())
            .json(registration)
            .send()
            .await?;
        check_response(resp).await?;
        Ok(())
    }

    #[instrument(skip(self, update), fields(status = %update.status))]
    async fn update_ttl_check(
        &self,
        agent: &AgentTarget,
        check_id: &str,
        update: &CheckUpdate,
        namespace: Option<&str>,
    ) -> Result<()> {
        let url = self.agent_url(agent, &format!("/v1/agent/check/update/{check_id}"))?;
        let resp = self
            .request(Method::PUT, url, namespace)
            .json(update)
            .send()
            .await?;
        check_response(resp).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn deregister_check(
        &self,
        agent: &AgentTarget,
        check_id: &str,
        namespace: Option<&str>,
    ) -> Result<()> {
        let url = self.agent_url(agent, &format!("/v1/agent/check/deregister/{check_id}"))?;
        let resp = self.request(Method::PUT, url, namespace).send().await?;
        check_response(resp).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn locate_check(
        &self,
        check_id: &str,
        namespace: Option<&str>,
    ) -> Result<Option<AgentTarget>> {
        let url = self.agent_url(&AgentTarget::Default, "/v1/health/state/any")?;
        let resp = self
            .request(Method::GET, url, namespace)
            .query(&[("filter", format!("CheckID == \"{check_id}\""))])
            .send()
            .await?;
        let entries = check_response(resp)
            .await?
            .json::<Vec<HealthCheckEntry>>()
            .await?;
        let Some(entry) = entries.into_iter().find(|e| e.check_id == check_id) else {
            return Ok(None);
        };

        let url = self.agent_url(
            &AgentTarget::Default,
            &format!("/v1/catalog/node/{}", entry.node),
        )?;
        let resp = self.request(Method::GET, url, namespace).send().await?;
        let node = check_response(resp)
            .await?
            .json::<Option<CatalogNode>>()
            .await?;
        debug!(node = %entry.node, found = node.is_some(), "Located check in catalog");
        Ok(node.map(|n| AgentTarget::Host(n.node.address)))
    }

    async fn leader(&self) -> Result<String> {
        let url = self.agent_url(&AgentTarget::Default, "/v1/status/leader")?;
        let resp = self.request(Method::GET, url, None).send().await?;
        let leader = check_response(resp).await?.json::<String>().await?;
        if leader.is_empty() {
            return Err(Error::ConsulError {
                status: 503,
                message: "no cluster leader".to_string(),
            });
        }
        Ok(leader)
    }
}
