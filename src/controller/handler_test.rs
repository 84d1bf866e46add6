//! Tests for the health-check sync handler

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus};
    use kube::api::ObjectMeta;

    use crate::config::{ConsulConfig, NamespaceFilterConfig, NamingConfig};
    use crate::consul::{
        health_check_id, AgentCheck, AgentTarget, CheckRegistration, CheckStatus, CheckUpdate,
        MeshRegistry,
    };
    use crate::controller::event_source::ObjectKey;
    use crate::controller::handler::{Handler, HealthCheckHandler};
    use crate::controller::namespace_filter::NamespaceFilter;
    use crate::controller::naming::NameTranslator;
    use crate::controller::pods::{PodLookup, SERVICE_NAME_ANNOTATION};
    use crate::error::{Error, Result};

    #[derive(Default)]
    struct FakePods {
        pods: Mutex<HashMap<ObjectKey, Pod>>,
    }

    impl FakePods {
        fn put(&self, pod: Pod) {
            let key = ObjectKey::new(
                pod.metadata.namespace.clone().unwrap_or_default(),
                pod.metadata.name.clone().unwrap_or_default(),
            );
            self.pods.lock().unwrap().insert(key, pod);
        }

        fn remove(&self, key: &ObjectKey) {
            self.pods.lock().unwrap().remove(key);
        }
    }

    #[async_trait]
    impl PodLookup for FakePods {
        async fn get_pod(&self, key: &ObjectKey) -> Result<Option<Pod>> {
            Ok(self.pods.lock().unwrap().get(key).cloned())
        }
    }

    /// Records every write and keeps checks per agent
    #[derive(Default)]
    struct FakeRegistry {
        checks: Mutex<HashMap<AgentTarget, HashMap<String, AgentCheck>>>,
        writes: Mutex<Vec<String>>,
        registrations: Mutex<Vec<CheckRegistration>>,
        located: Mutex<Vec<String>>,
        reads: AtomicUsize,
        fail_writes: AtomicBool,
    }

    impl FakeRegistry {
        fn seed(&self, agent: AgentTarget, check: AgentCheck) {
            self.checks
                .lock()
                .unwrap()
                .entry(agent)
                .or_default()
                .insert(check.check_id.clone(), check);
        }

        fn check(&self, agent: &AgentTarget, id: &str) -> Option<AgentCheck> {
            self.checks
                .lock()
                .unwrap()
                .get(agent)
                .and_then(|c| c.get(id))
                .cloned()
        }

        fn check_count(&self, agent: &AgentTarget) -> usize {
            self.checks
                .lock()
                .unwrap()
                .get(agent)
                .map_or(0, HashMap::len)
        }

        fn writes(&self) -> Vec<String> {
            self.writes.lock().unwrap().clone()
        }

        fn write_guard(&self) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(Error::ConsulError {
                    status: 500,
                    message: "rpc error: No cluster leader".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl MeshRegistry for FakeRegistry {
        async fn agent_checks(
            &self,
            agent: &AgentTarget,
            _namespace: Option<&str>,
        ) -> Result<HashMap<String, AgentCheck>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .checks
                .lock()
                .unwrap()
                .get(agent)
                .cloned()
                .unwrap_or_default())
        }

        async fn register_ttl_check(
            &self,
            agent: &AgentTarget,
            registration: &CheckRegistration,
        ) -> Result<()> {
            self.write_guard()?;
            self.writes
                .lock()
                .unwrap()
                .push(format!("register {} {}", registration.id, registration.status));
            self.registrations.lock().unwrap().push(registration.clone());
            self.seed(
                agent.clone(),
                AgentCheck {
                    check_id: registration.id.clone(),
                    name: registration.name.clone(),
                    status: registration.status,
                    output: String::new(),
                    service_id: registration.service_id.clone(),
                    service_name: String::new(),
                },
            );
            Ok(())
        }

        async fn update_ttl_check(
            &self,
            agent: &AgentTarget,
            check_id: &str,
            update: &CheckUpdate,
            _namespace: Option<&str>,
        ) -> Result<()> {
            self.write_guard()?;
            self.writes
                .lock()
                .unwrap()
                .push(format!("update {} {}", check_id, update.status));
            let mut checks = self.checks.lock().unwrap();
            let check = checks
                .get_mut(agent)
                .and_then(|c| c.get_mut(check_id))
                .ok_or_else(|| Error::ConsulError {
                    status: 500,
                    message: format!("CheckID {check_id:?} does not have associated TTL"),
                })?;
            check.status = update.status;
            check.output = update.output.clone();
            Ok(())
        }

        async fn deregister_check(
            &self,
            agent: &AgentTarget,
            check_id: &str,
            _namespace: Option<&str>,
        ) -> Result<()> {
            self.write_guard()?;
            self.writes
                .lock()
                .unwrap()
                .push(format!("deregister {check_id}"));
            if let Some(checks) = self.checks.lock().unwrap().get_mut(agent) {
                checks.remove(check_id);
            }
            Ok(())
        }

        async fn locate_check(
            &self,
            check_id: &str,
            _namespace: Option<&str>,
        ) -> Result<Option<AgentTarget>> {
            self.located.lock().unwrap().push(check_id.to_string());
            Ok(self
                .checks
                .lock()
                .unwrap()
                .iter()
                .find(|(_, checks)| checks.contains_key(check_id))
                .map(|(agent, _)| agent.clone()))
        }

        async fn leader(&self) -> Result<String> {
            Ok("10.0.0.1:8300".to_string())
        }
    }

    const HOST: &str = "10.0.0.5";

    fn agent() -> AgentTarget {
        AgentTarget::Host(HOST.to_string())
    }

    fn pod(namespace: &str, name: &str, app: &str, ready: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([("app".to_string(), app.to_string())])),
                ..Default::default()
            },
            status: Some(PodStatus {
                host_ip: Some(HOST.to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    reason: (!ready).then(|| "ContainersNotReady".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    struct Fixture {
        pods: Arc<FakePods>,
        registry: Arc<FakeRegistry>,
        handler: HealthCheckHandler,
    }

    fn fixture_with(deny: &[&str], naming: NamingConfig, consul: ConsulConfig) -> Fixture {
        let pods = Arc::new(FakePods::default());
        let registry = Arc::new(FakeRegistry::default());
        let filter = NamespaceFilter::new(NamespaceFilterConfig::new(
            "",
            vec!["*".to_string()],
            deny.iter().map(|d| d.to_string()),
        ));
        let handler = HealthCheckHandler::new(
            pods.clone(),
            registry.clone(),
            filter,
            NameTranslator::new(naming),
            &consul,
        );
        Fixture {
            pods,
            registry,
            handler,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(&[], NamingConfig::default(), ConsulConfig::default())
    }

    #[tokio::test]
    async fn test_not_ready_pod_registers_critical_check() {
        let f = fixture();
        f.pods.put(pod("default", "web-1", "web", false));
        let key = ObjectKey::new("default", "web-1");

        f.handler.handle(&key).await.unwrap();

        let id = health_check_id("default", "web-1");
        let check = f.registry.check(&agent(), &id).unwrap();
        assert_eq!(check.status, CheckStatus::Critical);
        assert_eq!(check.service_id, "web-1-web");
        assert_eq!(
            check.output,
            "Pod \"default/web-1\" is not ready: ContainersNotReady"
        );
        assert_eq!(
            f.registry.writes(),
            vec![format!("register {id} critical"), format!("update {id} critical")]
        );

        let registration = f.registry.registrations.lock().unwrap()[0].clone();
        assert_eq!(registration.ttl, "100000h");
        assert_eq!(registration.namespace, None);
    }

    #[tokio::test]
    async fn test_ready_transitions_update_same_check() {
        let f = fixture();
        let key = ObjectKey::new("default", "web-1");
        let id = health_check_id("default", "web-1");

        f.pods.put(pod("default", "web-1", "web", true));
        f.handler.handle(&key).await.unwrap();
        f.pods.put(pod("default", "web-1", "web", false));
        f.handler.handle(&key).await.unwrap();
        f.pods.put(pod("default", "web-1", "web", true));
        f.handler.handle(&key).await.unwrap();

        assert_eq!(f.registry.check_count(&agent()), 1);
        assert_eq!(
            f.registry.check(&agent(), &id).unwrap().status,
            CheckStatus::Passing
        );
        assert_eq!(
            f.registry.writes(),
            vec![
                format!("register {id} passing"),
                format!("update {id} passing"),
                format!("update {id} critical"),
                format!("update {id} passing"),
            ]
        );
    }

    #[tokio::test]
    async fn test_unchanged_status_performs_no_write() {
        let f = fixture();
        let key = ObjectKey::new("default", "web-1");
        f.pods.put(pod("default", "web-1", "web", true));

        f.handler.handle(&key).await.unwrap();
        let writes = f.registry.writes().len();
        f.handler.handle(&key).await.unwrap();
        f.handler.handle(&key).await.unwrap();

        assert_eq!(f.registry.writes().len(), writes);
    }

    #[tokio::test]
    async fn test_denied_namespace_is_a_no_op() {
        let f = fixture_with(&["ops"], NamingConfig::default(), ConsulConfig::default());
        f.pods.put(pod("ops", "api-1", "api", false));

        f.handler
            .handle(&ObjectKey::new("ops", "api-1"))
            .await
            .unwrap();

        assert!(f.registry.writes().is_empty());
        assert_eq!(f.registry.reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_deleted_pod_deregisters_owned_check_only() {
        let f = fixture();
        let key = ObjectKey::new("default", "web-1");
        let id = health_check_id("default", "web-1");
        f.registry.seed(
            agent(),
            AgentCheck {
                check_id: "service:web-1-web".to_string(),
                name: "Service check".to_string(),
                status: CheckStatus::Passing,
                output: String::new(),
                service_id: "web-1-web".to_string(),
                service_name: "web".to_string(),
            },
        );

        f.pods.put(pod("default", "web-1", "web", true));
        f.handler.handle(&key).await.unwrap();
        f.registry.writes.lock().unwrap().clear();

        f.pods.remove(&key);
        f.handler.handle(&key).await.unwrap();

        assert_eq!(f.registry.writes(), vec![format!("deregister {id}")]);
        assert!(f.registry.check(&agent(), &id).is_none());
        assert!(f.registry.check(&agent(), "service:web-1-web").is_some());
    }

    #[tokio::test]
    async fn test_deleted_pod_without_check_writes_nothing() {
        let f = fixture();
        f.handler
            .handle(&ObjectKey::new("default", "gone"))
            .await
            .unwrap();
        assert!(f.registry.writes().is_empty());
    }

    #[tokio::test]
    async fn test_deleted_pod_never_seen_deregisters_on_its_host_agent() {
        // A handler that never handled the pod, e.g. after a restart
        let f = fixture();
        let id = health_check_id("default", "web-1");
        f.registry.seed(
            agent(),
            AgentCheck {
                check_id: id.clone(),
                name: "Kubernetes Health Check".to_string(),
                status: CheckStatus::Passing,
                output: String::new(),
                service_id: "web-1-web".to_string(),
                service_name: "web".to_string(),
            },
        );

        f.handler
            .handle(&ObjectKey::new("default", "web-1"))
            .await
            .unwrap();

        assert_eq!(*f.registry.located.lock().unwrap(), vec![id.clone()]);
        assert_eq!(f.registry.writes(), vec![format!("deregister {id}")]);
        assert!(f.registry.check(&agent(), &id).is_none());
    }

    #[tokio::test]
    async fn test_failed_delete_is_retried_through_registry_lookup() {
        let f = fixture();
        let key = ObjectKey::new("default", "web-1");
        let id = health_check_id("default", "web-1");
        f.pods.put(pod("default", "web-1", "web", true));
        f.handler.handle(&key).await.unwrap();

        f.pods.remove(&key);
        f.registry.fail_writes.store(true, Ordering::SeqCst);
        assert!(f.handler.handle(&key).await.is_err());
        assert!(f.registry.located.lock().unwrap().is_empty());

        // The cached agent was released by the failed attempt
        f.registry.fail_writes.store(false, Ordering::SeqCst);
        f.handler.handle(&key).await.unwrap();

        assert_eq!(*f.registry.located.lock().unwrap(), vec![id.clone()]);
        assert!(f.registry.check(&agent(), &id).is_none());
    }

    #[tokio::test]
    async fn test_foreign_checks_are_not_modified() {
        let f = fixture();
        let foreign = AgentCheck {
            check_id: "service:web-1-web".to_string(),
            name: "HTTP check".to_string(),
            status: CheckStatus::Critical,
            output: "connection refused".to_string(),
            service_id: "web-1-web".to_string(),
            service_name: "web".to_string(),
        };
        f.registry.seed(agent(), foreign.clone());
        f.pods.put(pod("default", "web-1", "web", true));

        f.handler
            .handle(&ObjectKey::new("default", "web-1"))
            .await
            .unwrap();

        assert_eq!(
            f.registry.check(&agent(), "service:web-1-web"),
            Some(foreign)
        );
    }

    #[tokio::test]
    async fn test_registry_errors_are_returned() {
        let f = fixture();
        f.registry.fail_writes.store(true, Ordering::SeqCst);
        f.pods.put(pod("default", "web-1", "web", true));

        let err = f
            .handler
            .handle(&ObjectKey::new("default", "web-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConsulError { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_unscheduled_pod_is_skipped() {
        let f = fixture();
        let mut p = pod("default", "web-1", "web", false);
        p.status.as_mut().unwrap().host_ip = None;
        f.pods.put(p);

        f.handler
            .handle(&ObjectKey::new("default", "web-1"))
            .await
            .unwrap();

        assert_eq!(f.registry.reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_translated_name_and_override() {
        let naming = NamingConfig {
            service_prefix: "k8s-".to_string(),
            add_namespace_suffix: true,
            ..Default::default()
        };
        let f = fixture_with(&[], naming, ConsulConfig::default());

        f.pods.put(pod("team-a", "web-1", "web", true));
        let mut overridden = pod("team-a", "web-2", "web", true);
        overridden.metadata.annotations = Some(BTreeMap::from([(
            SERVICE_NAME_ANNOTATION.to_string(),
            "frontend".to_string(),
        )]));
        f.pods.put(overridden);

        f.handler
            .handle(&ObjectKey::new("team-a", "web-1"))
            .await
            .unwrap();
        f.handler
            .handle(&ObjectKey::new("team-a", "web-2"))
            .await
            .unwrap();

        let first = f
            .registry
            .check(&agent(), &health_check_id("team-a", "web-1"))
            .unwrap();
        assert_eq!(first.service_id, "web-1-k8s-web-team-a");
        let second = f
            .registry
            .check(&agent(), &health_check_id("team-a", "web-2"))
            .unwrap();
        assert_eq!(second.service_id, "web-2-frontend");
    }

    #[tokio::test]
    async fn test_renamed_service_moves_check() {
        let f = fixture();
        let key = ObjectKey::new("default", "web-1");
        let id = health_check_id("default", "web-1");

        f.pods.put(pod("default", "web-1", "web", true));
        f.handler.handle(&key).await.unwrap();
        f.registry.writes.lock().unwrap().clear();

        f.pods.put(pod("default", "web-1", "web-v2", true));
        f.handler.handle(&key).await.unwrap();

        assert_eq!(
            f.registry.writes(),
            vec![
                format!("deregister {id}"),
                format!("register {id} passing"),
                format!("update {id} passing"),
            ]
        );
        assert_eq!(
            f.registry.check(&agent(), &id).unwrap().service_id,
            "web-1-web-v2"
        );
    }

    #[tokio::test]
    async fn test_namespaces_enabled_registers_in_destination_namespace() {
        let naming = NamingConfig {
            write_namespace: "mesh".to_string(),
            ..Default::default()
        };
        let consul = ConsulConfig {
            enable_namespaces: true,
            ..Default::default()
        };
        let f = fixture_with(&[], naming, consul);
        f.pods.put(pod("default", "web-1", "web", true));

        f.handler
            .handle(&ObjectKey::new("default", "web-1"))
            .await
            .unwrap();

        let registration = f.registry.registrations.lock().unwrap()[0].clone();
        assert_eq!(registration.namespace.as_deref(), Some("mesh"));
    }
}
