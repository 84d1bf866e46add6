//! Event source adapter
//!
//! Turns the orchestrator's list+watch stream into [`ChangeEvent`]s. Events
//! only carry the key; the handler always re-reads current state.

use std::collections::HashSet;
use std::fmt;
use std::pin::pin;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams},
    runtime::{watcher, WatchStreamExt},
    Client, ResourceExt,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Identity of one reconcilable resource
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_resource<K: ResourceExt>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Updated,
    Deleted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    pub key: ObjectKey,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn new(key: ObjectKey, kind: ChangeKind) -> Self {
        Self { key, kind }
    }
}

pub type EventSender = mpsc::UnboundedSender<ChangeEvent>;

/// A producer of change events
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Emit events into `events` until [`EventSource::stop`] is called.
    ///
    /// Transient stream failures are recovered internally. An `Err` means the
    /// source could not run at all.
    async fn start(&self, events: EventSender) -> Result<()>;

    fn stop(&self);
}

/// Maps watcher events to change events and detects deletions missed across re-lists
#[derive(Debug, Default)]
pub(crate) struct KeyTracker {
    known: HashSet<ObjectKey>,
    relisting: Option<HashSet<ObjectKey>>,
}

impl KeyTracker {
    pub(crate) fn observe<K: ResourceExt>(&mut self, event: watcher::Event<K>) -> Vec<ChangeEvent> {
        match event {
            watcher::Event::Init => {
                self.relisting = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(obj) => {
                let key = ObjectKey::from_resource(&obj);
                if let Some(seen) = self.relisting.as_mut() {
                    seen.insert(key.clone());
                }
                self.known.insert(key.clone());
                vec![ChangeEvent::new(key, ChangeKind::Updated)]
            }
            watcher::Event::InitDone => {
                let Some(seen) = self.relisting.take() else {
                    return Vec::new();
                };
                let gone: Vec<ObjectKey> = self.known.difference(&seen).cloned().collect();
                gone.into_iter()
                    .map(|key| {
                        self.known.remove(&key);
                        ChangeEvent::new(key, ChangeKind::Deleted)
                    })
                    .collect()
            }
            watcher::Event::Apply(obj) => {
                let key = ObjectKey::from_resource(&obj);
                let kind = if self.known.insert(key.clone()) {
                    ChangeKind::Added
                } else {
                    ChangeKind::Updated
                };
                vec![ChangeEvent::new(key, kind)]
            }
            watcher::Event::Delete(obj) => {
                let key = ObjectKey::from_resource(&obj);
                self.known.remove(&key);
                vec![ChangeEvent::new(key, ChangeKind::Deleted)]
            }
        }
    }
}

/// List+watch source for pods
pub struct PodEventSource {
    api: Api<Pod>,
    config: watcher::Config,
    stop: watch::Sender<bool>,
}

impl PodEventSource {
    /// Watch pods in `namespace` (or cluster-wide) matching `label_selector`
    pub fn new(client: Client, namespace: Option<&str>, label_selector: Option<&str>) -> Self {
        let api = match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };
        let mut config = watcher::Config::default();
        if let Some(selector) = label_selector.filter(|s| !s.is_empty()) {
            config = config.labels(selector);
        }
        let (stop, _) = watch::channel(false);
        Self { api, config, stop }
    }

    fn list_params(&self) -> ListParams {
        let mut params = ListParams::default().limit(1);
        if let Some(selector) = &self.config.label_selector {
            params = params.labels(selector);
        }
        params
    }
}

#[async_trait]
impl EventSource for PodEventSource {
    async fn start(&self, events: EventSender) -> Result<()> {
        // Fail fast when the cluster cannot be reached at all
        self.api
            .list(&self.list_params())
            .await
            .map_err(|e| Error::EventSourceError(format!("cannot list pods: {e}")))?;

        let mut stop_rx = self.stop.subscribe();
        if *stop_rx.borrow_and_update() {
            return Ok(());
        }

        info!("Starting pod watch");
        let mut stream = pin!(watcher(self.api.clone(), self.config.clone()).default_backoff());
        let mut tracker = KeyTracker::default();

        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    info!("Pod watch stopped");
                    return Ok(());
                }
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        for change in tracker.observe(event) {
                            debug!(key = %change.key, kind = ?change.kind, "Pod change");
                            if events.send(change).is_err() {
                                debug!("Event receiver closed, stopping pod watch");
                                return Ok(());
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Pod watch interrupted, re-listing");
                    }
                    None => {
                        return Err(Error::EventSourceError(
                            "pod watch stream ended".to_string(),
                        ));
                    }
                },
            }
        }
    }

    fn stop(&self) {
        self.stop.send_replace(true);
    }
}
