//! Controller lifecycle
//!
//! Wires an [`EventSource`] into the [`WorkQueue`] and drains it with a pool of
//! workers that dispatch each key to a [`Handler`]. The lifecycle moves through
//! [`ControllerPhase`] and is observable through a watch channel, which the
//! readiness endpoint uses.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{QueueConfig, SyncConfig};
use crate::consul::MeshRegistry;
use crate::error::{Error, Result};

use super::event_source::{EventSource, ObjectKey, PodEventSource};
use super::handler::{Handler, HealthCheckHandler};
use super::namespace_filter::NamespaceFilter;
use super::naming::NameTranslator;
use super::pods::KubePods;
use super::queue::{ExponentialBackoff, WorkQueue};

/// Name used for log fields and metric labels
pub const CONTROLLER_NAME: &str = "pod-health";

/// How long a stopped event source may take to wind down before it is aborted
const SOURCE_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerPhase {
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

/// Source -> queue -> handler pipeline
pub struct Controller {
    source: Arc<dyn EventSource>,
    queue: Arc<WorkQueue<ObjectKey>>,
    handler: Arc<dyn Handler>,
    max_retries: u32,
    workers: usize,
    phase: watch::Sender<ControllerPhase>,
}

impl Controller {
    pub fn new(
        source: Arc<dyn EventSource>,
        handler: Arc<dyn Handler>,
        config: &QueueConfig,
    ) -> Self {
        let backoff = ExponentialBackoff::new(config.backoff_base, config.backoff_max);
        let (phase, _) = watch::channel(ControllerPhase::Created);
        Self {
            source,
            queue: Arc::new(WorkQueue::new(backoff)),
            handler,
            max_retries: config.max_retries,
            workers: config.workers.max(1),
            phase,
        }
    }

    /// Observe lifecycle transitions
    pub fn phase(&self) -> watch::Receiver<ControllerPhase> {
        self.phase.subscribe()
    }

    pub fn queue(&self) -> &Arc<WorkQueue<ObjectKey>> {
        &self.queue
    }

    /// Run until `shutdown` resolves or the event source fails terminally.
    ///
    /// Workers always finish the key they are processing before this returns.
    /// An `Err` means the controller stopped because of an internal fault.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        if *self.phase.borrow() != ControllerPhase::Created {
            return Err(Error::ConfigError(
                "controller can only be started once".to_string(),
            ));
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let source = self.source.clone();
        let mut source_task = tokio::spawn(async move { source.start(tx).await });

        let mut workers = JoinSet::new();
        for id in 0..self.workers {
            workers.spawn(worker_loop(
                id,
                self.queue.clone(),
                self.handler.clone(),
                self.max_retries,
            ));
        }

        self.phase.send_replace(ControllerPhase::Running);
        info!(
            controller = CONTROLLER_NAME,
            workers = self.workers,
            max_retries = self.max_retries,
            "Controller running"
        );

        tokio::pin!(shutdown);
        let mut source_finished = false;
        let outcome = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                Some(event) = rx.recv() => {
                    debug!(key = %event.key, kind = ?event.kind, "Enqueueing change");
                    self.queue.add(event.key);
                    #[cfg(feature = "metrics")]
                    super::metrics::set_queue_depth(CONTROLLER_NAME, self.queue.len());
                }
                res = &mut source_task, if !source_finished => {
                    source_finished = true;
                    match res {
                        Ok(Ok(())) => debug!("Event source finished"),
                        Ok(Err(e)) => {
                            error!(error = %e, "Event source failed, stopping controller");
                            break Err(e);
                        }
                        Err(e) => {
                            error!(error = %e, "Event source task aborted, stopping controller");
                            break Err(Error::EventSourceError(format!(
                                "event source task failed: {e}"
                            )));
                        }
                    }
                }
            }
        };

        self.phase.send_replace(ControllerPhase::ShuttingDown);
        self.source.stop();
        self.queue.shut_down();

        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "Worker task panicked");
            }
        }

        if !source_finished {
            match tokio::time::timeout(SOURCE_STOP_TIMEOUT, &mut source_task).await {
                Ok(Ok(Err(e))) => debug!(error = %e, "Event source ended with error during shutdown"),
                Ok(_) => {}
                Err(_) => {
                    warn!("Event source did not stop in time, aborting it");
                    source_task.abort();
                }
            }
        }

        self.phase.send_replace(ControllerPhase::Stopped);
        info!(controller = CONTROLLER_NAME, "Controller stopped");
        outcome
    }
}

async fn worker_loop(
    id: usize,
    queue: Arc<WorkQueue<ObjectKey>>,
    handler: Arc<dyn Handler>,
    max_retries: u32,
) {
    debug!(worker = id, "Worker started");
    while let Some(key) = queue.get().await {
        process_key(&queue, handler.as_ref(), max_retries, key).await;
    }
    debug!(worker = id, "Worker exiting");
}

/// Handle one key and settle its queue state
pub(crate) async fn process_key(
    queue: &WorkQueue<ObjectKey>,
    handler: &dyn Handler,
    max_retries: u32,
    key: ObjectKey,
) {
    let started = Instant::now();
    let result = handler.handle(&key).await;

    #[cfg(feature = "metrics")]
    super::metrics::observe_reconcile_duration_seconds(
        CONTROLLER_NAME,
        started.elapsed().as_secs_f64(),
    );

    match result {
        Ok(()) => {
            debug!(key = %key, elapsed_ms = started.elapsed().as_millis() as u64, "Reconciled");
            queue.forget(&key);
        }
        Err(e) => {
            #[cfg(feature = "metrics")]
            super::metrics::inc_reconcile_error(CONTROLLER_NAME, e.kind());

            let attempts = queue.num_requeues(&key);
            if attempts < max_retries {
                let delay = queue.add_rate_limited(key.clone());
                warn!(
                    key = %key,
                    attempt = attempts + 1,
                    delay_ms = delay.as_millis() as u64,
                    retriable = e.is_retriable(),
                    error = %e,
                    "Reconcile failed, requeueing"
                );
                #[cfg(feature = "metrics")]
                super::metrics::inc_retry(CONTROLLER_NAME);
            } else {
                error!(
                    key = %key,
                    attempts,
                    error = %e,
                    "Reconcile failed, giving up"
                );
                queue.forget(&key);
                #[cfg(feature = "metrics")]
                super::metrics::inc_dropped(CONTROLLER_NAME);
            }
        }
    }

    queue.done(&key);
    #[cfg(feature = "metrics")]
    super::metrics::set_queue_depth(CONTROLLER_NAME, queue.len());
}

/// Build the pod health controller against a live cluster and registry
pub fn build_controller(
    client: Client,
    registry: Arc<dyn MeshRegistry>,
    config: &SyncConfig,
) -> Controller {
    let source = PodEventSource::new(
        client.clone(),
        config.namespaces.single_namespace(),
        config.pod_label_selector.as_deref(),
    );
    let handler = HealthCheckHandler::new(
        Arc::new(KubePods::new(client)),
        registry,
        NamespaceFilter::new(config.namespaces.clone()),
        NameTranslator::new(config.naming.clone()),
        &config.consul,
    );
    Controller::new(Arc::new(source), Arc::new(handler), &config.queue)
}
