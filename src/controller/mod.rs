//! Controller module for pod health-check sync
//! This module contains the reconciliation queue, the event source, the
//! health-check handler and the lifecycle that wires them together.

pub mod event_source;
mod handler;
#[cfg(test)]
mod handler_test;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod namespace_filter;
pub mod naming;
pub mod pods;
pub mod queue;
mod reconciler;

pub use event_source::{ChangeEvent, ChangeKind, EventSender, EventSource, ObjectKey, PodEventSource};
pub use handler::{Handler, HealthCheckHandler};
pub use namespace_filter::NamespaceFilter;
pub use naming::{DestinationName, NameTranslator};
pub use pods::{KubePods, PodLookup, PodReadiness};
pub use queue::{ExponentialBackoff, WorkQueue};
pub use reconciler::{build_controller, Controller, ControllerPhase, CONTROLLER_NAME};
