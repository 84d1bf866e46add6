//! Consul agent integration
//!
//! The mesh registry side of the sync: wire types for agent checks and the
//! [`MeshRegistry`] capability used by the health-check handler.

mod client;
pub mod types;

pub use client::{ConsulClient, MeshRegistry};
pub use types::{
    health_check_id, service_instance_id, AgentCheck, AgentTarget, CheckRegistration,
    CheckStatus, CheckUpdate, HEALTH_CHECK_NAME, HEALTH_CHECK_SUFFIX,
};
