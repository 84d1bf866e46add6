//! health-sync-k8s: Kubernetes pod readiness to Consul health checks
//!
//! This crate provides an operator that watches pods, and mirrors each pod's
//! readiness into a TTL health check on its Consul service instance. Work
//! flows from a list+watch event source through a deduplicating, rate-limited
//! queue into a pool of workers running the health-check handler.

pub mod config;
pub mod consul;
pub mod controller;
pub mod error;
pub mod rest_api;
pub mod telemetry;

pub use crate::config::SyncConfig;
pub use crate::error::{Error, Result};
