//! HTTP surface for the orchestrator's probes
//!
//! Serves readiness (`/health/ready`), liveness (`/health`) and, with the
//! `metrics` feature, Prometheus metrics (`/metrics`).

mod handlers;
mod server;

pub use server::{router, serve, ApiState};
