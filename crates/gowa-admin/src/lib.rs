//! # gowa-admin
//!
//! Supervisor control plane: per-port worker configuration, cross-process
//! port locks, the supervisory RPC client, and the authenticated admin
//! HTTP API with health and metrics.

pub mod api;
pub mod audit;
pub mod cleanup;
pub mod instances;
pub mod metrics;
pub mod portlock;
pub mod supervisor;

pub use api::{router, AdminState};
pub use instances::{InstanceInfo, InstanceManager};
pub use supervisor::{HttpSupervisor, ProcessInfo, ProcessState, Supervisor};
