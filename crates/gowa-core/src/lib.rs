//! # gowa-core
//!
//! Core types, configuration, error handling, and the TTL cache shared by
//! every crate in the gateway.

pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod jid;

pub use config::{AdminConfig, InstanceOverrides, WorkerConfig};
pub use error::GatewayError;
pub use jid::Jid;
