//! Prometheus metrics for the control plane.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref INSTANCES_RUNNING: IntGauge = register_int_gauge!(
        "gowa_instances_running",
        "Worker instances currently in the Running state"
    )
    .expect("register gowa_instances_running");
    pub static ref ADMIN_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "gowa_admin_api_requests_total",
        "Admin API requests",
        &["method", "path", "status"]
    )
    .expect("register gowa_admin_api_requests_total");
    pub static ref SUPERVISOR_ERRORS: IntCounter = register_int_counter!(
        "gowa_supervisor_errors_total",
        "Failed calls to the supervisory daemon"
    )
    .expect("register gowa_supervisor_errors_total");
    pub static ref INSTANCE_OPERATIONS: IntCounterVec = register_int_counter_vec!(
        "gowa_instance_operations_total",
        "Instance lifecycle operations",
        &["operation", "result"]
    )
    .expect("register gowa_instance_operations_total");
}

/// Text exposition of the default registry.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
