use thiserror::Error;

/// Top-level error type for the gateway.
///
/// Machine codes and HTTP status mappings are contract-stable; handlers
/// convert these into `{error, message, request_id, timestamp}` envelopes.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid port: {0} (must be 1024-65535)")]
    InvalidPort(i64),

    #[error("unauthorized")]
    Unauthorized,

    #[error("instance on port {0} not found")]
    InstanceNotFound(u16),

    #[error("device {0} not found")]
    DeviceNotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("port {0} is already in use")]
    PortInUse(u16),

    #[error("port {0} is locked by another operation")]
    PortLocked(u16),

    #[error("device {0} is not logged in")]
    DeviceNotLoggedIn(String),

    #[error("device id required: more than one device is registered")]
    DeviceIdRequired,

    #[error("worker failed to start: {0}")]
    StartFailed(String),

    #[error("supervisor unreachable: {0}")]
    SupervisorUnreachable(String),

    #[error("supervisor timeout: {0}")]
    SupervisorTimeout(String),

    #[error("supervisor error: {0}")]
    Supervisor(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("webhook error: {0}")]
    Webhook(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GatewayError {
    /// Contract-stable machine code for error envelopes.
    pub fn machine_code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::InvalidPort(_) => "invalid_port",
            Self::Unauthorized => "unauthorized",
            Self::InstanceNotFound(_) => "instance_not_found",
            Self::DeviceNotFound(_) => "device_not_found",
            Self::AlreadyExists(_) => "instance_exists",
            Self::PortInUse(_) => "port_in_use",
            Self::PortLocked(_) => "port_locked",
            Self::DeviceNotLoggedIn(_) => "device_not_logged_in",
            Self::DeviceIdRequired => "device_id_required",
            Self::StartFailed(_) => "start_failed",
            Self::SupervisorUnreachable(_) => "supervisor_unreachable",
            Self::SupervisorTimeout(_) => "supervisor_timeout",
            Self::Supervisor(_) => "supervisor_error",
            Self::Storage(_) => "storage_error",
            Self::Webhook(_) => "webhook_error",
            Self::Transport(_) => "transport_error",
            Self::Io(_) => "io_error",
            Self::Serialization(_) => "serialization_error",
        }
    }

    /// HTTP status for the error envelope.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidInput(_) | Self::InvalidPort(_) | Self::DeviceIdRequired => 400,
            Self::Unauthorized => 401,
            Self::InstanceNotFound(_) | Self::DeviceNotFound(_) => 404,
            Self::AlreadyExists(_)
            | Self::PortInUse(_)
            | Self::PortLocked(_)
            | Self::DeviceNotLoggedIn(_) => 409,
            Self::SupervisorUnreachable(_) => 502,
            Self::SupervisorTimeout(_) => 504,
            _ => 500,
        }
    }

    /// Classify a supervisor failure by message substring.
    ///
    /// Connectivity failures map to 502, deadline failures to 504, and
    /// everything else stays a plain supervisor error (500).
    pub fn classify_supervisor(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("connection refused")
            || lower.contains("no such host")
            || lower.contains("dns error")
            || lower.contains("connect error")
            || lower.contains("ping")
        {
            Self::SupervisorUnreachable(message)
        } else if lower.contains("timed out")
            || lower.contains("timeout")
            || lower.contains("deadline")
        {
            Self::SupervisorTimeout(message)
        } else {
            Self::Supervisor(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supervisor_classification() {
        let err = GatewayError::classify_supervisor("connect error: connection refused");
        assert!(matches!(err, GatewayError::SupervisorUnreachable(_)));
        assert_eq!(err.http_status(), 502);

        let err = GatewayError::classify_supervisor("operation timed out after 60s");
        assert!(matches!(err, GatewayError::SupervisorTimeout(_)));
        assert_eq!(err.http_status(), 504);

        let err = GatewayError::classify_supervisor("BAD_NAME: no such group");
        assert!(matches!(err, GatewayError::Supervisor(_)));
        assert_eq!(err.http_status(), 500);
    }

    #[test]
    fn machine_codes_are_stable() {
        assert_eq!(
            GatewayError::AlreadyExists("gowa_3001".into()).machine_code(),
            "instance_exists"
        );
        assert_eq!(GatewayError::PortLocked(3005).machine_code(), "port_locked");
        assert_eq!(GatewayError::InvalidPort(1023).machine_code(), "invalid_port");
        assert_eq!(
            GatewayError::InstanceNotFound(3001).machine_code(),
            "instance_not_found"
        );
    }

    #[test]
    fn status_mapping() {
        assert_eq!(GatewayError::InvalidPort(99).http_status(), 400);
        assert_eq!(GatewayError::Unauthorized.http_status(), 401);
        assert_eq!(GatewayError::DeviceNotFound("x".into()).http_status(), 404);
        assert_eq!(GatewayError::PortInUse(3001).http_status(), 409);
        assert_eq!(
            GatewayError::DeviceNotLoggedIn("x".into()).http_status(),
            409
        );
        assert_eq!(GatewayError::DeviceIdRequired.http_status(), 400);
        assert_eq!(GatewayError::Storage("x".into()).http_status(), 500);
    }
}
