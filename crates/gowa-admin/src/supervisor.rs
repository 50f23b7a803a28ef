//! Client for the supervisory daemon.
//!
//! The daemon speaks a JSON-RPC-like protocol over HTTP: one POST per call
//! with `{"method", "params"}` and basic auth. Everything the control
//! plane needs is behind the [`Supervisor`] trait so the API tests can run
//! against a mock.

use async_trait::async_trait;
use gowa_core::GatewayError;
use serde::Serialize;
use serde_json::{json, Value};

/// Worker process state as reported by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Running,
    Starting,
    Stopped,
    Fatal,
    Unknown,
}

impl ProcessState {
    pub fn parse(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "RUNNING" => Self::Running,
            "STARTING" => Self::Starting,
            "STOPPED" | "EXITED" | "SHUTDOWN" => Self::Stopped,
            "FATAL" | "BACKOFF" => Self::Fatal,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub name: String,
    pub state: ProcessState,
    pub pid: Option<i64>,
    pub uptime_secs: Option<i64>,
    pub stdout_log: Option<String>,
    pub stderr_log: Option<String>,
}

#[async_trait]
pub trait Supervisor: Send + Sync {
    async fn ping(&self) -> Result<(), GatewayError>;
    /// Re-read the per-worker config files.
    async fn reload(&self) -> Result<(), GatewayError>;
    async fn start_process(&self, name: &str) -> Result<(), GatewayError>;
    async fn stop_process(&self, name: &str) -> Result<(), GatewayError>;
    async fn remove_process_group(&self, name: &str) -> Result<(), GatewayError>;
    async fn get_process_info(&self, name: &str) -> Result<Option<ProcessInfo>, GatewayError>;
    async fn list_processes(&self) -> Result<Vec<ProcessInfo>, GatewayError>;
}

/// HTTP client against a real supervisory daemon.
pub struct HttpSupervisor {
    url: String,
    user: Option<String>,
    pass: Option<String>,
    client: reqwest::Client,
}

impl HttpSupervisor {
    pub fn new(
        url: impl Into<String>,
        user: Option<String>,
        pass: Option<String>,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| GatewayError::Supervisor(format!("http client build failed: {e}")))?;
        Ok(Self {
            url: url.into(),
            user,
            pass,
            client,
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        let body = json!({ "method": method, "params": params });
        let mut request = self.client.post(&self.url).json(&body);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.pass.as_deref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::classify_supervisor(e.to_string()))?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::classify_supervisor(format!("bad response body: {e}")))?;

        if !status.is_success() {
            return Err(GatewayError::classify_supervisor(format!(
                "supervisor returned {status}: {payload}"
            )));
        }
        if let Some(error) = payload.get("error").and_then(|e| e.as_str()) {
            return Err(GatewayError::classify_supervisor(error.to_string()));
        }
        Ok(payload.get("result").cloned().unwrap_or(Value::Null))
    }

    fn parse_info(value: &Value) -> ProcessInfo {
        let uptime = value["now"]
            .as_i64()
            .zip(value["start"].as_i64())
            .map(|(now, start)| (now - start).max(0));
        ProcessInfo {
            name: value["name"].as_str().unwrap_or_default().to_string(),
            state: ProcessState::parse(value["statename"].as_str().unwrap_or_default()),
            pid: value["pid"].as_i64().filter(|pid| *pid > 0),
            uptime_secs: uptime,
            stdout_log: value["stdout_logfile"].as_str().map(String::from),
            stderr_log: value["stderr_logfile"].as_str().map(String::from),
        }
    }
}

#[async_trait]
impl Supervisor for HttpSupervisor {
    async fn ping(&self) -> Result<(), GatewayError> {
        self.call("ping", json!([])).await.map(|_| ())
    }

    async fn reload(&self) -> Result<(), GatewayError> {
        self.call("reload_config", json!([])).await.map(|_| ())
    }

    async fn start_process(&self, name: &str) -> Result<(), GatewayError> {
        self.call("start_process", json!([name])).await.map(|_| ())
    }

    async fn stop_process(&self, name: &str) -> Result<(), GatewayError> {
        self.call("stop_process", json!([name])).await.map(|_| ())
    }

    async fn remove_process_group(&self, name: &str) -> Result<(), GatewayError> {
        self.call("remove_process_group", json!([name]))
            .await
            .map(|_| ())
    }

    async fn get_process_info(&self, name: &str) -> Result<Option<ProcessInfo>, GatewayError> {
        match self.call("get_process_info", json!([name])).await {
            Ok(Value::Null) => Ok(None),
            Ok(value) => Ok(Some(Self::parse_info(&value))),
            // The daemon reports unknown names as a BAD_NAME error.
            Err(GatewayError::Supervisor(message)) if message.contains("BAD_NAME") => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_processes(&self) -> Result<Vec<ProcessInfo>, GatewayError> {
        let value = self.call("get_all_process_info", json!([])).await?;
        Ok(value
            .as_array()
            .map(|items| items.iter().map(Self::parse_info).collect())
            .unwrap_or_default())
    }
}
