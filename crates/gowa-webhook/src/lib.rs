//! Webhook fan-out.
//!
//! Normalized events are signed with HMAC-SHA256 and delivered to every
//! subscriber URL with bounded retries. Delivery is best-effort: after the
//! retry budget is exhausted the event is dropped and a counter
//! incremented. There is no persistent outbox.

mod debounce;
mod sign;

pub use debounce::Debouncer;
pub use sign::{sign, verify, SIGNATURE_HEADER};

use std::sync::Arc;
use std::time::Duration;

use gowa_core::event::WebhookEvent;
use gowa_core::GatewayError;
use lazy_static::lazy_static;
use prometheus::{register_int_counter, IntCounter};
use tracing::{debug, warn};

lazy_static! {
    pub static ref WEBHOOK_DROPPED: IntCounter = register_int_counter!(
        "gowa_webhook_dropped_total",
        "Webhook events dropped after exhausting delivery retries"
    )
    .expect("register gowa_webhook_dropped_total");
}

/// Default backoff schedule between attempts.
pub const DEFAULT_BACKOFF_SECS: [u64; 5] = [1, 2, 4, 8, 16];

/// Attempts per subscriber before the event is dropped.
pub const MAX_ATTEMPTS: usize = 5;

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub urls: Vec<String>,
    pub secret: String,
    /// When non-empty, only events with these names are delivered.
    pub event_filter: Vec<String>,
    pub insecure_skip_verify: bool,
    pub attempt_timeout: Duration,
    pub backoff: Vec<Duration>,
}

impl WebhookConfig {
    pub fn new(urls: Vec<String>, secret: impl Into<String>) -> Self {
        Self {
            urls,
            secret: secret.into(),
            event_filter: Vec::new(),
            insecure_skip_verify: false,
            attempt_timeout: Duration::from_secs(10),
            backoff: DEFAULT_BACKOFF_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        }
    }

    pub fn from_worker(config: &gowa_core::WorkerConfig) -> Self {
        let mut this = Self::new(config.webhooks.clone(), config.webhook_secret.clone());
        this.event_filter = config.webhook_events.clone();
        this.insecure_skip_verify = config.webhook_insecure_skip_verify;
        this
    }
}

/// Delivers normalized events to subscriber endpoints.
#[derive(Clone)]
pub struct WebhookDispatcher {
    config: Arc<WebhookConfig>,
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(config: WebhookConfig) -> Result<Self, GatewayError> {
        if config.insecure_skip_verify {
            warn!("webhook TLS verification is DISABLED; deliveries are insecure");
        }
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure_skip_verify)
            .timeout(config.attempt_timeout)
            .build()
            .map_err(|e| GatewayError::Webhook(format!("http client build failed: {e}")))?;
        Ok(Self {
            config: Arc::new(config),
            client,
        })
    }

    pub fn has_subscribers(&self) -> bool {
        !self.config.urls.is_empty()
    }

    fn filtered_out(&self, event: &WebhookEvent) -> bool {
        !self.config.event_filter.is_empty()
            && !self.config.event_filter.iter().any(|name| name == &event.event)
    }

    /// Fan an event out in the background. Deliveries never propagate
    /// errors to the caller; a panicking attempt dies inside its own task.
    pub fn dispatch(&self, event: WebhookEvent) -> Option<tokio::task::JoinHandle<()>> {
        if !self.has_subscribers() || self.filtered_out(&event) {
            return None;
        }
        let dispatcher = self.clone();
        Some(tokio::spawn(async move {
            dispatcher.deliver_all(&event).await;
        }))
    }

    /// Deliver to every subscriber in order. Each subscriber gets an
    /// independent retry budget; a dead subscriber does not starve the
    /// ones after it beyond its own retry window.
    pub async fn deliver_all(&self, event: &WebhookEvent) {
        let body = match serde_json::to_vec(&event.to_body()) {
            Ok(body) => body,
            Err(e) => {
                warn!(event = %event.event, "webhook payload serialization failed: {e}");
                return;
            }
        };
        let signature = sign(&self.config.secret, &body);

        for url in &self.config.urls {
            self.deliver_to(url, event, &body, &signature).await;
        }
    }

    async fn deliver_to(&self, url: &str, event: &WebhookEvent, body: &[u8], signature: &str) {
        for attempt in 0..MAX_ATTEMPTS {
            let result = self
                .client
                .post(url)
                .header("Content-Type", "application/json")
                .header(SIGNATURE_HEADER, signature)
                .body(body.to_vec())
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    debug!(url, event = %event.event, attempt, "webhook delivered");
                    return;
                }
                Ok(response) => {
                    debug!(
                        url,
                        event = %event.event,
                        attempt,
                        status = response.status().as_u16(),
                        "webhook attempt rejected"
                    );
                }
                Err(e) => {
                    debug!(url, event = %event.event, attempt, "webhook attempt failed: {e}");
                }
            }

            if attempt + 1 < MAX_ATTEMPTS {
                let delay = self
                    .config
                    .backoff
                    .get(attempt)
                    .copied()
                    .unwrap_or_else(|| Duration::from_secs(16));
                tokio::time::sleep(delay).await;
            }
        }

        WEBHOOK_DROPPED.inc();
        warn!(url, event = %event.event, "webhook dropped after {MAX_ATTEMPTS} attempts");
    }
}
