//! HTTP forwarding sink.
//!
//! Posts each record value, unchanged, to a fixed URL as
//! `{"message": "<value>"}`. Requests run on spawned tasks so the intake path
//! never waits on them; at most `max_in_flight` run at once and anything over
//! that is dropped. A rejected request is logged, never retried.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use crate::relay::{Delivery, DeliveryOutcome, Outbound};

const ERROR_BODY_SNIPPET_LEN: usize = 220;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HttpForwarderDefaults;

impl HttpForwarderDefaults {
    pub const URL: &'static str = "http://localhost:8000/api/messages";
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    pub const MAX_IN_FLIGHT: usize = 64;
}

#[derive(Clone, Debug)]
pub struct HttpForwarderOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Concurrent POSTs allowed from [`Delivery::deliver`].
    pub max_in_flight: usize,
}

impl Default for HttpForwarderOptions {
    fn default() -> Self {
        Self {
            connect_timeout: HttpForwarderDefaults::CONNECT_TIMEOUT,
            request_timeout: HttpForwarderDefaults::REQUEST_TIMEOUT,
            max_in_flight: HttpForwarderDefaults::MAX_IN_FLIGHT,
        }
    }
}

/// Request body accepted by the downstream endpoint.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForwardRequest {
    pub message: String,
}

/// Successful response from the downstream endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwardReceipt {
    pub status: StatusCode,
    pub body: String,
}

#[derive(Clone, Debug)]
pub struct HttpForwarder {
    http: Client,
    endpoint: Url,
    request_timeout: Duration,
    in_flight: Arc<Semaphore>,
}

impl HttpForwarder {
    pub fn new(endpoint: &str) -> Result<Self, ForwardError> {
        Self::with_options(endpoint, HttpForwarderOptions::default())
    }

    pub fn with_options(
        endpoint: &str,
        options: HttpForwarderOptions,
    ) -> Result<Self, ForwardError> {
        let endpoint = parse_endpoint(endpoint)?;
        let http = Client::builder()
            .no_proxy()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(ForwardError::Transport)?;

        Ok(Self {
            http,
            endpoint,
            request_timeout: options.request_timeout,
            in_flight: Arc::new(Semaphore::new(options.max_in_flight.max(1))),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Posts `message` and waits for the response.
    pub async fn forward(&self, message: String) -> Result<ForwardReceipt, ForwardError> {
        let request = ForwardRequest { message };
        let response = self
            .http
            .post(self.endpoint.clone())
            .timeout(self.request_timeout)
            .json(&request)
            .send()
            .await
            .map_err(ForwardError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(ForwardError::Transport)?;

        if !status.is_success() {
            return Err(ForwardError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        Ok(ForwardReceipt { status, body })
    }
}

impl Delivery for HttpForwarder {
    /// Spawns the POST on the current runtime. `Accepted` means the request
    /// was started, not that the endpoint took it.
    fn deliver(&self, message: &Outbound<'_>) -> DeliveryOutcome {
        let Ok(runtime) = Handle::try_current() else {
            warn!(event = "http_forward_no_runtime");
            return DeliveryOutcome::Dropped;
        };
        let Ok(permit) = Arc::clone(&self.in_flight).try_acquire_owned() else {
            warn!(event = "http_forward_saturated", topic = message.topic);
            return DeliveryOutcome::Dropped;
        };

        let forwarder = self.clone();
        let body = String::from_utf8_lossy(message.raw).into_owned();
        let topic = message.category;
        runtime.spawn(async move {
            let _permit = permit;
            match forwarder.forward(body).await {
                Ok(receipt) => {
                    debug!(
                        event = "http_forwarded",
                        %topic,
                        status = %receipt.status,
                        body = %receipt.body
                    );
                }
                Err(err) => {
                    error!(event = "http_forward_failed", %topic, error = %err);
                }
            }
        });
        DeliveryOutcome::Accepted
    }
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("invalid forward url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },
}

fn parse_endpoint(raw: &str) -> Result<Url, ForwardError> {
    let invalid = |reason: String| ForwardError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };
    let url = Url::parse(raw.trim()).map_err(|err| invalid(err.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(invalid(format!("unsupported scheme `{other}`"))),
    }
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        detail: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message).or(parsed.detail) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
