//! Shared plumbing for sending telemetry to remote collectors.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable as _};
use bytes::Bytes;
use prost::Message;
use reqwest::{header::CONTENT_TYPE, Client};
use serde::Serialize;
use snafu::ResultExt as _;
use tracing::debug;

use crate::error::{Encode, ExportError, Rejected, Timeout, Transport};

const JSON_CONTENT_TYPE: &str = "application/json";
const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

/// Deadline and retry settings for requests to remote collectors.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RemoteSettings {
    /// Deadline for each individual request.
    pub timeout: Duration,

    /// Maximum number of retries after the initial attempt.
    pub max_retries: usize,

    /// Backoff before the first retry.
    pub min_backoff: Duration,

    /// Upper bound on the backoff between retries.
    pub max_backoff: Duration,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_retries: 3,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Normalizes a collector endpoint into a full URL with the given path.
///
/// Bare `host:port` endpoints are assumed to be plain HTTP.
pub(crate) fn endpoint_url(endpoint: &str, path: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    let base = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    };

    if base.ends_with(path) {
        base
    } else {
        format!("{}{}", base, path)
    }
}

/// Posts encoded payloads to a remote collector, with a per-request deadline and bounded retries.
#[derive(Clone, Debug)]
pub(crate) struct HttpPoster {
    client: Client,
    sink: &'static str,
    url: String,
    settings: RemoteSettings,
}

impl HttpPoster {
    pub(crate) fn new(sink: &'static str, url: String, settings: RemoteSettings) -> Result<Self, ExportError> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .context(Transport { sink, endpoint: &url })?;

        Ok(Self {
            client,
            sink,
            url,
            settings,
        })
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    pub(crate) async fn post_json<T: Serialize>(&self, body: &T) -> Result<(), ExportError> {
        let payload = serde_json::to_vec(body).context(Encode { sink: self.sink })?;
        self.post(JSON_CONTENT_TYPE, payload.into()).await
    }

    pub(crate) async fn post_protobuf<M: Message>(&self, message: &M) -> Result<(), ExportError> {
        self.post(PROTOBUF_CONTENT_TYPE, message.encode_to_vec().into()).await
    }

    async fn post(&self, content_type: &'static str, payload: Bytes) -> Result<(), ExportError> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.settings.min_backoff)
            .with_max_delay(self.settings.max_backoff)
            .with_max_times(self.settings.max_retries);

        (|| self.post_once(content_type, payload.clone()))
            .retry(backoff)
            .when(ExportError::is_retryable)
            .notify(|e, delay| {
                debug!(sink = self.sink, error = %e, "Export request failed. Retrying in {:?}...", delay);
            })
            .await
    }

    async fn post_once(&self, content_type: &'static str, payload: Bytes) -> Result<(), ExportError> {
        let response = match self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, content_type)
            .body(payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Timeout {
                    sink: self.sink,
                    endpoint: &self.url,
                    timeout: self.settings.timeout,
                }
                .fail()
            }
            Err(e) => {
                return Err(e).context(Transport {
                    sink: self.sink,
                    endpoint: &self.url,
                })
            }
        };

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Rejected {
                sink: self.sink,
                endpoint: &self.url,
                status: status.as_u16(),
            }
            .fail()
        }
    }
}
