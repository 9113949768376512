//! Default `StreamOpener` backed by reqwest.
//!
//! POSTs the JSON payload with bearer authentication and hands back the
//! response byte stream. Non-2xx responses are read fully so a clean
//! message can be pulled out of JSON error bodies.

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt, TryStreamExt};
use rill_types::{ByteStream, PipelineError, PipelineResult, RequestPayload};

use super::{StreamOpener, USER_AGENT};

/// HTTP transport for the streaming completion endpoint.
pub struct HttpStreamOpener {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpStreamOpener {
    /// Creates an opener for `endpoint`, validating the URL up front.
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let endpoint = endpoint.into();
        url::Url::parse(&endpoint)
            .with_context(|| format!("Invalid stream endpoint URL: {endpoint}"))?;
        Ok(Self {
            http: reqwest::Client::new(),
            endpoint,
            api_key: api_key.into(),
        })
    }
}

impl StreamOpener for HttpStreamOpener {
    fn open(&self, payload: RequestPayload) -> BoxFuture<'static, PipelineResult<ByteStream>> {
        let http = self.http.clone();
        let endpoint = self.endpoint.clone();
        let api_key = self.api_key.clone();

        async move {
            let response = http
                .post(&endpoint)
                .header("content-type", "application/json")
                .header("accept", "text/event-stream")
                .header("user-agent", USER_AGENT)
                .bearer_auth(&api_key)
                .json(&payload)
                .send()
                .await
                .map_err(classify_reqwest_error)?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(PipelineError::http_status(status.as_u16(), &body));
            }

            let stream: ByteStream = response
                .bytes_stream()
                .map_err(classify_reqwest_error)
                .boxed();
            Ok(stream)
        }
        .boxed()
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> PipelineError {
    if e.is_timeout() {
        PipelineError::transport(format!("request timed out: {e}"))
    } else {
        PipelineError::transport(format!("request failed: {e}"))
    }
}
