use crate::model::RequestDescriptor;
use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server responded {status}: {body}")]
    Status { status: StatusCode, body: String },
}

impl ReplayError {
    /// True when the failure looks like lost connectivity rather than a
    /// server-side rejection, i.e. the request is worth queuing.
    pub fn is_connectivity(&self) -> bool {
        match self {
            ReplayError::Transport(err) => is_replayable_failure(err),
            _ => false,
        }
    }
}

/// Connect failures and timeouts are connectivity-class; anything with a
/// response is not.
pub fn is_replayable_failure(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout() || (err.is_request() && err.status().is_none())
}

/// Re-issues a stored request.
#[async_trait]
pub trait Replayer: Send + Sync {
    async fn replay(&self, request: &RequestDescriptor) -> Result<(), ReplayError>;
}

#[derive(Clone)]
pub struct HttpReplayer {
    http: Client,
    base_url: Url,
}

impl fmt::Debug for HttpReplayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpReplayer")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpReplayer {
    pub fn new(base_url: Url, timeout: Duration) -> reqwest::Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("pickup-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self { http, base_url })
    }

    /// Relative urls are resolved against the API base url.
    pub fn resolve_url(&self, url: &str) -> Result<Url, ReplayError> {
        match Url::parse(url) {
            Ok(abs) => Ok(abs),
            Err(_) => self
                .base_url
                .join(url)
                .map_err(|err| ReplayError::Invalid(format!("bad url {url}: {err}"))),
        }
    }

    /// Build the exact request a stored descriptor describes.
    pub fn build_request(&self, request: &RequestDescriptor) -> Result<reqwest::Request, ReplayError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| ReplayError::Invalid(format!("bad method {}", request.method)))?;
        let url = self.resolve_url(&request.url)?;
        let mut builder = self.http.request(method, url);
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ReplayError::Invalid(format!("bad header name {name}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| ReplayError::Invalid(format!("bad header value for {name}")))?;
            builder = builder.header(name, value);
        }
        // string bodies were captured already encoded (form data, text)
        builder = match &request.body {
            Some(Value::String(raw)) => builder.body(raw.clone()),
            Some(body) => builder.json(body),
            None => builder,
        };
        Ok(builder.build()?)
    }
}

#[async_trait]
impl Replayer for HttpReplayer {
    async fn replay(&self, request: &RequestDescriptor) -> Result<(), ReplayError> {
        let built = self.build_request(request)?;
        debug!(method = %built.method(), url = %built.url(), "replaying request");
        let res = self.http.execute(built).await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(ReplayError::Status { status, body });
        }
        Ok(())
    }
}
