//! Remote API transport and wire types.

use async_trait::async_trait;
use log::warn;
use serde::Deserialize;

use crate::config::PoolConfig;
use crate::egress::Egress;
use crate::error::{TransportError, TransportErrorKind};

/// Envelope returned by every remote endpoint: `{code, data: {...}}`.
/// Code `0` means success; negative codes are rejected by the transport.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse {
    pub code: i64,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ApiResponse {
    /// Reject responses with a negative code. Implementations of
    /// [`ApiTransport`] apply this before returning.
    pub fn check(self, url: &str) -> Result<Self, TransportError> {
        if self.code < 0 {
            warn!("Remote {} answered with negative code {}", url, self.code);
            return Err(TransportError::new(TransportErrorKind::Protocol, url));
        }
        Ok(self)
    }
}

/// Transport seam for all remote calls.
///
/// One implementation speaks HTTP through the worker's egress; tests
/// substitute an in-memory fake. Implementations must classify every
/// failure into a [`TransportErrorKind`] and reject negative codes.
#[async_trait]
pub trait ApiTransport: Send + Sync {
    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
        egress: &Egress,
        bearer: &str,
    ) -> Result<ApiResponse, TransportError>;
}

/// reqwest-backed transport. A fresh client is built per call so each
/// request is bound to its worker's egress.
pub struct HttpTransport {
    timeout: std::time::Duration,
    user_agent: String,
    origin: Option<String>,
    referer: Option<String>,
}

impl HttpTransport {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            timeout: config.api_timeout,
            user_agent: config.user_agent.clone(),
            origin: config.origin.clone(),
            referer: config.referer.clone(),
        }
    }

    fn classify(err: reqwest::Error, url: &str) -> TransportError {
        let kind = if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::Connect
        } else if let Some(status) = err.status() {
            TransportErrorKind::ServerError(status.as_u16())
        } else {
            TransportErrorKind::Protocol
        };
        TransportError::new(kind, url)
    }
}

#[async_trait]
impl ApiTransport for HttpTransport {
    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
        egress: &Egress,
        bearer: &str,
    ) -> Result<ApiResponse, TransportError> {
        let proxy = reqwest::Proxy::all(egress.addr())
            .map_err(|e| Self::classify(e, url))?;

        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .proxy(proxy)
            .user_agent(&self.user_agent)
            .build()
            .map_err(|e| Self::classify(e, url))?;

        let mut request = client
            .post(url)
            .bearer_auth(bearer)
            .header("Accept", "application/json, text/plain, */*")
            .json(body);
        if let Some(origin) = &self.origin {
            request = request.header("Origin", origin.as_str());
        }
        if let Some(referer) = &self.referer {
            request = request.header("Referer", referer.as_str());
        }

        let response = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Self::classify(e, url))?;

        let parsed: ApiResponse = response
            .json()
            .await
            .map_err(|e| Self::classify(e, url))?;

        parsed.check(url)
    }
}
