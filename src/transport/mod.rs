//! HTTP transport seam.
//!
//! The executor never talks to reqwest directly. It hands a
//! [`RequestDescriptor`] to a [`Transport`] and gets back either a response
//! (any status) or a [`TransportError`] when no response arrived.

use crate::config::TransportConfig;
use crate::errors::{ConfigError, TransportError};
use crate::types::{HttpResponse, RequestDescriptor};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;

/// GitHub media type sent in the Accept header.
pub const GITHUB_MEDIA_TYPE: &str = "application/vnd.github+json";

/// Sends one HTTP request.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends the request and returns the response, whatever its status.
    async fn send(&self, request: &RequestDescriptor) -> Result<HttpResponse, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: &RequestDescriptor) -> Result<HttpResponse, TransportError> {
        (**self).send(request).await
    }
}

/// Transport backed by a pooled reqwest client.
pub struct ReqwestTransport {
    http: Client,
    token: Option<SecretString>,
    user_agent: String,
    api_version: String,
}

impl std::fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestTransport")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("user_agent", &self.user_agent)
            .field("api_version", &self.api_version)
            .finish()
    }
}

impl ReqwestTransport {
    /// Creates a transport from configuration.
    pub fn new(config: TransportConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool.max_idle_per_host)
            .pool_idle_timeout(config.pool.idle_timeout)
            .build()
            .map_err(|e| ConfigError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            token: config.token,
            user_agent: config.user_agent,
            api_version: config.api_version,
        })
    }

    /// Creates a transport around an existing client.
    pub fn with_client(http: Client, config: TransportConfig) -> Self {
        Self {
            http,
            token: config.token,
            user_agent: config.user_agent,
            api_version: config.api_version,
        }
    }

    fn build_url(request: &RequestDescriptor) -> Result<String, TransportError> {
        if request.params.is_empty() {
            return Ok(request.url.clone());
        }
        let query = serde_urlencoded::to_string(&request.params)
            .map_err(|e| TransportError::InvalidRequest(format!("Failed to encode params: {}", e)))?;
        let separator = if request.url.contains('?') { '&' } else { '?' };
        Ok(format!("{}{}{}", request.url, separator, query))
    }

    fn map_error(error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout(error.to_string())
        } else if error.is_connect() {
            TransportError::Connect(error.to_string())
        } else if error.is_builder() {
            TransportError::InvalidRequest(error.to_string())
        } else {
            TransportError::Other(error.to_string())
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &RequestDescriptor) -> Result<HttpResponse, TransportError> {
        let url = Self::build_url(request)?;

        let mut builder = self
            .http
            .request(request.method.into(), &url)
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT, GITHUB_MEDIA_TYPE)
            .header("X-GitHub-Api-Version", &self.api_version);

        let caller_auth = request
            .headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case(AUTHORIZATION.as_str()));
        if let (Some(token), false) = (&self.token, caller_auth) {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token.expose_secret()));
        }

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(Self::map_error)?;

        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(Self::map_error)?;

        Ok(HttpResponse::new(status, headers, body))
    }
}
