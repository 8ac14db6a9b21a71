//! Common utilities for the XenOrchestra REST client
//!
//! Provides the authenticated HTTP plumbing shared by every endpoint.

pub mod query;

use crate::config::XoConfig;
use crate::error::XoError;
use reqwest::header::COOKIE;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// User agent sent with every request
pub const USER_AGENT: &str = "xo-cloud-controller-manager";

/// REST API root below the XenOrchestra URL
pub const API_ROOT: &str = "/rest/v0";

/// Credentials attached to every request
#[derive(Clone)]
enum Credentials {
    Token(String),
    Basic { username: String, password: String },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Token(_) => f.write_str("Token(..)"),
            Credentials::Basic { username, .. } => write!(f, "Basic({}, ..)", username),
        }
    }
}

/// HTTP client wrapper with authentication
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    base_url: String,
    credentials: Credentials,
}

impl HttpClient {
    /// Build the HTTP client from the cloud-config
    pub fn from_config(config: &XoConfig) -> Result<Self, XoError> {
        let mut builder = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .connect_timeout(Duration::from_secs(config.request_timeout_seconds.min(10)))
            .danger_accept_invalid_certs(config.insecure);

        if let Some(ca) = &config.ca_cert {
            let cert = reqwest::Certificate::from_pem(ca.as_bytes())
                .map_err(|e| XoError::InvalidConfig(format!("invalid caCert: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder
            .build()
            .map_err(|e| XoError::InvalidConfig(format!("failed to build HTTP client: {}", e)))?;

        let credentials = match (&config.token, &config.username, &config.password) {
            (Some(token), _, _) if !token.is_empty() => Credentials::Token(token.clone()),
            (_, Some(username), Some(password)) => Credentials::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            _ => {
                return Err(XoError::InvalidConfig(
                    "either token or username/password must be set".to_string(),
                ));
            }
        };

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build a full URL from a path relative to the REST root
    pub fn build_url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, API_ROOT, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Credentials::Token(token) => {
                request.header(COOKIE, format!("authenticationToken={}", token))
            }
            Credentials::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
        }
    }

    async fn check(response: Response, context: &str) -> Result<Response, XoError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(XoError::from_status(status, context, body.trim()))
    }

    async fn decode<T: DeserializeOwned>(response: Response, context: &str) -> Result<T, XoError> {
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            XoError::Serialization(format!(
                "{}: error decoding response body: {} - Response (first 500 chars): {}",
                context,
                e,
                text.chars().take(500).collect::<String>()
            ))
        })
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, XoError> {
        let url = self.build_url(path);
        debug!("GET {}", url);

        let response = self
            .authorize(self.client.get(&url))
            .header("Accept", "application/json")
            .send()
            .await?;

        let context = format!("GET {}", path);
        let response = Self::check(response, &context).await?;
        Self::decode(response, &context).await
    }

    /// Make a POST request and return the raw JSON answer
    pub async fn post(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value, XoError> {
        let url = self.build_url(path);
        debug!("POST {} with body: {}", url, body);

        let response = self
            .authorize(self.client.post(&url))
            .header("Accept", "application/json")
            .json(body)
            .send()
            .await?;

        let context = format!("POST {}", path);
        let response = Self::check(response, &context).await?;
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        // Action endpoints may answer with a bare string (task href or object id)
        Ok(serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text)))
    }

    /// Make a PUT request without a body
    pub async fn put(&self, path: &str) -> Result<(), XoError> {
        let url = self.build_url(path);
        debug!("PUT {}", url);

        let response = self.authorize(self.client.put(&url)).send().await?;
        Self::check(response, &format!("PUT {}", path)).await?;
        Ok(())
    }

    /// Make a DELETE request
    pub async fn delete(&self, path: &str) -> Result<(), XoError> {
        let url = self.build_url(path);
        debug!("DELETE {}", url);

        let response = self.authorize(self.client.delete(&url)).send().await?;
        Self::check(response, &format!("DELETE {}", path)).await?;
        Ok(())
    }
}
