//! Cloud-config parsing
//!
//! The host hands the provider an opaque blob. It is parsed here as YAML
//! (which also accepts JSON) and validated once, at registration time.

use crate::error::XoError;
use crate::session::{ReconnectPolicy, SessionSettings};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable that enables dual-stack node addresses
pub const DUAL_STACK_ENV: &str = "ENABLE_ALPHA_DUAL_STACK";

const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_INITIAL_BACKOFF_MILLIS: u64 = 500;
const DEFAULT_MAX_BACKOFF_SECONDS: u64 = 30;
const DEFAULT_INSTANCE_CACHE_TTL_SECONDS: u64 = 10;
const DEFAULT_LB_NAME_PREFIX: &str = "k8s-lb";

/// Parsed cloud-config
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XoConfig {
    /// XenOrchestra base URL, e.g. `https://xo.example.com`
    pub url: String,
    /// Authentication token (sent as the `authenticationToken` cookie)
    #[serde(default)]
    pub token: Option<String>,
    /// Username for HTTP basic auth, used when no token is set
    #[serde(default)]
    pub username: Option<String>,
    /// Password for HTTP basic auth
    #[serde(default)]
    pub password: Option<String>,
    /// Skip TLS certificate verification
    #[serde(default)]
    pub insecure: bool,
    /// Extra PEM-encoded CA certificate to trust
    #[serde(default)]
    pub ca_cert: Option<String>,
    /// Cluster identifier
    #[serde(default)]
    pub cluster_id: Option<String>,
    /// Restrict VM sweeps to this pool
    #[serde(default)]
    pub pool: Option<String>,
    /// Per-request timeout
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    /// Retries of transient failures after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First retry delay
    #[serde(default = "default_initial_backoff_millis")]
    pub initial_backoff_millis: u64,
    /// Backoff ceiling
    #[serde(default = "default_max_backoff_seconds")]
    pub max_backoff_seconds: u64,
    /// Behavior of calls made during a reconnection
    #[serde(default)]
    pub reconnect_policy: ReconnectPolicy,
    /// Lifetime of cached VM lookups, 0 disables the cache
    #[serde(default = "default_instance_cache_ttl_seconds")]
    pub instance_cache_ttl_seconds: u64,
    /// Report IPv6 addresses as well as IPv4 ones
    #[serde(default)]
    pub dual_stack: bool,
    /// Load balancer appliance settings
    #[serde(default)]
    pub load_balancer: Option<LoadBalancerConfig>,
}

/// Where and how load balancer VMs are created
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerConfig {
    /// UUID of the appliance VM template
    pub template: String,
    /// Pool the appliance is created in
    pub pool: String,
    /// Network the appliance's VIF is attached to; the template's VIFs otherwise
    #[serde(default)]
    pub network: Option<String>,
    /// Prefix of appliance VM names
    #[serde(default = "default_lb_name_prefix")]
    pub name_prefix: String,
}

fn default_request_timeout_seconds() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECONDS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_initial_backoff_millis() -> u64 {
    DEFAULT_INITIAL_BACKOFF_MILLIS
}

fn default_max_backoff_seconds() -> u64 {
    DEFAULT_MAX_BACKOFF_SECONDS
}

fn default_instance_cache_ttl_seconds() -> u64 {
    DEFAULT_INSTANCE_CACHE_TTL_SECONDS
}

fn default_lb_name_prefix() -> String {
    DEFAULT_LB_NAME_PREFIX.to_string()
}

impl XoConfig {
    /// Parse and validate a cloud-config blob.
    ///
    /// The dual-stack toggle is read from [`DUAL_STACK_ENV`] unless the blob
    /// already turns it on.
    pub fn from_slice(data: &[u8]) -> Result<Self, XoError> {
        if data.iter().all(u8::is_ascii_whitespace) {
            return Err(XoError::InvalidConfig("cloud-config is empty".to_string()));
        }

        let mut config: XoConfig = serde_yaml::from_slice(data)
            .map_err(|e| XoError::InvalidConfig(format!("failed to parse cloud-config: {}", e)))?;

        if !config.dual_stack {
            config.dual_stack = dual_stack_from_env();
        }

        config.validate()?;
        Ok(config)
    }

    /// Check required fields and value ranges
    pub fn validate(&self) -> Result<(), XoError> {
        let url = reqwest::Url::parse(&self.url)
            .map_err(|e| XoError::InvalidConfig(format!("invalid url {:?}: {}", self.url, e)))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(XoError::InvalidConfig(format!(
                "unsupported url scheme {:?}, expected http or https",
                url.scheme()
            )));
        }

        let has_token = self.token.as_deref().is_some_and(|t| !t.is_empty());
        let has_basic = self.username.as_deref().is_some_and(|u| !u.is_empty())
            && self.password.is_some();
        if !has_token && !has_basic {
            return Err(XoError::InvalidConfig(
                "either token or username/password must be set".to_string(),
            ));
        }

        if self.request_timeout_seconds == 0 {
            return Err(XoError::InvalidConfig(
                "requestTimeoutSeconds must be greater than zero".to_string(),
            ));
        }

        if let Some(ca) = &self.ca_cert {
            reqwest::Certificate::from_pem(ca.as_bytes())
                .map_err(|e| XoError::InvalidConfig(format!("invalid caCert: {}", e)))?;
        }

        if let Some(lb) = &self.load_balancer {
            if lb.template.is_empty() || lb.pool.is_empty() {
                return Err(XoError::InvalidConfig(
                    "loadBalancer.template and loadBalancer.pool are required".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Retry/timeout knobs for the session
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            request_timeout: Duration::from_secs(self.request_timeout_seconds),
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_millis),
            max_backoff: Duration::from_secs(self.max_backoff_seconds),
            reconnect_policy: self.reconnect_policy,
        }
    }

    /// TTL of the per-VM resolution cache
    pub fn instance_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.instance_cache_ttl_seconds)
    }
}

fn dual_stack_from_env() -> bool {
    std::env::var(DUAL_STACK_ENV)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}
