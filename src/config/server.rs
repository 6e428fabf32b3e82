use std::{net::IpAddr, time::Duration};

use serde::{Deserialize, Serialize};

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request body size limit in bytes.
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,

    /// HTTP client configuration for metadata fetches.
    #[serde(default)]
    pub http_client: HttpClientConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
            http_client: HttpClientConfig::default(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    8080
}

fn default_body_limit() -> usize {
    1024 * 1024 // 1 MB
}

/// HTTP client configuration for outbound metadata requests.
///
/// Per-source fetch timeouts are configured on each metadata source; these
/// settings apply to the shared connection pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpClientConfig {
    /// Connection timeout in seconds.
    #[serde(default = "default_http_client_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle connection timeout in seconds.
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// User-Agent header to send with requests.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_http_client_connect_timeout(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl HttpClientConfig {
    /// Build a reqwest Client from this configuration.
    pub fn build_client(&self) -> Result<reqwest::Client, reqwest::Error> {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(self.pool_idle_timeout_secs))
            .user_agent(&self.user_agent)
            .build()
    }
}

// Default: 5 seconds to establish connection
fn default_http_client_connect_timeout() -> u64 {
    5
}

// Default: 90 seconds idle timeout
fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_user_agent() -> String {
    format!("saml-broker/{}", env!("CARGO_PKG_VERSION"))
}
