//! Configuration types for the SOAP client.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::SoapError;

/// Default `User-Agent` sent with every request.
pub const DEFAULT_USER_AGENT: &str = "gowsdl/0.1";

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Service endpoint URL
    pub endpoint: String,

    /// `User-Agent` header value
    pub user_agent: String,

    /// Send requests carrying attachments as MTOM multipart messages
    pub mtom: bool,

    /// Extra HTTP headers, applied after the built-in ones
    pub http_headers: BTreeMap<String, String>,

    /// Whole-request timeout in seconds
    pub timeout_secs: u64,

    /// TCP/TLS connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// HTTP basic authentication
    pub basic_auth: Option<BasicAuth>,

    /// Skip TLS certificate verification (testing only)
    pub accept_invalid_certs: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            mtom: false,
            http_headers: BTreeMap::new(),
            timeout_secs: 30,
            connect_timeout_secs: 90,
            basic_auth: None,
            accept_invalid_certs: false,
        }
    }
}

/// HTTP basic authentication credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl ClientConfig {
    /// Configuration for an endpoint with every other setting at its default.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Parse a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, SoapError> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| SoapError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SoapError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    pub fn validate(&self) -> Result<(), SoapError> {
        if self.endpoint.trim().is_empty() {
            return Err(SoapError::Config("endpoint must be set".to_string()));
        }
        if self.timeout_secs == 0 {
            return Err(SoapError::Config("timeout_secs must be greater than zero".to_string()));
        }
        if self.connect_timeout_secs == 0 {
            return Err(SoapError::Config(
                "connect_timeout_secs must be greater than zero".to_string(),
            ));
        }
        self.header_map()?;
        Ok(())
    }

    /// The extra HTTP headers as a typed header map.
    pub fn header_map(&self) -> Result<HeaderMap, SoapError> {
        let mut headers = HeaderMap::with_capacity(self.http_headers.len());
        for (name, value) in &self.http_headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| SoapError::Config(format!("invalid HTTP header name {:?}: {}", name, e)))?;
            let header_value = HeaderValue::from_str(value).map_err(|e| {
                SoapError::Config(format!("invalid value for HTTP header {:?}: {}", name, e))
            })?;
            headers.insert(header_name, header_value);
        }
        Ok(headers)
    }

    pub fn with_mtom(mut self) -> Self {
        self.mtom = true;
        self
    }

    /// Replace the extra HTTP headers.
    pub fn with_http_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.http_headers = headers;
        self
    }

    pub fn with_http_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.http_headers.insert(name.into(), value.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Set the request and connect timeouts.
    pub fn with_timeout(mut self, request: Duration, connect: Duration) -> Self {
        self.timeout_secs = request.as_secs().max(1);
        self.connect_timeout_secs = connect.as_secs().max(1);
        self
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some(BasicAuth {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
