//! HTTP transport.
//!
//! The client talks to the network only through [`Transport`], so tests and
//! embedders can swap in their own implementation.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use tracing::{debug, trace};

use crate::config::{BasicAuth, ClientConfig};
use crate::error::SoapError;

/// An outgoing POST request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// A received HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The `Content-Type` header, if present and valid UTF-8.
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }
}

/// Sends one SOAP request and returns the raw response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, SoapError>;
}

/// [`Transport`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    basic_auth: Option<BasicAuth>,
}

impl HttpTransport {
    /// Build a transport honoring the timeouts, TLS and auth settings.
    pub fn from_config(config: &ClientConfig) -> Result<Self, SoapError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.connect_timeout())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| SoapError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            basic_auth: config.basic_auth.clone(),
        })
    }

    /// Wrap an existing `reqwest` client.
    pub fn with_client(client: reqwest::Client, basic_auth: Option<BasicAuth>) -> Self {
        Self { client, basic_auth }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, SoapError> {
        let HttpRequest { url, headers, body } = request;

        let mut builder = self.client.post(&url).headers(headers);
        if let Some(auth) = &self.basic_auth {
            builder = builder.basic_auth(&auth.username, Some(&auth.password));
        }

        trace!(url = %url, size = body.len(), "Sending HTTP request");
        let response = builder
            .body(body)
            .send()
            .await
            .map_err(|e| SoapError::Transport(format!("request to {} failed: {}", url, e)))?;

        let status = response.status().as_u16();
        let response_headers = response.headers().clone();

        let body = response
            .bytes()
            .await
            .map_err(|e| SoapError::Transport(format!("failed to read response body: {}", e)))?
            .to_vec();

        debug!(url = %url, status = status, size = body.len(), "Received HTTP response");

        Ok(HttpResponse {
            status,
            headers: response_headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_response_helpers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/xml"));
        let response = HttpResponse {
            status: 204,
            headers,
            body: Vec::new(),
        };
        assert!(response.is_success());
        assert_eq!(response.content_type(), Some("text/xml"));

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_bytes(b"text/\xffxml").unwrap());
        let response = HttpResponse {
            status: 500,
            headers,
            body: Vec::new(),
        };
        assert!(!response.is_success());
        assert!(response.headers.contains_key(CONTENT_TYPE));
        assert_eq!(response.content_type(), None);
    }

    #[test]
    fn test_transport_from_config() {
        let config = ClientConfig::new("https://localhost/").with_basic_auth("u", "p");
        let transport = HttpTransport::from_config(&config).unwrap();
        assert_eq!(transport.basic_auth.map(|a| a.username), Some("u".to_string()));
    }
}
