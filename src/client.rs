//! SOAP client.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use tracing::{debug, warn};

use crate::config::{ClientConfig, DEFAULT_USER_AGENT};
use crate::envelope::{Envelope, HeaderEntry};
use crate::error::SoapError;
use crate::mtom::{decode_multipart, encode_multipart, is_multipart};
use crate::parser::parse_envelope;
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, Transport};
use crate::xml::{FromElement, ToElement};

/// `Content-Type` of plain (non-MTOM) requests.
pub const PLAIN_CONTENT_TYPE: &str = "text/xml; charset=\"utf-8\"";

/// `SOAPAction` header; names are case-insensitive and sent lowercase.
const SOAP_ACTION: HeaderName = HeaderName::from_static("soapaction");

/// Longest response excerpt kept in [`SoapError::Http`].
const MAX_ERROR_BODY: usize = 512;

/// A SOAP client bound to one endpoint.
///
/// Safe to share across tasks: every call works on its own snapshot of the
/// accumulated header entries.
pub struct Client {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    headers: Mutex<Vec<HeaderEntry>>,
}

impl Client {
    /// Client with default settings talking HTTP to `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, SoapError> {
        Self::from_config(ClientConfig::new(endpoint))
    }

    pub fn from_config(config: ClientConfig) -> Result<Self, SoapError> {
        config.validate()?;
        let transport = HttpTransport::from_config(&config)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Client using a custom transport.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            headers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Marshal `value` and append it to the headers sent with every call.
    pub fn add_header<T: ToElement + ?Sized>(&self, value: &T) -> Result<(), SoapError> {
        self.add_header_entry(HeaderEntry::new(value)?);
        Ok(())
    }

    pub fn add_header_entry(&self, entry: HeaderEntry) {
        self.headers.lock().push(entry);
    }

    /// Replace all accumulated header entries.
    pub fn set_headers(&self, entries: Vec<HeaderEntry>) {
        *self.headers.lock() = entries;
    }

    pub fn clear_headers(&self) {
        self.headers.lock().clear();
    }

    /// The envelope a call with `body` would send, without sending it.
    pub fn get_request<Req: ToElement + ?Sized>(&self, body: &Req) -> Result<Envelope, SoapError> {
        Envelope::build(&self.header_snapshot(), body)
    }

    /// Send `request` and decode the response body as `Resp`.
    pub async fn call<Req, Resp>(&self, action: &str, request: &Req) -> Result<Resp, SoapError>
    where
        Req: ToElement + ?Sized,
        Resp: FromElement,
    {
        let envelope = self.call_envelope(action, request).await?;
        envelope.body_as()
    }

    /// Like [`Client::call`], writing into `reply`. `reply` is only touched
    /// when the whole response decoded successfully.
    pub async fn call_into<Req, Resp>(
        &self,
        action: &str,
        request: &Req,
        reply: &mut Resp,
    ) -> Result<(), SoapError>
    where
        Req: ToElement + ?Sized,
        Resp: FromElement,
    {
        *reply = self.call(action, request).await?;
        Ok(())
    }

    /// [`Client::call`] bounded by `deadline`; expiry cancels the request.
    pub async fn call_with_deadline<Req, Resp>(
        &self,
        action: &str,
        request: &Req,
        deadline: Duration,
    ) -> Result<Resp, SoapError>
    where
        Req: ToElement + ?Sized,
        Resp: FromElement,
    {
        let envelope = self
            .call_envelope_with_deadline(action, request, deadline)
            .await?;
        envelope.body_as()
    }

    /// [`Client::call_envelope`] bounded by `deadline`.
    pub async fn call_envelope_with_deadline<Req: ToElement + ?Sized>(
        &self,
        action: &str,
        request: &Req,
        deadline: Duration,
    ) -> Result<Envelope, SoapError> {
        with_deadline(action, deadline, self.call_envelope(action, request)).await
    }

    /// Send `request` and return the full response envelope.
    pub async fn call_envelope<Req: ToElement + ?Sized>(
        &self,
        action: &str,
        request: &Req,
    ) -> Result<Envelope, SoapError> {
        let envelope = self.get_request(request)?;
        let request = self.encode_request(action, &envelope)?;

        debug!(
            action = action,
            endpoint = %self.config.endpoint,
            size = request.body.len(),
            "Sending SOAP request"
        );

        let response = self.transport.send(request).await?;
        decode_response(action, response)
    }

    fn header_snapshot(&self) -> Vec<HeaderEntry> {
        self.headers.lock().clone()
    }

    fn encode_request(&self, action: &str, envelope: &Envelope) -> Result<HttpRequest, SoapError> {
        let (content_type, body) = if self.config.mtom && envelope.has_attachments() {
            let message = encode_multipart(envelope)?;
            (message.content_type, message.body)
        } else {
            (PLAIN_CONTENT_TYPE.to_string(), envelope.to_xml()?.into_bytes())
        };

        let user_agent = if self.config.user_agent.is_empty() {
            DEFAULT_USER_AGENT
        } else {
            self.config.user_agent.as_str()
        };

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, header_value("Content-Type", &content_type)?);
        headers.insert(SOAP_ACTION, header_value("SOAPAction", action)?);
        headers.insert(USER_AGENT, header_value("User-Agent", user_agent)?);
        // Configured headers win over the built-in ones
        for (name, value) in self.config.header_map()? {
            if let Some(name) = name {
                headers.insert(name, value);
            }
        }

        Ok(HttpRequest {
            url: self.config.endpoint.clone(),
            headers,
            body,
        })
    }
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue, SoapError> {
    HeaderValue::from_str(value)
        .map_err(|e| SoapError::encoding(format!("invalid {} header value {:?}: {}", name, value, e)))
}

async fn with_deadline<T>(
    action: &str,
    deadline: Duration,
    call: impl Future<Output = Result<T, SoapError>>,
) -> Result<T, SoapError> {
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => {
            warn!(action = action, deadline_ms = deadline.as_millis() as u64, "SOAP call deadline exceeded");
            Err(SoapError::Transport(format!(
                "call {} exceeded its deadline of {:?}",
                action, deadline
            )))
        }
    }
}

fn decode_response(action: &str, response: HttpResponse) -> Result<Envelope, SoapError> {
    let parsed = match response.content_type().filter(|ct| is_multipart(ct)) {
        Some(content_type) => {
            decode_multipart(content_type, &response.body).and_then(|(envelope, _)| envelope.check_fault())
        }
        None => parse_envelope(&response.body),
    };

    match parsed {
        Ok(envelope) if response.is_success() => {
            debug!(action = action, status = response.status, "Received SOAP response");
            Ok(envelope)
        }
        Err(SoapError::Fault(fault)) => {
            warn!(action = action, status = response.status, fault = %fault, "SOAP fault received");
            Err(SoapError::Fault(fault))
        }
        Err(e) if response.is_success() => Err(e),
        _ => {
            warn!(action = action, status = response.status, "HTTP error without SOAP fault");
            Err(SoapError::Http {
                status: response.status,
                body: String::from_utf8_lossy(&response.body)
                    .chars()
                    .take(MAX_ERROR_BODY)
                    .collect(),
            })
        }
    }
}
