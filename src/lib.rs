//! SOAP 1.1 client with MTOM/XOP attachment support.
//!
//! Builds SOAP envelopes around typed payloads, sends them over a pluggable
//! HTTP transport and decodes responses, including SOAP Faults and
//! `multipart/related` MTOM messages whose binary parts are referenced from
//! the XML by `xop:Include`.
//!
//! # Features
//!
//! - Envelope building and parsing (SOAP 1.1, SOAP 1.2 faults recognized)
//! - MTOM/XOP multipart encoding and decoding
//! - Client-wide header entries (`mustUnderstand` supported)
//! - WS-Security `UsernameToken` headers
//! - YAML configuration, basic auth, timeouts
//!
//! # Example
//!
//! ```ignore
//! use zentinel_soap_client::{Client, ClientConfig};
//!
//! let client = Client::from_config(ClientConfig::new("https://example.com/service").with_mtom())?;
//! let reply: PingResponse = client.call("GetData", &Ping::new("Hi")).await?;
//! ```

pub mod binary;
pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod mtom;
pub mod parser;
pub mod security;
pub mod transport;
pub mod xml;

pub use binary::Binary;
pub use client::Client;
pub use config::{BasicAuth, ClientConfig};
pub use envelope::{Envelope, HeaderEntry};
pub use error::{Fault, SoapError};
pub use mtom::{decode_multipart, encode_multipart, MultipartMessage};
pub use parser::parse_envelope;
pub use security::UsernameToken;
pub use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Transport};
pub use xml::{FromElement, ToElement, XmlElement, XmlNode};
