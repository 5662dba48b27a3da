//! Error types for the SOAP client.

use std::fmt;

use thiserror::Error;

use crate::xml::{BinaryMode, XmlElement, XmlWriter, SOAP12_ENV_NS, SOAP_ENV_NS, XML_NS};

/// SOAP client errors.
#[derive(Error, Debug)]
pub enum SoapError {
    /// Network or IO failure while talking to the endpoint
    #[error("Transport error: {0}")]
    Transport(String),

    /// Non-2xx response that did not carry a SOAP Fault
    #[error("HTTP error {status}: {body}")]
    Http { status: u16, body: String },

    /// The server answered with a well-formed SOAP Fault
    #[error("SOAP fault: {0}")]
    Fault(Box<Fault>),

    /// Malformed envelope XML, multipart framing or XOP references
    #[error("Parse error: {0}")]
    Parse(String),

    /// A payload could not be serialized
    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SoapError {
    /// True for failures below the SOAP layer (network, timeouts, bare HTTP errors).
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Http { .. })
    }

    /// The fault carried by this error, if any.
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Self::Fault(fault) => Some(&**fault),
            _ => None,
        }
    }

    pub(crate) fn parse(message: impl Into<String>) -> Self {
        Self::Parse(message.into())
    }

    pub(crate) fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding(message.into())
    }
}

impl From<Fault> for SoapError {
    fn from(fault: Fault) -> Self {
        Self::Fault(Box::new(fault))
    }
}

/// A SOAP Fault returned by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    /// `faultcode` (SOAP 1.1) or `Code/Value` (SOAP 1.2)
    pub code: String,
    /// `faultstring` (SOAP 1.1) or `Reason/Text` (SOAP 1.2)
    pub string: String,
    /// `faultactor`, when present
    pub actor: Option<String>,
    /// Raw `detail` element, when present
    pub detail: Option<XmlElement>,
}

impl Fault {
    /// Create a fault with a code and a human-readable string.
    pub fn new(code: impl Into<String>, string: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            string: string.into(),
            actor: None,
            detail: None,
        }
    }

    /// Attach a `detail` element (written as-is inside the Fault).
    pub fn with_detail(mut self, detail: XmlElement) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Render this fault as a complete envelope document, as a service
    /// would send it. Used to script [`Transport`](crate::transport::Transport)
    /// implementations and mock servers.
    pub fn to_envelope_xml(&self, version: SoapFaultVersion) -> Result<String, SoapError> {
        let (ns, fault) = match version {
            SoapFaultVersion::Soap11 => (SOAP_ENV_NS, self.soap_11_element()),
            SoapFaultVersion::Soap12 => (SOAP12_ENV_NS, self.soap_12_element()),
        };
        let envelope = XmlElement::qualified(ns, "Envelope")
            .with_child(XmlElement::qualified(ns, "Body").with_child(fault));

        let mut writer = XmlWriter::new(BinaryMode::Inline);
        writer.write_declaration()?;
        writer.write_root(&envelope)?;
        writer.finish()
    }

    fn soap_11_element(&self) -> XmlElement {
        let mut fault = XmlElement::qualified(SOAP_ENV_NS, "Fault");
        fault.push_text_child("faultcode", &self.code);
        fault.push_text_child("faultstring", &self.string);
        if let Some(actor) = &self.actor {
            fault.push_text_child("faultactor", actor);
        }
        if let Some(detail) = &self.detail {
            fault.push_child(detail.clone());
        }
        fault
    }

    fn soap_12_element(&self) -> XmlElement {
        let mut fault = XmlElement::qualified(SOAP12_ENV_NS, "Fault")
            .with_child(
                XmlElement::qualified(SOAP12_ENV_NS, "Code")
                    .with_child(XmlElement::qualified(SOAP12_ENV_NS, "Value").with_text(&self.code)),
            )
            .with_child(
                XmlElement::qualified(SOAP12_ENV_NS, "Reason").with_child(
                    XmlElement::qualified(SOAP12_ENV_NS, "Text")
                        .with_namespaced_attribute(XML_NS, "lang", "en")
                        .with_text(&self.string),
                ),
            );
        if let Some(actor) = &self.actor {
            fault.push_child(XmlElement::qualified(SOAP12_ENV_NS, "Role").with_text(actor));
        }
        if let Some(detail) = &self.detail {
            fault.push_child(detail.clone());
        }
        fault
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.string)
    }
}

/// SOAP Fault version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoapFaultVersion {
    Soap11,
    Soap12,
}
