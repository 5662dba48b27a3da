//! WS-Security `UsernameToken` header.
//!
//! Only the `PasswordText` profile is supported; the token is an ordinary
//! header entry with `mustUnderstand` set.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use crate::envelope::HeaderEntry;
use crate::error::SoapError;
use crate::xml::{FromElement, ToElement, XmlElement};

/// WS-Security extension namespace.
pub const WSSE_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";
/// WS-Security utility namespace.
pub const WSU_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd";

const PASSWORD_TEXT: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordText";
const BASE64_BINARY: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-soap-message-security-1.0#Base64Binary";

/// A `wsse:Security` header carrying a username and clear-text password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsernameToken {
    pub username: String,
    pub password: String,
    pub nonce: Option<Vec<u8>>,
    pub created: Option<DateTime<Utc>>,
}

impl UsernameToken {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            nonce: None,
            created: None,
        }
    }

    /// Add a random 16-byte nonce.
    pub fn with_nonce(mut self) -> Self {
        self.nonce = Some(Uuid::new_v4().into_bytes().to_vec());
        self
    }

    pub fn with_created(mut self, created: DateTime<Utc>) -> Self {
        self.created = Some(created);
        self
    }

    pub fn with_created_now(self) -> Self {
        self.with_created(Utc::now())
    }

    /// The token as a `mustUnderstand` header entry.
    pub fn header_entry(&self) -> Result<HeaderEntry, SoapError> {
        Ok(HeaderEntry::new(self)?.must_understand())
    }
}

impl ToElement for UsernameToken {
    fn to_element(&self) -> Result<XmlElement, SoapError> {
        let mut token = XmlElement::new("UsernameToken");
        token.push_text_child("Username", &self.username);
        token.push_child(
            XmlElement::new("Password")
                .with_attribute("Type", PASSWORD_TEXT)
                .with_text(&self.password),
        );
        if let Some(nonce) = &self.nonce {
            token.push_child(
                XmlElement::new("Nonce")
                    .with_attribute("EncodingType", BASE64_BINARY)
                    .with_text(STANDARD.encode(nonce)),
            );
        }
        if let Some(created) = &self.created {
            token.push_child(
                XmlElement::qualified(WSU_NS, "Created")
                    .with_text(created.to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
        }

        Ok(XmlElement::qualified(WSSE_NS, "Security").with_child(token))
    }
}

impl FromElement for UsernameToken {
    /// Accepts either the `Security` header or a bare `UsernameToken`.
    fn from_element(element: &XmlElement) -> Result<Self, SoapError> {
        let token = if element.name == "Security" {
            element.require_child("UsernameToken")?
        } else {
            element
        };

        let password = token.require_child("Password")?;
        if let Some(kind) = password.attribute("Type") {
            if !kind.ends_with("#PasswordText") {
                return Err(SoapError::parse(format!("unsupported password type {}", kind)));
            }
        }

        let nonce = token
            .child("Nonce")
            .map(|n| {
                STANDARD
                    .decode(n.text().trim())
                    .map_err(|e| SoapError::parse(format!("invalid Nonce: {}", e)))
            })
            .transpose()?;

        let created = token
            .child("Created")
            .map(|c| {
                DateTime::parse_from_rfc3339(c.text().trim())
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| SoapError::parse(format!("invalid Created timestamp: {}", e)))
            })
            .transpose()?;

        Ok(Self {
            username: token.require_child("Username")?.text(),
            password: password.text(),
            nonce,
            created,
        })
    }
}
