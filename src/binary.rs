//! Binary attachments carried as MTOM parts.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

/// Content type used when the caller does not set one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// An opaque binary payload flagged for MTOM optimization.
///
/// Payload types place a `Binary` in their element tree (see
/// [`XmlElement::with_binary`](crate::xml::XmlElement::with_binary)) to mark a
/// field as an attachment. In MTOM mode it travels as its own MIME part and
/// is referenced from the envelope with `xop:Include`; otherwise it is inlined
/// as base64 text.
///
/// Cloning is cheap: the bytes are shared and never mutated.
#[derive(Clone, PartialEq, Eq)]
pub struct Binary {
    bytes: Arc<[u8]>,
    content_type: String,
    content_id: String,
}

impl Binary {
    /// Create an attachment with a freshly generated content id.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: Arc::from(bytes.into()),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            content_id: generate_content_id(),
        }
    }

    /// Rebuild an attachment received on the wire, keeping its content id.
    pub(crate) fn from_part(
        bytes: Vec<u8>,
        content_type: impl Into<String>,
        content_id: impl Into<String>,
    ) -> Self {
        Self {
            bytes: Arc::from(bytes),
            content_type: content_type.into(),
            content_id: content_id.into(),
        }
    }

    /// Set the MIME type, keeping the same content id.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) -> &mut Self {
        self.content_type = content_type.into();
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Content id without angle brackets.
    pub fn content_id(&self) -> &str {
        &self.content_id
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for Binary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binary")
            .field("content_id", &self.content_id)
            .field("content_type", &self.content_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

fn generate_content_id() -> String {
    format!("{}@zentinel-soap", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_binary_defaults() {
        let binary = Binary::new(b"Attached data".to_vec());
        assert_eq!(binary.bytes(), b"Attached data");
        assert_eq!(binary.content_type(), DEFAULT_CONTENT_TYPE);
        assert!(binary.content_id().ends_with("@zentinel-soap"));
        assert_eq!(binary.len(), 13);
    }

    #[test]
    fn test_content_ids_are_unique() {
        let a = Binary::new(Vec::new());
        let b = Binary::new(Vec::new());
        assert_ne!(a.content_id(), b.content_id());
        assert!(a.is_empty());
    }

    #[test]
    fn test_content_type_keeps_identity() {
        let binary = Binary::new("data");
        let id = binary.content_id().to_string();

        let mut binary = binary.with_content_type("text/plain");
        assert_eq!(binary.content_id(), id);
        assert_eq!(binary.content_type(), "text/plain");

        binary.set_content_type("image/png");
        assert_eq!(binary.content_id(), id);
        assert_eq!(binary.content_type(), "image/png");
    }

    #[test]
    fn test_debug_omits_bytes() {
        let binary = Binary::new(vec![0u8; 4096]);
        let debug = format!("{:?}", binary);
        assert!(debug.contains("len: 4096"));
        assert!(debug.len() < 200);
    }
}
