//! SOAP envelope model.

use crate::binary::Binary;
use crate::error::{Fault, SoapError};
use crate::xml::{
    BinaryMode, FromElement, ToElement, XmlElement, XmlNode, XmlWriter, SOAP12_ENV_NS,
    SOAP_ENV_NS,
};

/// A header block plus its `mustUnderstand` flag.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderEntry {
    element: XmlElement,
    must_understand: bool,
}

impl HeaderEntry {
    /// Marshal a header value. The entry keeps its own copy of the XML.
    pub fn new<T: ToElement + ?Sized>(value: &T) -> Result<Self, SoapError> {
        Ok(Self::from_element(value.to_element()?))
    }

    pub fn from_element(element: XmlElement) -> Self {
        Self {
            element,
            must_understand: false,
        }
    }

    /// Flag the header with `soap:mustUnderstand="1"`.
    pub fn must_understand(mut self) -> Self {
        self.must_understand = true;
        self
    }

    pub fn is_must_understand(&self) -> bool {
        self.must_understand
    }

    pub fn element(&self) -> &XmlElement {
        &self.element
    }

    fn to_header_element(&self) -> XmlElement {
        let mut element = self.element.clone();
        if self.must_understand {
            element.set_attribute(Some(SOAP_ENV_NS.to_string()), "mustUnderstand", "1");
        }
        element
    }
}

/// A SOAP envelope: ordered header blocks and exactly one body payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    headers: Vec<XmlElement>,
    body: XmlElement,
}

impl Envelope {
    /// Wrap a body payload and header entries. The payload's root element
    /// keeps its own name and namespace.
    pub fn build<T: ToElement + ?Sized>(
        headers: &[HeaderEntry],
        body: &T,
    ) -> Result<Self, SoapError> {
        let mut body = body.to_element()?;
        body.validate()?;
        body.normalize("");

        let headers = headers
            .iter()
            .map(|entry| {
                let mut element = entry.to_header_element();
                element.validate()?;
                element.normalize("");
                Ok(element)
            })
            .collect::<Result<Vec<_>, SoapError>>()?;

        Ok(Self { headers, body })
    }

    /// Build an envelope from a parsed `Envelope` root element.
    pub fn from_root(root: XmlElement) -> Result<Self, SoapError> {
        let envelope_ns = match root.namespace.as_deref() {
            Some(ns @ (SOAP_ENV_NS | SOAP12_ENV_NS)) if root.name == "Envelope" => ns.to_string(),
            _ => {
                return Err(SoapError::parse(format!(
                    "expected a SOAP Envelope root element, found <{}>",
                    root.name
                )))
            }
        };

        let mut headers = Vec::new();
        let mut body = None;
        for node in root.children {
            let XmlNode::Element(section) = node else {
                continue;
            };
            if section.namespace.as_deref() != Some(envelope_ns.as_str()) {
                continue;
            }
            match section.name.as_str() {
                "Header" if body.is_none() => {
                    headers.extend(section.children.into_iter().filter_map(|n| match n {
                        XmlNode::Element(e) => Some(e),
                        _ => None,
                    }));
                }
                "Body" => {
                    let payload = section.children.into_iter().find_map(|n| match n {
                        XmlNode::Element(e) => Some(e),
                        _ => None,
                    });
                    body = Some(payload.ok_or_else(|| SoapError::parse("SOAP Body is empty"))?);
                }
                _ => {}
            }
        }

        let body = body.ok_or_else(|| SoapError::parse("SOAP Envelope has no Body"))?;
        Ok(Self { headers, body })
    }

    /// Parse envelope XML without checking for a Fault.
    pub fn from_xml(data: &[u8]) -> Result<Self, SoapError> {
        let document = crate::parser::parse_document(data)?;
        Self::from_root(document.root)
    }

    pub fn headers(&self) -> &[XmlElement] {
        &self.headers
    }

    pub fn body(&self) -> &XmlElement {
        &self.body
    }

    /// Decode the body payload into a typed value.
    pub fn body_as<T: FromElement>(&self) -> Result<T, SoapError> {
        T::from_element(&self.body)
    }

    /// First header block with the given local name, decoded.
    pub fn header_as<T: FromElement>(&self, name: &str) -> Result<Option<T>, SoapError> {
        self.headers
            .iter()
            .find(|h| h.name == name)
            .map(T::from_element)
            .transpose()
    }

    /// The Fault carried in the body, if any.
    pub fn fault(&self) -> Option<Fault> {
        let body = &self.body;
        let in_envelope_ns = matches!(body.namespace.as_deref(), Some(SOAP_ENV_NS | SOAP12_ENV_NS));
        if body.name != "Fault" || !in_envelope_ns {
            return None;
        }

        // SOAP 1.2 nests the code and reason
        if let Some(code) = body.child("Code") {
            return Some(Fault {
                code: code.child_text("Value").unwrap_or_default(),
                string: body
                    .child("Reason")
                    .and_then(|r| r.child_text("Text"))
                    .unwrap_or_default(),
                actor: body.child_text("Role"),
                detail: body.child("Detail").cloned(),
            });
        }

        Some(Fault {
            code: body.child_text("faultcode").unwrap_or_default(),
            string: body.child_text("faultstring").unwrap_or_default(),
            actor: body.child_text("faultactor"),
            detail: body.child("detail").cloned(),
        })
    }

    /// `Err(SoapError::Fault)` when the body is a Fault, the envelope otherwise.
    pub fn check_fault(self) -> Result<Self, SoapError> {
        match self.fault() {
            Some(fault) => Err(fault.into()),
            None => Ok(self),
        }
    }

    /// Attachments referenced anywhere in the envelope, in document order.
    pub fn attachments(&self) -> Vec<&Binary> {
        let mut found: Vec<&Binary> = Vec::new();
        for element in self.headers.iter().chain(std::iter::once(&self.body)) {
            for binary in element.binaries() {
                if !found.iter().any(|b| b.content_id() == binary.content_id()) {
                    found.push(binary);
                }
            }
        }
        found
    }

    pub fn has_attachments(&self) -> bool {
        !self.attachments().is_empty()
    }

    /// Serialize as a standalone document, inlining attachments as base64.
    pub fn to_xml(&self) -> Result<String, SoapError> {
        self.write(BinaryMode::Inline)
    }

    pub(crate) fn write(&self, mode: BinaryMode) -> Result<String, SoapError> {
        let mut writer = XmlWriter::new(mode);
        writer.write_declaration()?;
        writer.write_root(&self.to_element())?;
        writer.finish()
    }

    /// The full `soap:Envelope` element. Header is left out when empty.
    pub fn to_element(&self) -> XmlElement {
        let mut envelope = XmlElement::qualified(SOAP_ENV_NS, "Envelope");
        if !self.headers.is_empty() {
            let mut header = XmlElement::qualified(SOAP_ENV_NS, "Header");
            header.children = self.headers.iter().cloned().map(XmlNode::Element).collect();
            envelope.push_child(header);
        }
        envelope.push_child(XmlElement::qualified(SOAP_ENV_NS, "Body").with_child(self.body.clone()));
        envelope
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_envelope;

    struct Credentials {
        login: String,
        password: String,
    }

    impl ToElement for Credentials {
        fn to_element(&self) -> Result<XmlElement, SoapError> {
            let mut element = XmlElement::qualified("http://www.namespace.ninja", "Credentials");
            element.push_text_child("Login", &self.login);
            element.push_text_child("Password", &self.password);
            Ok(element)
        }
    }

    fn ping(message: &str) -> XmlElement {
        let mut element = XmlElement::qualified("http://example.com/service.xsd", "Ping");
        element.push_child(XmlElement::new("request").with_child(XmlElement::new("Message").with_text(message)));
        element
    }

    #[test]
    fn test_build_without_headers_omits_header() {
        let envelope = Envelope::build(&[], &ping("Hi")).unwrap();
        let xml = envelope.to_xml().unwrap();
        assert!(!xml.contains("Header"));
        assert_eq!(
            xml,
            r#"<?xml version="1.0" encoding="UTF-8"?><soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><Ping xmlns="http://example.com/service.xsd"><request><Message>Hi</Message></request></Ping></soap:Body></soap:Envelope>"#
        );
    }

    #[test]
    fn test_build_keeps_header_order_and_must_understand() {
        let first = HeaderEntry::new(&Credentials {
            login: "a".into(),
            password: "b".into(),
        })
        .unwrap();
        let second = HeaderEntry::from_element(XmlElement::qualified("urn:trace", "TraceId").with_text("42"))
            .must_understand();

        let envelope = Envelope::build(&[first, second], &ping("Hi")).unwrap();
        let names: Vec<&str> = envelope.headers().iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["Credentials", "TraceId"]);

        let xml = envelope.to_xml().unwrap();
        assert!(xml.contains(r#"<TraceId xmlns="urn:trace" soap:mustUnderstand="1">42</TraceId>"#));
        assert!(xml.find("<soap:Header>").unwrap() < xml.find("<soap:Body>").unwrap());
    }

    #[test]
    fn test_plain_xml_round_trip() {
        let header = HeaderEntry::new(&Credentials {
            login: "user".into(),
            password: "secret".into(),
        })
        .unwrap()
        .must_understand();
        let envelope = Envelope::build(&[header], &ping("Hi")).unwrap();

        let parsed = parse_envelope(envelope.to_xml().unwrap().as_bytes()).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_whitespace_and_empty_text_round_trip() {
        for message in ["   ", " ", ""] {
            let envelope = Envelope::build(&[], &ping(message)).unwrap();
            let parsed = parse_envelope(envelope.to_xml().unwrap().as_bytes()).unwrap();
            assert_eq!(parsed, envelope, "message {:?}", message);

            let text = parsed
                .body()
                .child("request")
                .and_then(|r| r.child_text("Message"))
                .unwrap();
            assert_eq!(text, message);
        }
    }

    #[test]
    fn test_build_rejects_unserializable_payload() {
        let err = Envelope::build(&[], &XmlElement::new("not valid")).unwrap_err();
        assert!(matches!(err, SoapError::Encoding(_)));
    }

    #[test]
    fn test_from_root_requires_envelope_and_body() {
        let not_envelope = XmlElement::qualified("urn:x", "Envelope");
        assert!(Envelope::from_root(not_envelope).is_err());

        let no_body = XmlElement::qualified(SOAP_ENV_NS, "Envelope");
        assert!(Envelope::from_root(no_body).is_err());

        let empty_body = XmlElement::qualified(SOAP_ENV_NS, "Envelope")
            .with_child(XmlElement::qualified(SOAP_ENV_NS, "Body"));
        assert!(Envelope::from_root(empty_body).is_err());
    }

    #[test]
    fn test_soap11_fault_detection() {
        let xml = Fault::new("soap:Server", "Something broke")
            .with_detail(XmlElement::new("detail").with_child(XmlElement::new("Code").with_text("E42")))
            .to_envelope_xml(crate::error::SoapFaultVersion::Soap11)
            .unwrap();

        let envelope = Envelope::from_xml(xml.as_bytes()).unwrap();
        let fault = envelope.fault().unwrap();
        assert_eq!(fault.code, "soap:Server");
        assert_eq!(fault.string, "Something broke");

        match parse_envelope(xml.as_bytes()) {
            Err(SoapError::Fault(fault)) => assert_eq!(fault.string, "Something broke"),
            other => panic!("expected fault, got {:?}", other),
        }
    }

    #[test]
    fn test_soap12_fault_detection() {
        let xml = Fault::new("soap:Sender", "Bad input")
            .to_envelope_xml(crate::error::SoapFaultVersion::Soap12)
            .unwrap();
        let fault = Envelope::from_xml(xml.as_bytes()).unwrap().fault().unwrap();
        assert_eq!(fault.code, "soap:Sender");
        assert_eq!(fault.string, "Bad input");
    }

    #[test]
    fn test_non_fault_body_named_fault_is_payload() {
        let envelope = Envelope::build(&[], &XmlElement::qualified("urn:app", "Fault")).unwrap();
        assert!(envelope.fault().is_none());
    }

    #[test]
    fn test_attachments_collected_once() {
        let binary = Binary::new("x");
        let body = XmlElement::new("Upload")
            .with_child(XmlElement::new("A").with_binary(binary.clone()))
            .with_child(XmlElement::new("B").with_binary(binary.clone()));
        let envelope = Envelope::build(&[], &body).unwrap();
        assert!(envelope.has_attachments());
        assert_eq!(envelope.attachments().len(), 1);
    }

    #[test]
    fn test_header_as() {
        let entry = HeaderEntry::from_element(XmlElement::qualified("urn:s", "Session").with_text("abc"));
        let envelope = Envelope::build(&[entry], &ping("x")).unwrap();
        assert_eq!(envelope.header_as::<String>("Session").unwrap().as_deref(), Some("abc"));
        assert_eq!(envelope.header_as::<String>("Missing").unwrap(), None);
    }
}
