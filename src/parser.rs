//! XML parsing into [`XmlElement`] trees.
//!
//! Uses quick-xml, which never expands external entities; DOCTYPE
//! declarations are rejected outright.

use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::NsReader;

use crate::envelope::Envelope;
use crate::error::SoapError;
use crate::xml::{is_prefixed_namespace, XmlAttribute, XmlElement, XmlNode, XOP_NS};

/// An `xop:Include` found while parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XopReference {
    /// Raw `href` value, e.g. `cid:abc@host`
    pub href: String,
    /// Slash-separated element path of the field holding the reference
    pub path: String,
}

/// A parsed document plus the XOP references it contains.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub root: XmlElement,
    pub references: Vec<XopReference>,
}

struct OpenElement {
    element: XmlElement,
    /// Default namespace seen by children
    child_default: String,
}

/// Parse raw bytes into an element tree.
pub fn parse_document(data: &[u8]) -> Result<ParsedDocument, SoapError> {
    let mut reader = NsReader::from_reader(data);
    reader.config_mut().trim_text(false);

    let mut stack: Vec<OpenElement> = Vec::new();
    let mut root: Option<XmlElement> = None;
    let mut references = Vec::new();
    let mut buf = Vec::new();

    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| {
            SoapError::parse(format!(
                "XML parse error at position {}: {}",
                reader.buffer_position(),
                e
            ))
        })?;

        match event {
            Event::Start(ref e) => {
                let parent_default = stack.last().map(|o| o.child_default.as_str()).unwrap_or("");
                let open = open_element(&reader, e, parent_default)?;
                stack.push(open);
            }

            Event::Empty(ref e) => {
                let parent_default = stack.last().map(|o| o.child_default.as_str()).unwrap_or("");
                let open = open_element(&reader, e, parent_default)?;
                close_element(open.element, &mut stack, &mut root, &mut references)?;
            }

            Event::End(_) => {
                let open = stack
                    .pop()
                    .ok_or_else(|| SoapError::parse("unexpected closing tag"))?;
                close_element(open.element, &mut stack, &mut root, &mut references)?;
            }

            Event::Text(ref e) => {
                let text = e
                    .unescape()
                    .map_err(|e| SoapError::parse(format!("invalid text content: {}", e)))?;
                push_text(&mut stack, text.as_ref())?;
            }

            Event::CData(e) => {
                let text = String::from_utf8(e.into_inner().into_owned())
                    .map_err(|e| SoapError::parse(format!("invalid UTF-8 in CDATA: {}", e)))?;
                push_text(&mut stack, &text)?;
            }

            Event::DocType(_) => {
                return Err(SoapError::parse("DOCTYPE declarations are not allowed"));
            }

            Event::Eof => break,

            // Declaration, comments, processing instructions
            _ => {}
        }

        buf.clear();
    }

    if let Some(open) = stack.last() {
        return Err(SoapError::parse(format!(
            "unexpected end of document inside <{}>",
            open.element.name
        )));
    }

    let root = root.ok_or_else(|| SoapError::parse("document has no root element"))?;
    Ok(ParsedDocument { root, references })
}

/// Parse a plain (non-multipart) envelope, turning a Fault body into
/// [`SoapError::Fault`].
pub fn parse_envelope(data: &[u8]) -> Result<Envelope, SoapError> {
    let document = parse_document(data)?;
    if let Some(reference) = document.references.first() {
        return Err(SoapError::parse(format!(
            "dangling XOP reference {} at {}: message has no attachment parts",
            reference.href, reference.path
        )));
    }
    Envelope::from_root(document.root)?.check_fault()
}

fn open_element(
    reader: &NsReader<&[u8]>,
    start: &BytesStart,
    parent_default: &str,
) -> Result<OpenElement, SoapError> {
    let (resolved, local) = reader.resolve_element(start.name());
    let ns = namespace_uri(resolved)?.unwrap_or_default();
    let name = utf8(local.as_ref())?.to_string();

    // Mirrors how the writer emits namespaces so that parsed and built trees compare equal.
    let (namespace, child_default) = if is_prefixed_namespace(&ns) {
        (Some(ns), parent_default.to_string())
    } else if ns == parent_default {
        (None, ns)
    } else {
        (Some(ns.clone()), ns)
    };

    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| SoapError::parse(format!("invalid attribute on <{}>: {}", name, e)))?;
        let key = attr.key.as_ref();
        if key == b"xmlns" || key.starts_with(b"xmlns:") {
            continue;
        }

        let (resolved, local) = reader.resolve_attribute(attr.key);
        let value = attr
            .unescape_value()
            .map_err(|e| SoapError::parse(format!("invalid attribute value on <{}>: {}", name, e)))?;
        attributes.push(XmlAttribute {
            namespace: namespace_uri(resolved)?,
            name: utf8(local.as_ref())?.to_string(),
            value: value.into_owned(),
        });
    }

    Ok(OpenElement {
        element: XmlElement {
            namespace,
            name,
            attributes,
            children: Vec::new(),
        },
        child_default,
    })
}

fn close_element(
    mut element: XmlElement,
    stack: &mut [OpenElement],
    root: &mut Option<XmlElement>,
    references: &mut Vec<XopReference>,
) -> Result<(), SoapError> {
    // Whitespace between child elements is indentation; a leaf keeps its text verbatim
    if element.children.iter().any(|n| !matches!(n, XmlNode::Text(_))) {
        element
            .children
            .retain(|n| !matches!(n, XmlNode::Text(t) if t.trim().is_empty()));
    }

    if stack.is_empty() {
        if root.is_some() {
            return Err(SoapError::parse("document has more than one root element"));
        }
        *root = Some(element);
        return Ok(());
    }

    let node = if element.name == "Include" && element.namespace.as_deref() == Some(XOP_NS) {
        let href = element
            .attribute("href")
            .ok_or_else(|| SoapError::parse("xop:Include without href"))?
            .to_string();
        let path = stack
            .iter()
            .map(|o| o.element.name.as_str())
            .collect::<Vec<_>>()
            .join("/");
        references.push(XopReference {
            href: href.clone(),
            path,
        });
        XmlNode::Include(href)
    } else {
        XmlNode::Element(element)
    };

    if let Some(parent) = stack.last_mut() {
        parent.element.children.push(node);
    }
    Ok(())
}

fn push_text(stack: &mut [OpenElement], text: &str) -> Result<(), SoapError> {
    if text.is_empty() {
        return Ok(());
    }
    match stack.last_mut() {
        Some(open) => {
            open.element.children.push(XmlNode::Text(text.to_string()));
            Ok(())
        }
        None if text.trim().is_empty() => Ok(()),
        None => Err(SoapError::parse("text content outside the root element")),
    }
}

fn namespace_uri(resolved: ResolveResult) -> Result<Option<String>, SoapError> {
    match resolved {
        ResolveResult::Bound(Namespace(ns)) => Ok(Some(utf8(ns)?.to_string())),
        ResolveResult::Unbound => Ok(None),
        ResolveResult::Unknown(prefix) => Err(SoapError::parse(format!(
            "unknown namespace prefix {:?}",
            String::from_utf8_lossy(&prefix)
        ))),
    }
}

fn utf8(bytes: &[u8]) -> Result<&str, SoapError> {
    std::str::from_utf8(bytes).map_err(|e| SoapError::parse(format!("invalid UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::SOAP_ENV_NS;

    const PING_RESPONSE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
  <soap:Body>
    <PingResponse xmlns="http://example.com/service.xsd">
      <PingResult>
        <Message>Pong hi</Message>
      </PingResult>
    </PingResponse>
  </soap:Body>
</soap:Envelope>"#;

    #[test]
    fn test_parse_document_namespaces() {
        let doc = parse_document(PING_RESPONSE.as_bytes()).unwrap();
        assert_eq!(doc.root.name, "Envelope");
        assert_eq!(doc.root.namespace.as_deref(), Some(SOAP_ENV_NS));

        let body = doc.root.child("Body").unwrap();
        let response = body.child("PingResponse").unwrap();
        assert_eq!(response.namespace.as_deref(), Some("http://example.com/service.xsd"));

        // Inherits the default namespace, so no explicit namespace is recorded
        let result = response.child("PingResult").unwrap();
        assert_eq!(result.namespace, None);
        assert_eq!(result.child_text("Message").as_deref(), Some("Pong hi"));
        assert!(doc.references.is_empty());
    }

    #[test]
    fn test_parse_round_trips_writer_output() {
        let built = XmlElement::qualified("urn:a", "Outer")
            .with_attribute("id", "1 & 2")
            .with_child(XmlElement::new("Inner").with_text("x < y"))
            .with_child(XmlElement::qualified("", "Bare"))
            .with_child(XmlElement::qualified("urn:b", "Other").with_child(XmlElement::new("Leaf")));
        let parsed = parse_document(built.to_xml_string().unwrap().as_bytes()).unwrap();
        assert_eq!(parsed.root, built);
    }

    #[test]
    fn test_parse_records_xop_references() {
        let xml = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body><Ping><Attachment><xop:Include xmlns:xop="http://www.w3.org/2004/08/xop/include" href="cid:part1@host"/></Attachment></Ping></soap:Body>
</soap:Envelope>"#;
        let doc = parse_document(xml.as_bytes()).unwrap();
        assert_eq!(
            doc.references,
            vec![XopReference {
                href: "cid:part1@host".to_string(),
                path: "Envelope/Body/Ping/Attachment".to_string(),
            }]
        );
        let attachment = doc.root.child("Body").unwrap().child("Ping").unwrap().child("Attachment").unwrap();
        assert_eq!(attachment.children, vec![XmlNode::Include("cid:part1@host".to_string())]);
    }

    #[test]
    fn test_whitespace_text_kept_in_leaves_only() {
        let doc = parse_document(b"<a>\n  <b>  </b>\n  <c></c>\n  <d> x </d>\n</a>").unwrap();
        assert_eq!(doc.root.children.len(), 3);
        assert_eq!(doc.root.child_text("b").as_deref(), Some("  "));
        assert!(doc.root.child("c").unwrap().children.is_empty());
        assert_eq!(doc.root.child_text("d").as_deref(), Some(" x "));
    }

    #[test]
    fn test_parse_cdata_and_entities() {
        let doc = parse_document(b"<a><b><![CDATA[<raw>]]></b><c>&lt;esc&gt;</c></a>").unwrap();
        assert_eq!(doc.root.child_text("b").as_deref(), Some("<raw>"));
        assert_eq!(doc.root.child_text("c").as_deref(), Some("<esc>"));
    }

    #[test]
    fn test_doctype_rejected() {
        let xxe_payload = r#"<?xml version="1.0"?>
<!DOCTYPE foo [<!ENTITY xxe SYSTEM "file:///etc/passwd">]>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>&xxe;</soap:Body>
</soap:Envelope>"#;
        let err = parse_document(xxe_payload.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("DOCTYPE"));
    }

    #[test]
    fn test_malformed_documents() {
        assert!(parse_document(b"").is_err());
        assert!(parse_document(b"<a><b></a>").is_err());
        assert!(parse_document(b"<a>").is_err());
        assert!(parse_document(b"<a/><b/>").is_err());
        assert!(parse_document(b"<p:a/>").is_err());
    }

    #[test]
    fn test_parse_envelope_rejects_xop_without_parts() {
        let xml = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><Ping><A><xop:Include xmlns:xop="http://www.w3.org/2004/08/xop/include" href="cid:x"/></A></Ping></soap:Body></soap:Envelope>"#;
        assert!(matches!(parse_envelope(xml.as_bytes()), Err(SoapError::Parse(_))));
    }
}
