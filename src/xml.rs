//! Owned XML element tree and the payload marshaling traits.
//!
//! Request, response and header types implement [`ToElement`] and/or
//! [`FromElement`] to move between Rust structs and namespace-qualified XML.
//! Attachment fields are flagged by placing a [`Binary`] node in the tree;
//! the writer decides whether it becomes base64 text or an `xop:Include`.
//!
//! Namespaces follow XML's own defaulting rule: an element whose
//! `namespace` is `None` lives in the default namespace of its parent.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::binary::{Binary, DEFAULT_CONTENT_TYPE};
use crate::error::SoapError;

/// SOAP 1.1 envelope namespace.
pub const SOAP_ENV_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
/// SOAP 1.2 envelope namespace.
pub const SOAP12_ENV_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
/// XOP include namespace.
pub const XOP_NS: &str = "http://www.w3.org/2004/08/xop/include";
/// XML-binary media type attributes (`xmime:contentType`).
pub const XMIME_NS: &str = "http://www.w3.org/2005/05/xmlmime";
/// Reserved `xml:` namespace.
pub const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

const WELL_KNOWN_PREFIXES: &[(&str, &str)] = &[
    (SOAP_ENV_NS, "soap"),
    (SOAP12_ENV_NS, "soap12"),
    (XOP_NS, "xop"),
    (XMIME_NS, "xmime"),
    (XML_NS, "xml"),
];

/// Convert a value into an XML element.
pub trait ToElement {
    fn to_element(&self) -> Result<XmlElement, SoapError>;
}

/// Build a value from an XML element.
pub trait FromElement: Sized {
    fn from_element(element: &XmlElement) -> Result<Self, SoapError>;
}

/// An XML element with its attributes and children.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct XmlElement {
    /// Namespace URI, `None` to inherit the parent's default namespace
    pub namespace: Option<String>,
    /// Local name
    pub name: String,
    pub attributes: Vec<XmlAttribute>,
    pub children: Vec<XmlNode>,
}

/// An attribute. Unprefixed attributes have no namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct XmlAttribute {
    pub namespace: Option<String>,
    pub name: String,
    pub value: String,
}

/// A child node of an element.
#[derive(Debug, Clone, PartialEq)]
pub enum XmlNode {
    Element(XmlElement),
    Text(String),
    /// Attachment marker
    Binary(Binary),
    /// Unresolved `xop:Include` reference (the raw `href`)
    Include(String),
}

impl XmlElement {
    /// Element in its parent's default namespace.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Element in an explicit namespace.
    pub fn qualified(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attribute(None, name, value);
        self
    }

    pub fn with_namespaced_attribute(
        mut self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.set_attribute(Some(namespace.into()), name, value);
        self
    }

    /// Set an attribute, replacing an existing one with the same name and namespace.
    pub fn set_attribute(
        &mut self,
        namespace: Option<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) {
        let name = name.into();
        let value = value.into();
        match self
            .attributes
            .iter_mut()
            .find(|a| a.name == name && a.namespace == namespace)
        {
            Some(existing) => existing.value = value,
            None => self.attributes.push(XmlAttribute {
                namespace,
                name,
                value,
            }),
        }
    }

    pub fn with_child(mut self, child: XmlElement) -> Self {
        self.children.push(XmlNode::Element(child));
        self
    }

    /// Append text content. Empty text adds nothing, matching what the
    /// parser reads back from `<name></name>`.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        let text = text.into();
        if !text.is_empty() {
            self.children.push(XmlNode::Text(text));
        }
        self
    }

    /// Mark this element's content as an attachment.
    pub fn with_binary(mut self, binary: Binary) -> Self {
        self.children.push(XmlNode::Binary(binary));
        self
    }

    pub fn push_child(&mut self, child: XmlElement) {
        self.children.push(XmlNode::Element(child));
    }

    /// Append `<name>text</name>`.
    pub fn push_text_child(&mut self, name: impl Into<String>, text: impl Into<String>) {
        self.push_child(XmlElement::new(name).with_text(text));
    }

    /// Child elements in document order.
    pub fn elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|node| match node {
            XmlNode::Element(e) => Some(e),
            _ => None,
        })
    }

    /// First child element with the given local name.
    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.elements().find(|e| e.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        self.elements().filter(move |e| e.name == name)
    }

    /// Like [`child`](Self::child) but missing elements are a parse error.
    pub fn require_child(&self, name: &str) -> Result<&XmlElement, SoapError> {
        self.child(name).ok_or_else(|| {
            SoapError::parse(format!("<{}> has no <{}> child", self.name, name))
        })
    }

    /// Concatenated text content of this element (not descendants).
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                XmlNode::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn child_text(&self, name: &str) -> Option<String> {
        self.child(name).map(XmlElement::text)
    }

    /// Attribute value by local name, whatever its namespace.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    /// The attachment held by this element, if any.
    pub fn binary(&self) -> Option<&Binary> {
        self.children.iter().find_map(|node| match node {
            XmlNode::Binary(b) => Some(b),
            _ => None,
        })
    }

    /// Every attachment in this subtree, in document order.
    pub fn binaries(&self) -> Vec<&Binary> {
        let mut found = Vec::new();
        self.collect_binaries(&mut found);
        found
    }

    fn collect_binaries<'a>(&'a self, found: &mut Vec<&'a Binary>) {
        for node in &self.children {
            match node {
                XmlNode::Element(e) => e.collect_binaries(found),
                XmlNode::Binary(b) => found.push(b),
                _ => {}
            }
        }
    }

    /// Check that every name in this subtree can be written as XML.
    pub fn validate(&self) -> Result<(), SoapError> {
        if !is_valid_name(&self.name) {
            return Err(SoapError::encoding(format!(
                "invalid element name {:?}",
                self.name
            )));
        }
        if let Some(attr) = self.attributes.iter().find(|a| !is_valid_name(&a.name)) {
            return Err(SoapError::encoding(format!(
                "invalid attribute name {:?} on <{}>",
                attr.name, self.name
            )));
        }
        self.elements().try_for_each(XmlElement::validate)
    }

    /// Drop explicit namespaces that repeat the namespace in scope and empty
    /// text nodes, so a built tree compares equal to the same tree read back
    /// from the wire.
    pub(crate) fn normalize(&mut self, default_ns: &str) {
        let own = match self.namespace.as_deref() {
            Some(ns) if is_prefixed_namespace(ns) => default_ns.to_string(),
            Some(ns) if ns == default_ns => {
                self.namespace = None;
                default_ns.to_string()
            }
            Some(ns) => ns.to_string(),
            None => default_ns.to_string(),
        };
        self.children
            .retain(|node| !matches!(node, XmlNode::Text(t) if t.is_empty()));
        for node in &mut self.children {
            if let XmlNode::Element(child) = node {
                child.normalize(&own);
            }
        }
    }

    /// Serialize this element with attachments inlined as base64.
    pub fn to_xml_string(&self) -> Result<String, SoapError> {
        let mut writer = XmlWriter::new(BinaryMode::Inline);
        writer.write_root(self)?;
        writer.finish()
    }
}

impl ToElement for XmlElement {
    fn to_element(&self) -> Result<XmlElement, SoapError> {
        Ok(self.clone())
    }
}

impl FromElement for XmlElement {
    fn from_element(element: &XmlElement) -> Result<Self, SoapError> {
        Ok(element.clone())
    }
}

impl FromElement for String {
    fn from_element(element: &XmlElement) -> Result<Self, SoapError> {
        Ok(element.text())
    }
}

impl FromElement for Binary {
    /// Accepts a resolved attachment or base64 text with an optional
    /// `xmime:contentType` attribute.
    fn from_element(element: &XmlElement) -> Result<Self, SoapError> {
        if let Some(binary) = element.binary() {
            return Ok(binary.clone());
        }
        if element.children.iter().any(|n| matches!(n, XmlNode::Include(_))) {
            return Err(SoapError::parse(format!(
                "<{}> holds an unresolved xop:Include",
                element.name
            )));
        }

        let encoded: String = element
            .text()
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| SoapError::parse(format!("<{}> is not base64: {}", element.name, e)))?;
        let content_type = element
            .attribute("contentType")
            .unwrap_or(DEFAULT_CONTENT_TYPE);
        Ok(Binary::new(bytes).with_content_type(content_type))
    }
}

impl<T: ToElement + ?Sized> ToElement for &T {
    fn to_element(&self) -> Result<XmlElement, SoapError> {
        (**self).to_element()
    }
}

impl<T: ToElement + ?Sized> ToElement for Box<T> {
    fn to_element(&self) -> Result<XmlElement, SoapError> {
        (**self).to_element()
    }
}

impl<T: ToElement + ?Sized> ToElement for Arc<T> {
    fn to_element(&self) -> Result<XmlElement, SoapError> {
        (**self).to_element()
    }
}

/// Namespaces always written with a prefix rather than as the default namespace.
pub(crate) fn is_prefixed_namespace(ns: &str) -> bool {
    ns == SOAP_ENV_NS || ns == SOAP12_ENV_NS || ns == XOP_NS
}

fn well_known_prefix(ns: &str) -> Option<&'static str> {
    WELL_KNOWN_PREFIXES
        .iter()
        .find(|(uri, _)| *uri == ns)
        .map(|(_, prefix)| *prefix)
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// How attachment nodes are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryMode {
    /// base64 text plus `xmime:contentType`
    Inline,
    /// `<xop:Include href="cid:..."/>`
    Xop,
}

#[derive(Debug, Clone, Default)]
struct Scope {
    default_ns: String,
    prefixes: Vec<(String, String)>,
}

impl Scope {
    fn prefix_for(&self, ns: &str) -> Option<&str> {
        self.prefixes
            .iter()
            .rev()
            .find(|(_, uri)| uri == ns)
            .map(|(prefix, _)| prefix.as_str())
    }
}

pub(crate) struct XmlWriter {
    writer: Writer<Vec<u8>>,
    mode: BinaryMode,
    generated_prefixes: usize,
}

impl XmlWriter {
    pub(crate) fn new(mode: BinaryMode) -> Self {
        Self {
            writer: Writer::new(Vec::new()),
            mode,
            generated_prefixes: 0,
        }
    }

    pub(crate) fn write_declaration(&mut self) -> Result<(), SoapError> {
        self.emit(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
    }

    pub(crate) fn finish(self) -> Result<String, SoapError> {
        String::from_utf8(self.writer.into_inner())
            .map_err(|e| SoapError::encoding(format!("serialized XML is not UTF-8: {}", e)))
    }

    pub(crate) fn write_root(&mut self, element: &XmlElement) -> Result<(), SoapError> {
        self.write_element(element, &Scope::default())
    }

    fn emit(&mut self, event: Event<'_>) -> Result<(), SoapError> {
        self.writer
            .write_event(event)
            .map_err(|e| SoapError::encoding(format!("failed to write XML: {}", e)))
    }

    fn bind_prefix(&mut self, ns: &str, scope: &mut Scope, decls: &mut Vec<(String, String)>) -> String {
        if ns == XML_NS {
            return "xml".to_string();
        }
        if let Some(prefix) = scope.prefix_for(ns) {
            return prefix.to_string();
        }
        let prefix = match well_known_prefix(ns) {
            Some(prefix) => prefix.to_string(),
            None => {
                self.generated_prefixes += 1;
                format!("ns{}", self.generated_prefixes)
            }
        };
        decls.push((format!("xmlns:{}", prefix), ns.to_string()));
        scope.prefixes.push((prefix.clone(), ns.to_string()));
        prefix
    }

    fn write_element(&mut self, element: &XmlElement, parent: &Scope) -> Result<(), SoapError> {
        let mut scope = parent.clone();
        let mut decls: Vec<(String, String)> = Vec::new();

        let tag = match element.namespace.as_deref() {
            Some(ns) if is_prefixed_namespace(ns) => {
                let prefix = self.bind_prefix(ns, &mut scope, &mut decls);
                format!("{}:{}", prefix, element.name)
            }
            Some(ns) => {
                if ns != scope.default_ns {
                    decls.push(("xmlns".to_string(), ns.to_string()));
                    scope.default_ns = ns.to_string();
                }
                element.name.clone()
            }
            None => element.name.clone(),
        };

        let mut attrs: Vec<(String, String)> = Vec::new();
        for attr in &element.attributes {
            let name = match attr.namespace.as_deref() {
                Some(ns) => {
                    let prefix = self.bind_prefix(ns, &mut scope, &mut decls);
                    format!("{}:{}", prefix, attr.name)
                }
                None => attr.name.clone(),
            };
            attrs.push((name, attr.value.clone()));
        }

        if self.mode == BinaryMode::Inline {
            if let Some(binary) = element.binary() {
                let has_content_type = element
                    .attributes
                    .iter()
                    .any(|a| a.name == "contentType" && a.namespace.as_deref() == Some(XMIME_NS));
                if !has_content_type {
                    let prefix = self.bind_prefix(XMIME_NS, &mut scope, &mut decls);
                    attrs.push((
                        format!("{}:contentType", prefix),
                        binary.content_type().to_string(),
                    ));
                }
            }
        }

        let mut start = BytesStart::new(tag.as_str());
        for (name, value) in decls.iter().chain(attrs.iter()) {
            start.push_attribute((name.as_str(), value.as_str()));
        }

        if element.children.is_empty() {
            return self.emit(Event::Empty(start));
        }
        self.emit(Event::Start(start))?;

        for node in &element.children {
            match node {
                XmlNode::Element(child) => self.write_element(child, &scope)?,
                XmlNode::Text(text) => self.emit(Event::Text(BytesText::new(text)))?,
                XmlNode::Binary(binary) => match self.mode {
                    BinaryMode::Inline => {
                        let encoded = STANDARD.encode(binary.bytes());
                        self.emit(Event::Text(BytesText::new(&encoded)))?;
                    }
                    BinaryMode::Xop => {
                        let href = format!("cid:{}", encode_cid(binary.content_id()));
                        self.write_include(&href, &scope)?;
                    }
                },
                XmlNode::Include(href) => self.write_include(href, &scope)?,
            }
        }

        self.emit(Event::End(BytesEnd::new(tag.as_str())))
    }

    fn write_include(&mut self, href: &str, scope: &Scope) -> Result<(), SoapError> {
        let include = XmlElement::qualified(XOP_NS, "Include").with_attribute("href", href);
        self.write_element(&include, scope)
    }
}

/// Percent-encode the characters a `cid:` URL cannot carry verbatim.
pub(crate) fn encode_cid(content_id: &str) -> String {
    let mut out = String::with_capacity(content_id.len());
    for b in content_id.bytes() {
        if b.is_ascii_alphanumeric() || b"@.-_~!$&'()*+,;=:".contains(&b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

/// Reverse of [`encode_cid`]; malformed escapes are kept as-is.
pub(crate) fn decode_cid(href: &str) -> String {
    let bytes = href.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(value) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> XmlElement {
        let mut element = XmlElement::qualified("http://www.namespace.ninja", "Credentials");
        element.push_text_child("Login", "login_value");
        element.push_text_child("Password", "password_value");
        element
    }

    #[test]
    fn test_write_default_namespace_inheritance() {
        assert_eq!(
            credentials().to_xml_string().unwrap(),
            r#"<Credentials xmlns="http://www.namespace.ninja"><Login>login_value</Login><Password>password_value</Password></Credentials>"#
        );
    }

    #[test]
    fn test_write_escapes_text_and_attributes() {
        let element = XmlElement::new("Item")
            .with_attribute("note", "a\"b")
            .with_text("1 < 2 & 3");
        assert_eq!(
            element.to_xml_string().unwrap(),
            r#"<Item note="a&quot;b">1 &lt; 2 &amp; 3</Item>"#
        );
    }

    #[test]
    fn test_write_envelope_prefix_and_attribute_namespaces() {
        let element = XmlElement::qualified(SOAP_ENV_NS, "Body").with_child(
            XmlElement::qualified("urn:a", "Op")
                .with_namespaced_attribute("urn:b", "flag", "1")
                .with_namespaced_attribute(XML_NS, "lang", "en"),
        );
        assert_eq!(
            element.to_xml_string().unwrap(),
            r#"<soap:Body xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><Op xmlns="urn:a" xmlns:ns1="urn:b" ns1:flag="1" xml:lang="en"/></soap:Body>"#
        );
    }

    #[test]
    fn test_write_no_namespace_under_default() {
        let element = XmlElement::qualified("urn:a", "Outer").with_child(XmlElement::qualified("", "Inner"));
        assert_eq!(
            element.to_xml_string().unwrap(),
            r#"<Outer xmlns="urn:a"><Inner xmlns=""/></Outer>"#
        );
    }

    #[test]
    fn test_binary_inline_and_xop() {
        let binary = Binary::new("hi").with_content_type("text/plain");
        let element = XmlElement::new("Attachment").with_binary(binary.clone());

        assert_eq!(
            element.to_xml_string().unwrap(),
            r#"<Attachment xmlns:xmime="http://www.w3.org/2005/05/xmlmime" xmime:contentType="text/plain">aGk=</Attachment>"#
        );

        let mut writer = XmlWriter::new(BinaryMode::Xop);
        writer.write_root(&element).unwrap();
        assert_eq!(
            writer.finish().unwrap(),
            format!(
                r#"<Attachment><xop:Include xmlns:xop="http://www.w3.org/2004/08/xop/include" href="cid:{}"/></Attachment>"#,
                binary.content_id()
            )
        );
    }

    #[test]
    fn test_binary_from_base64_text() {
        let element = XmlElement::new("Attachment")
            .with_namespaced_attribute(XMIME_NS, "contentType", "text/plain")
            .with_text("QXR0YWNoZWQg\n ZGF0YQ==");
        let binary = Binary::from_element(&element).unwrap();
        assert_eq!(binary.bytes(), b"Attached data");
        assert_eq!(binary.content_type(), "text/plain");
    }

    #[test]
    fn test_binary_from_unresolved_include_fails() {
        let mut element = XmlElement::new("Attachment");
        element.children.push(XmlNode::Include("cid:missing".into()));
        assert!(matches!(Binary::from_element(&element), Err(SoapError::Parse(_))));
    }

    #[test]
    fn test_accessors() {
        let element = credentials().with_attribute("kind", "basic");
        assert_eq!(element.child_text("Login").as_deref(), Some("login_value"));
        assert_eq!(element.attribute("kind"), Some("basic"));
        assert_eq!(element.elements().count(), 2);
        assert!(element.child("Missing").is_none());
        assert!(element.require_child("Missing").is_err());
    }

    #[test]
    fn test_binaries_in_document_order() {
        let a = Binary::new("a");
        let b = Binary::new("b");
        let element = XmlElement::new("Root")
            .with_child(XmlElement::new("First").with_binary(a.clone()))
            .with_child(XmlElement::new("Nested").with_child(XmlElement::new("Second").with_binary(b.clone())));
        let found: Vec<&str> = element.binaries().iter().map(|b| b.content_id()).collect();
        assert_eq!(found, vec![a.content_id(), b.content_id()]);
    }

    #[test]
    fn test_validate_rejects_bad_names() {
        assert!(credentials().validate().is_ok());
        assert!(XmlElement::new("bad name").validate().is_err());
        assert!(XmlElement::new("").validate().is_err());
        assert!(XmlElement::new("ok").with_attribute("1x", "v").validate().is_err());
    }

    #[test]
    fn test_normalize() {
        let mut element = XmlElement::qualified("urn:a", "Outer")
            .with_child(XmlElement::qualified("urn:a", "Same"))
            .with_child(XmlElement::qualified("urn:b", "Other"));
        element.children.push(XmlNode::Text(String::new()));
        element.normalize("");
        assert_eq!(element.namespace.as_deref(), Some("urn:a"));
        assert_eq!(element.child("Same").unwrap().namespace, None);
        assert_eq!(element.child("Other").unwrap().namespace.as_deref(), Some("urn:b"));
        assert_eq!(element.children.len(), 2);
    }

    #[test]
    fn test_write_whitespace_and_empty_text() {
        let spaces = XmlElement::new("Message").with_text("   ");
        assert_eq!(spaces.to_xml_string().unwrap(), "<Message>   </Message>");

        let empty = XmlElement::new("Message").with_text("");
        assert!(empty.children.is_empty());
        assert_eq!(empty.to_xml_string().unwrap(), "<Message/>");
    }

    #[test]
    fn test_cid_encoding() {
        assert_eq!(encode_cid("abc@host"), "abc@host");
        assert_eq!(encode_cid("a b<c>"), "a%20b%3Cc%3E");
        assert_eq!(decode_cid("a%20b%3Cc%3E"), "a b<c>");
        assert_eq!(decode_cid("bad%zz"), "bad%zz");
        assert_eq!(decode_cid("tail%4"), "tail%4");
    }
}
