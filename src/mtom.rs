//! MTOM/XOP multipart codec.
//!
//! Encodes an [`Envelope`] whose payload carries [`Binary`] markers into a
//! `multipart/related` message (RFC 2387) where each attachment is its own
//! raw MIME part referenced by `xop:Include`, and decodes such messages back,
//! re-attaching every part to the field that referenced it.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::binary::{Binary, DEFAULT_CONTENT_TYPE};
use crate::envelope::Envelope;
use crate::error::SoapError;
use crate::parser::{parse_document, XopReference};
use crate::xml::{decode_cid, BinaryMode, XmlElement, XmlNode};

/// Media type of the root part.
pub const XOP_CONTENT_TYPE: &str = "application/xop+xml";

/// Content type of the envelope carried in the root part (SOAP 1.1).
const ROOT_START_INFO: &str = "text/xml";

/// RFC 2046 limit.
const MAX_BOUNDARY_LEN: usize = 70;

const MAX_BOUNDARY_ATTEMPTS: usize = 8;

/// A serialized multipart message ready to send.
#[derive(Debug, Clone)]
pub struct MultipartMessage {
    /// Value for the `Content-Type` HTTP header
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Encode an envelope and the attachments it references.
///
/// Attachments are written raw (no base64); empty attachments become
/// zero-length parts.
pub fn encode_multipart(envelope: &Envelope) -> Result<MultipartMessage, SoapError> {
    let xml = envelope.write(BinaryMode::Xop)?;
    let attachments = envelope.attachments();
    let boundary = choose_boundary(xml.as_bytes(), &attachments)?;
    let root_id = format!("{}@zentinel-soap", Uuid::new_v4().simple());

    let capacity = xml.len() + attachments.iter().map(|a| a.len() + 256).sum::<usize>() + 256;
    let mut body = Vec::with_capacity(capacity);

    body.extend_from_slice(
        format!(
            "--{}\r\nContent-Type: {}; charset=UTF-8; type=\"{}\"\r\nContent-Transfer-Encoding: 8bit\r\nContent-ID: <{}>\r\n\r\n",
            boundary, XOP_CONTENT_TYPE, ROOT_START_INFO, root_id
        )
        .as_bytes(),
    );
    body.extend_from_slice(xml.as_bytes());

    for attachment in &attachments {
        body.extend_from_slice(
            format!(
                "\r\n--{}\r\nContent-Type: {}\r\nContent-Transfer-Encoding: binary\r\nContent-ID: <{}>\r\n\r\n",
                boundary,
                attachment.content_type(),
                attachment.content_id()
            )
            .as_bytes(),
        );
        body.extend_from_slice(attachment.bytes());
    }
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

    debug!(
        attachments = attachments.len(),
        size = body.len(),
        "Encoded MTOM message"
    );

    Ok(MultipartMessage {
        content_type: format!(
            "multipart/related; type=\"{}\"; boundary=\"{}\"; start=\"<{}>\"; start-info=\"{}\"",
            XOP_CONTENT_TYPE, boundary, root_id, ROOT_START_INFO
        ),
        body,
    })
}

/// Decode a multipart/related message into its envelope and attachments.
///
/// Every `xop:Include` in the root part must resolve to a part; a dangling
/// reference fails the whole decode.
pub fn decode_multipart(
    content_type: &str,
    body: &[u8],
) -> Result<(Envelope, Vec<Binary>), SoapError> {
    let media = MediaType::parse(content_type);
    if !media.is_multipart() {
        return Err(SoapError::parse(format!(
            "expected a multipart content type, got {:?}",
            media.essence
        )));
    }

    let boundary = media
        .param("boundary")
        .ok_or_else(|| SoapError::parse("multipart content type has no boundary"))?;
    if boundary.is_empty()
        || boundary.len() > MAX_BOUNDARY_LEN
        || boundary.contains(['\r', '\n'])
    {
        return Err(SoapError::parse(format!("malformed multipart boundary {:?}", boundary)));
    }

    let parts = split_parts(body, boundary)?
        .into_iter()
        .map(Part::parse)
        .collect::<Result<Vec<_>, _>>()?;

    let root_index = match media.param("start").map(strip_angle_brackets) {
        Some(start) => parts
            .iter()
            .position(|p| p.content_id().as_deref() == Some(start))
            .ok_or_else(|| {
                SoapError::parse(format!("no part matches the start id <{}>", start))
            })?,
        None => 0,
    };

    let root_part = &parts[root_index];
    let document = parse_document(&root_part.decoded_body()?)?;

    let mut attachments = Vec::with_capacity(parts.len().saturating_sub(1));
    for (index, part) in parts.iter().enumerate() {
        if index == root_index {
            continue;
        }
        let Some(content_id) = part.content_id() else {
            warn!(part = index, "Skipping MIME part without Content-ID");
            continue;
        };
        let content_type = part.header("content-type").unwrap_or(DEFAULT_CONTENT_TYPE);
        attachments.push(Binary::from_part(part.decoded_body()?, content_type, content_id));
    }

    let by_id: HashMap<&str, &Binary> = attachments
        .iter()
        .map(|a| (a.content_id(), a))
        .collect();

    let mut resolved = HashMap::new();
    for reference in &document.references {
        let content_id = reference_content_id(reference)?;
        let binary = by_id.get(content_id.as_str()).ok_or_else(|| {
            SoapError::parse(format!(
                "dangling XOP reference {} at {}",
                reference.href, reference.path
            ))
        })?;
        resolved.insert(reference.href.clone(), (*binary).clone());
    }

    let mut root = document.root;
    rehydrate(&mut root, &resolved);
    let envelope = Envelope::from_root(root)?;

    debug!(
        parts = parts.len(),
        attachments = attachments.len(),
        references = document.references.len(),
        "Decoded MTOM message"
    );

    Ok((envelope, attachments))
}

/// True when a `Content-Type` value is `multipart/*`.
pub fn is_multipart(content_type: &str) -> bool {
    MediaType::parse(content_type).is_multipart()
}

fn choose_boundary(xml: &[u8], attachments: &[&Binary]) -> Result<String, SoapError> {
    for _ in 0..MAX_BOUNDARY_ATTEMPTS {
        let boundary = format!("MIMEBoundary_{}", Uuid::new_v4().simple());
        let needle = boundary.as_bytes();
        let collides = find(xml, needle, 0).is_some()
            || attachments.iter().any(|a| find(a.bytes(), needle, 0).is_some());
        if !collides {
            return Ok(boundary);
        }
        warn!(boundary = %boundary, "Boundary collides with message content, regenerating");
    }
    Err(SoapError::parse(
        "could not generate a multipart boundary absent from the message content",
    ))
}

fn reference_content_id(reference: &XopReference) -> Result<String, SoapError> {
    let href = reference.href.trim();
    match href.get(..4) {
        Some(scheme) if scheme.eq_ignore_ascii_case("cid:") => Ok(decode_cid(&href[4..])),
        _ => Err(SoapError::parse(format!(
            "unsupported XOP href {:?} at {}",
            reference.href, reference.path
        ))),
    }
}

fn rehydrate(element: &mut XmlElement, resolved: &HashMap<String, Binary>) {
    for node in &mut element.children {
        match node {
            XmlNode::Element(child) => rehydrate(child, resolved),
            XmlNode::Include(href) => {
                if let Some(binary) = resolved.get(href.as_str()) {
                    *node = XmlNode::Binary(binary.clone());
                }
            }
            _ => {}
        }
    }
}

/// Split a multipart body into raw parts (headers + content), dropping the
/// preamble and epilogue.
fn split_parts<'a>(body: &'a [u8], boundary: &str) -> Result<Vec<&'a [u8]>, SoapError> {
    let delimiter = format!("--{}", boundary);
    let delimiter = delimiter.as_bytes();

    let mut pos = find_delimiter(body, delimiter, 0)
        .ok_or_else(|| SoapError::parse("multipart body does not contain the boundary"))?;
    let mut parts = Vec::new();

    loop {
        let after = pos + delimiter.len();
        if body[after..].starts_with(b"--") {
            break;
        }

        // Skip transport padding up to the end of the delimiter line
        let line_end = find(body, b"\n", after)
            .ok_or_else(|| SoapError::parse("truncated multipart body"))?;
        let start = line_end + 1;
        let next = find_delimiter(body, delimiter, start)
            .ok_or_else(|| SoapError::parse("multipart body is missing its closing boundary"))?;

        let mut end = next;
        if end > start && body[end - 1] == b'\n' {
            end -= 1;
            if end > start && body[end - 1] == b'\r' {
                end -= 1;
            }
        }
        parts.push(&body[start..end]);
        pos = next;
    }

    if parts.is_empty() {
        return Err(SoapError::parse("multipart body has no parts"));
    }
    Ok(parts)
}

/// Position of a delimiter that starts a line.
fn find_delimiter(body: &[u8], delimiter: &[u8], from: usize) -> Option<usize> {
    let mut from = from;
    while let Some(index) = find(body, delimiter, from) {
        if index == 0 || body[index - 1] == b'\n' {
            return Some(index);
        }
        from = index + 1;
    }
    None
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|index| index + from)
}

fn strip_angle_brackets(value: &str) -> &str {
    let value = value.trim();
    value
        .strip_prefix('<')
        .and_then(|v| v.strip_suffix('>'))
        .unwrap_or(value)
}

/// A MIME part: headers (names lowercased) and raw content.
struct Part<'a> {
    headers: Vec<(String, String)>,
    body: &'a [u8],
}

impl<'a> Part<'a> {
    fn parse(raw: &'a [u8]) -> Result<Self, SoapError> {
        let (head, body) = if raw.starts_with(b"\r\n") {
            (&raw[..0], &raw[2..])
        } else if raw.starts_with(b"\n") {
            (&raw[..0], &raw[1..])
        } else if let Some(index) = find(raw, b"\r\n\r\n", 0) {
            (&raw[..index], &raw[index + 4..])
        } else if let Some(index) = find(raw, b"\n\n", 0) {
            (&raw[..index], &raw[index + 2..])
        } else {
            return Err(SoapError::parse("MIME part has no header terminator"));
        };

        let head = std::str::from_utf8(head)
            .map_err(|e| SoapError::parse(format!("MIME part headers are not UTF-8: {}", e)))?;

        let mut headers: Vec<(String, String)> = Vec::new();
        for line in head.split('\n').map(|l| l.trim_end_matches('\r')) {
            if line.is_empty() {
                continue;
            }
            if line.starts_with([' ', '\t']) {
                if let Some((_, value)) = headers.last_mut() {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| SoapError::parse(format!("malformed MIME header {:?}", line)))?;
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }

        Ok(Self { headers, body })
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn content_id(&self) -> Option<String> {
        self.header("content-id")
            .map(|id| strip_angle_brackets(id).to_string())
            .filter(|id| !id.is_empty())
    }

    fn decoded_body(&self) -> Result<Vec<u8>, SoapError> {
        let encoding = self
            .header("content-transfer-encoding")
            .map(|e| e.to_ascii_lowercase());
        match encoding.as_deref() {
            None | Some("binary") | Some("8bit") | Some("7bit") => Ok(self.body.to_vec()),
            Some("base64") => {
                let compact: Vec<u8> = self
                    .body
                    .iter()
                    .copied()
                    .filter(|b| !b.is_ascii_whitespace())
                    .collect();
                STANDARD
                    .decode(compact)
                    .map_err(|e| SoapError::parse(format!("invalid base64 MIME part: {}", e)))
            }
            Some(other) => Err(SoapError::parse(format!(
                "unsupported Content-Transfer-Encoding {:?}",
                other
            ))),
        }
    }
}

/// A parsed `Content-Type` value.
pub(crate) struct MediaType {
    /// `type/subtype`, lowercased
    pub(crate) essence: String,
    params: Vec<(String, String)>,
}

impl MediaType {
    pub(crate) fn parse(value: &str) -> Self {
        let mut segments = Vec::new();
        let mut current = String::new();
        let mut in_quotes = false;
        let mut escaped = false;

        for c in value.chars() {
            if escaped {
                current.push(c);
                escaped = false;
                continue;
            }
            match c {
                '\\' if in_quotes => {
                    current.push(c);
                    escaped = true;
                }
                '"' => {
                    in_quotes = !in_quotes;
                    current.push(c);
                }
                ';' if !in_quotes => segments.push(std::mem::take(&mut current)),
                _ => current.push(c),
            }
        }
        segments.push(current);

        let mut segments = segments.into_iter();
        let essence = segments
            .next()
            .map(|s| s.trim().to_ascii_lowercase())
            .unwrap_or_default();
        let params = segments
            .filter_map(|segment| {
                let (name, value) = segment.split_once('=')?;
                Some((name.trim().to_ascii_lowercase(), unquote(value.trim())))
            })
            .collect();

        Self { essence, params }
    }

    pub(crate) fn is_multipart(&self) -> bool {
        self.essence.starts_with("multipart/")
    }

    pub(crate) fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

fn unquote(value: &str) -> String {
    let Some(inner) = value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) else {
        return value.to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}
