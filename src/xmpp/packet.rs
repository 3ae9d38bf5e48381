//! Stanza value type.
//!
//! A [`Packet`] keeps the top-level element name and its attributes parsed,
//! while children are carried as raw XML. The engine only ever needs to
//! route on top-level attributes (`id`, `type`, `to`, `from`), so payloads
//! pass through untouched.

use std::fmt;

use quick_xml::events::{BytesStart, Event};
use quick_xml::escape::escape;
use quick_xml::Reader;

use crate::constants::NS_STANZA_ERRORS;
use crate::error::{Error, Result};

/// Top-level stanza kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// `<iq/>`
    Iq,
    /// `<message/>`
    Message,
    /// `<presence/>`
    Presence,
    /// Anything else (for example `<handshake/>`).
    Other,
}

/// Value of an IQ `type` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    /// Request for information.
    Get,
    /// Request to change state.
    Set,
    /// Successful reply.
    Result,
    /// Error reply.
    Error,
}

impl IqType {
    /// Wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Result => "result",
            Self::Error => "error",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "get" => Some(Self::Get),
            "set" => Some(Self::Set),
            "result" => Some(Self::Result),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One top-level XML stanza.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    name: String,
    attributes: Vec<(String, String)>,
    inner: String,
}

impl Packet {
    /// An empty element with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            inner: String::new(),
        }
    }

    /// An IQ of the given type and id with no payload.
    pub fn iq(iq_type: IqType, id: &str) -> Self {
        let mut packet = Self::new("iq");
        packet.set_attribute("type", iq_type.as_str());
        packet.set_attribute("id", id);
        packet
    }

    /// Parse a single element from `xml`.
    ///
    /// Leading XML declarations, comments and whitespace are skipped.
    /// Anything after the element's closing tag is ignored.
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.check_end_names(false);

        loop {
            let event = reader
                .read_event()
                .map_err(|e| Error::InvalidPacket(format!("{e}")))?;
            match event {
                Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => continue,
                Event::Text(t) if t.iter().all(u8::is_ascii_whitespace) => continue,
                Event::Empty(e) => {
                    let (name, attributes) = read_tag(&e)?;
                    return Ok(Self {
                        name,
                        attributes,
                        inner: String::new(),
                    });
                }
                Event::Start(e) => {
                    let (name, attributes) = read_tag(&e)?;
                    let content_start = reader.buffer_position() as usize;
                    let content_end = find_matching_end(&mut reader)?;
                    return Ok(Self {
                        name,
                        attributes,
                        inner: xml[content_start..content_end].to_string(),
                    });
                }
                Event::Eof => return Err(Error::InvalidPacket("no element found".into())),
                other => {
                    return Err(Error::InvalidPacket(format!(
                        "unexpected content before element: {other:?}"
                    )))
                }
            }
        }
    }

    /// Element name (for example `iq`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stanza kind derived from the element name.
    pub fn kind(&self) -> PacketKind {
        match self.name.as_str() {
            "iq" => PacketKind::Iq,
            "message" => PacketKind::Message,
            "presence" => PacketKind::Presence,
            _ => PacketKind::Other,
        }
    }

    /// Value of an attribute.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set or replace an attribute, keeping the original attribute order.
    pub fn set_attribute(&mut self, key: &str, value: &str) {
        match self.attributes.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_string(),
            None => self.attributes.push((key.to_string(), value.to_string())),
        }
    }

    /// Remove an attribute, returning its value.
    pub fn remove_attribute(&mut self, key: &str) -> Option<String> {
        let idx = self.attributes.iter().position(|(k, _)| k == key)?;
        Some(self.attributes.remove(idx).1)
    }

    /// All attributes in document order.
    pub fn attributes(&self) -> &[(String, String)] {
        &self.attributes
    }

    /// The `id` attribute.
    pub fn id(&self) -> Option<&str> {
        self.attribute("id")
    }

    /// The `to` attribute.
    pub fn to(&self) -> Option<&str> {
        self.attribute("to")
    }

    /// The `from` attribute.
    pub fn from(&self) -> Option<&str> {
        self.attribute("from")
    }

    /// Parsed IQ type, or `None` for non-IQ stanzas and unknown types.
    pub fn iq_type(&self) -> Option<IqType> {
        if self.kind() != PacketKind::Iq {
            return None;
        }
        self.attribute("type").and_then(IqType::parse)
    }

    /// Whether this is an IQ `result` or `error`, i.e. a reply to a request.
    pub fn is_iq_response(&self) -> bool {
        matches!(self.iq_type(), Some(IqType::Result | IqType::Error))
    }

    /// Raw XML of the element's children.
    pub fn inner_xml(&self) -> &str {
        &self.inner
    }

    /// Replace the element's children with raw XML.
    pub fn set_inner_xml(&mut self, xml: impl Into<String>) {
        self.inner = xml.into();
    }

    /// Trimmed text content when the element has no child elements.
    pub fn text(&self) -> Option<String> {
        if self.inner.contains('<') {
            return None;
        }
        quick_xml::escape::unescape(self.inner.trim())
            .ok()
            .map(|s| s.into_owned())
    }

    /// Name of the first child element, if any.
    ///
    /// Used to read the condition of stream errors.
    pub fn first_child_name(&self) -> Option<String> {
        let mut reader = Reader::from_str(&self.inner);
        reader.check_end_names(false);
        loop {
            match reader.read_event() {
                Ok(Event::Start(e) | Event::Empty(e)) => {
                    return Some(String::from_utf8_lossy(e.local_name().as_ref()).into_owned())
                }
                Ok(Event::Eof) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    /// An empty `result` reply addressed back to the sender.
    #[must_use]
    pub fn result_reply(&self) -> Self {
        let mut reply = Self::new(self.name.clone());
        reply.set_attribute("type", IqType::Result.as_str());
        if let Some(id) = self.id() {
            reply.set_attribute("id", id);
        }
        if let Some(from) = self.from() {
            reply.set_attribute("to", from);
        }
        if let Some(to) = self.to() {
            reply.set_attribute("from", to);
        }
        reply
    }

    /// An `error` reply carrying the original payload and a stanza error condition.
    ///
    /// `error_type` is the XMPP error type (`cancel`, `modify`, `auth`, `wait`).
    #[must_use]
    pub fn error_reply(&self, condition: &str, error_type: &str) -> Self {
        let mut reply = self.clone();
        reply.set_attribute("type", "error");
        reply.remove_attribute("to");
        reply.remove_attribute("from");
        if let Some(from) = self.from() {
            reply.set_attribute("to", from);
        }
        if let Some(to) = self.to() {
            reply.set_attribute("from", to);
        }
        reply.inner.push_str(&format!(
            "<error type=\"{}\"><{} xmlns=\"{}\"/></error>",
            escape(error_type),
            condition,
            NS_STANZA_ERRORS
        ));
        reply
    }

    /// Serialize to a complete XML element.
    pub fn to_xml(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.name)?;
        for (key, value) in &self.attributes {
            write!(f, " {}=\"{}\"", key, escape(value.as_str()))?;
        }
        if self.inner.is_empty() {
            f.write_str("/>")
        } else {
            write!(f, ">{}</{}>", self.inner, self.name)
        }
    }
}

/// Build an empty packet from a start tag, used for stream headers.
pub(crate) fn from_start_tag(e: &BytesStart<'_>) -> Result<Packet> {
    let (name, attributes) = read_tag(e)?;
    Ok(Packet {
        name,
        attributes,
        inner: String::new(),
    })
}

/// Read name and unescaped attributes from a start tag.
fn read_tag(e: &BytesStart<'_>) -> Result<(String, Vec<(String, String)>)> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| Error::InvalidPacket(format!("bad attribute: {e}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| Error::InvalidPacket(format!("bad attribute value: {e}")))?
            .into_owned();
        attributes.push((key, value));
    }
    Ok((name, attributes))
}

/// Advance `reader` past the end tag matching an already-read start tag.
///
/// Returns the byte offset where that end tag begins.
fn find_matching_end(reader: &mut Reader<&[u8]>) -> Result<usize> {
    let mut depth = 0usize;
    loop {
        let pos = reader.buffer_position() as usize;
        match reader
            .read_event()
            .map_err(|e| Error::InvalidPacket(format!("{e}")))?
        {
            Event::Start(_) => depth += 1,
            Event::End(_) if depth == 0 => return Ok(pos),
            Event::End(_) => depth -= 1,
            Event::Eof => return Err(Error::InvalidPacket("unclosed element".into())),
            _ => {}
        }
    }
}
