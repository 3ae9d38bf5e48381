//! Incremental framing of a component stream.
//!
//! TCP delivers arbitrary chunks; [`StanzaBuffer`] accumulates them and
//! yields one [`StreamEvent`] per complete top-level unit:
//!
//! ```text
//! <?xml?><stream:stream ... id='abc'>   ──► StreamEvent::Open
//! <handshake/>                          ──► StreamEvent::Stanza
//! <iq ...>...</iq>                      ──► StreamEvent::Stanza
//! <stream:error>...</stream:error>      ──► StreamEvent::Error
//! </stream:stream>                      ──► StreamEvent::Close
//! ```
//!
//! The stream header is consumed as soon as its start tag is complete, so
//! every later stanza is parsed at depth zero.

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::constants::MAX_STANZA_BUFFER_SIZE;
use crate::error::{Error, Result};

use super::packet::{from_start_tag, Packet};

/// One complete unit read from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The peer's stream header; attributes carry `id`, `from`, etc.
    Open(Packet),
    /// A complete top-level stanza.
    Stanza(Packet),
    /// A `<stream:error/>` element.
    Error(Packet),
    /// The peer closed the stream with `</stream:stream>`.
    Close,
}

/// Accumulates raw bytes and extracts complete stream events.
#[derive(Debug, Default)]
pub struct StanzaBuffer {
    buf: Vec<u8>,
}

impl StanzaBuffer {
    /// An empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the socket.
    ///
    /// # Errors
    ///
    /// Fails when the buffered, still-incomplete data exceeds
    /// [`MAX_STANZA_BUFFER_SIZE`].
    pub fn push(&mut self, data: &[u8]) -> Result<()> {
        if self.buf.len() + data.len() > MAX_STANZA_BUFFER_SIZE {
            return Err(Error::InvalidPacket(format!(
                "stanza buffer exceeded {MAX_STANZA_BUFFER_SIZE} bytes"
            )));
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Number of buffered bytes not yet consumed.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Extract the next complete event, if the buffer holds one.
    ///
    /// Returns `Ok(None)` when more data is needed.
    ///
    /// # Errors
    ///
    /// Fails on XML that can never become well-formed (a stray end tag,
    /// invalid UTF-8, a malformed element).
    pub fn next_event(&mut self) -> Result<Option<StreamEvent>> {
        match extract(&self.buf)? {
            Some((event, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(event))
            }
            None => Ok(None),
        }
    }
}

fn is_stream_tag(name: &[u8]) -> bool {
    name == b"stream:stream" || name == b"stream"
}

fn classify(packet: Packet) -> StreamEvent {
    if packet.name() == "stream:error" {
        StreamEvent::Error(packet)
    } else {
        StreamEvent::Stanza(packet)
    }
}

fn parse_slice(bytes: &[u8]) -> Result<Packet> {
    let xml = std::str::from_utf8(bytes)
        .map_err(|e| Error::InvalidPacket(format!("stanza is not UTF-8: {e}")))?;
    Packet::parse(xml)
}

/// Find the first complete event in `buf` and how many bytes it spans.
fn extract(buf: &[u8]) -> Result<Option<(StreamEvent, usize)>> {
    let mut reader = Reader::from_reader(buf);
    reader.check_end_names(false);

    let mut depth = 0usize;
    let mut stanza_start = 0usize;

    loop {
        let pos = reader.buffer_position() as usize;
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(e) => {
                // Running off the end of the buffer means the peer has not
                // sent the rest of the tag yet.
                if reader.buffer_position() as usize >= buf.len() || !buf[pos..].contains(&b'>') {
                    return Ok(None);
                }
                return Err(Error::InvalidPacket(format!("malformed stream: {e}")));
            }
        };

        match event {
            Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => {}
            Event::Text(_) | Event::CData(_) => {}
            Event::Start(e) => {
                if depth == 0 && is_stream_tag(e.name().as_ref()) {
                    let end = reader.buffer_position() as usize;
                    return Ok(Some((StreamEvent::Open(from_start_tag(&e)?), end)));
                }
                if depth == 0 {
                    stanza_start = pos;
                }
                depth += 1;
            }
            Event::Empty(e) => {
                if depth == 0 {
                    let end = reader.buffer_position() as usize;
                    if is_stream_tag(e.name().as_ref()) {
                        return Ok(Some((StreamEvent::Open(from_start_tag(&e)?), end)));
                    }
                    return Ok(Some((classify(parse_slice(&buf[pos..end])?), end)));
                }
            }
            Event::End(e) => {
                let end = reader.buffer_position() as usize;
                if depth == 0 {
                    if is_stream_tag(e.name().as_ref()) {
                        return Ok(Some((StreamEvent::Close, end)));
                    }
                    return Err(Error::InvalidPacket(format!(
                        "unexpected end tag '{}'",
                        String::from_utf8_lossy(e.name().as_ref())
                    )));
                }
                depth -= 1;
                if depth == 0 {
                    let packet = parse_slice(&buf[stanza_start..end])?;
                    return Ok(Some((classify(packet), end)));
                }
            }
            Event::Eof => return Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER_HEADER: &str = "<?xml version='1.0'?><stream:stream xmlns:stream='http://etherx.jabber.org/streams' \
         xmlns='jabber:component:accept' from='echo.example.com' id='abc123'>";

    #[test]
    fn test_stream_open_yields_header_attributes() {
        let mut buffer = StanzaBuffer::new();
        buffer.push(SERVER_HEADER.as_bytes()).unwrap();
        match buffer.next_event().unwrap() {
            Some(StreamEvent::Open(header)) => {
                assert_eq!(header.id(), Some("abc123"));
                assert_eq!(header.from(), Some("echo.example.com"));
            }
            other => panic!("expected Open, got {other:?}"),
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_partial_stanza_waits_for_more_data() {
        let mut buffer = StanzaBuffer::new();
        buffer.push(b"<message to='a@b'><body>hel").unwrap();
        assert_eq!(buffer.next_event().unwrap(), None);
        buffer.push(b"lo</body></message>").unwrap();
        match buffer.next_event().unwrap() {
            Some(StreamEvent::Stanza(p)) => assert_eq!(p.inner_xml(), "<body>hello</body>"),
            other => panic!("expected Stanza, got {other:?}"),
        }
    }

    #[test]
    fn test_split_inside_tag() {
        let mut buffer = StanzaBuffer::new();
        buffer.push(b"<iq type='res").unwrap();
        assert_eq!(buffer.next_event().unwrap(), None);
        buffer.push(b"ult' id='1'/>").unwrap();
        match buffer.next_event().unwrap() {
            Some(StreamEvent::Stanza(p)) => assert!(p.is_iq_response()),
            other => panic!("expected Stanza, got {other:?}"),
        }
    }

    #[test]
    fn test_multiple_stanzas_in_one_chunk() {
        let mut buffer = StanzaBuffer::new();
        buffer.push(b"<handshake/>\n<presence/><message><body>x</body></message>").unwrap();
        let mut names = Vec::new();
        while let Some(event) = buffer.next_event().unwrap() {
            if let StreamEvent::Stanza(p) = event {
                names.push(p.name().to_string());
            }
        }
        assert_eq!(names, vec!["handshake", "presence", "message"]);
    }

    #[test]
    fn test_stream_error_and_close() {
        let mut buffer = StanzaBuffer::new();
        buffer
            .push(b"<stream:error><not-authorized xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error></stream:stream>")
            .unwrap();
        match buffer.next_event().unwrap() {
            Some(StreamEvent::Error(p)) => {
                assert_eq!(p.first_child_name().as_deref(), Some("not-authorized"));
            }
            other => panic!("expected Error, got {other:?}"),
        }
        assert_eq!(buffer.next_event().unwrap(), Some(StreamEvent::Close));
    }

    #[test]
    fn test_stray_end_tag_is_an_error() {
        let mut buffer = StanzaBuffer::new();
        buffer.push(b"</message>").unwrap();
        assert!(buffer.next_event().is_err());
    }

    #[test]
    fn test_oversized_buffer_rejected() {
        let mut buffer = StanzaBuffer::new();
        let chunk = vec![b'a'; MAX_STANZA_BUFFER_SIZE];
        buffer.push(&chunk).unwrap();
        assert!(buffer.push(b"b").is_err());
    }
}
