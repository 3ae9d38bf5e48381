//! XMPP primitives used on the component stream.
//!
//! - [`jid`] - addresses
//! - [`packet`] - stanza values
//! - [`stream`] - incremental framing of the TCP byte stream

pub mod jid;
pub mod packet;
pub mod stream;

pub use jid::Jid;
pub use packet::{IqType, Packet, PacketKind};
pub use stream::{StanzaBuffer, StreamEvent};
