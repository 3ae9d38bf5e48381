//! Whack - XMPP external component host (JEP-0014).
//!
//! Attaches components to an XMPP server as external components. Each
//! component owns a subdomain, authenticates with a shared secret and
//! exchanges stanzas over its own TCP stream.
//!
//! # Architecture
//!
//! - **Engine** - one connection per subdomain: handshake, read loop,
//!   serialized writes, IQ correlation
//! - **Manager** - subdomain and component registry, secrets, queries,
//!   reconnection
//! - **Loader** - hot deployment of packaged bundles from a directory
//!
//! # Modules
//!
//! - [`xmpp`] - JIDs, stanzas and stream framing
//! - [`engine`] - the protocol engine
//! - [`manager`] - the component manager
//! - [`loader`] - the component loader
//! - [`config`] - configuration loading

pub mod component;
pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod file_watcher;
pub mod hash;
pub mod loader;
pub mod manager;
pub mod util;
pub mod xmpp;

// Re-export commonly used types
pub use component::{Component, ComponentKey, IqResultListener};
pub use config::Config;
pub use engine::ExternalComponent;
pub use error::{Error, Result};
pub use loader::context::ComponentRegistry;
pub use loader::{ComponentLoader, LoaderOptions};
pub use manager::{ComponentManager, ReconnectPolicy};
pub use xmpp::{IqType, Jid, Packet, PacketKind};
