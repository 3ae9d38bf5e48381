//! The component capability set.
//!
//! A component is supplied by the deployer. The host only calls the four
//! lifecycle hooks below and never looks inside.
//!
//! # Lifecycle
//!
//! ```text
//! ComponentManager::add_component ──► connect + handshake
//!                                  ──► Component::initialize(jid, manager)
//!                                  ──► engine starts reading
//! inbound stanza ──────────────────► Component::process_packet(packet)
//! ComponentManager::remove_component ► Component::shutdown()
//! ```

use std::sync::Arc;

use crate::error::Result;
use crate::manager::ComponentManager;
use crate::xmpp::{Jid, Packet};

/// An external component bound to one subdomain.
///
/// Implementations are shared between the manager, the engine's dispatcher
/// thread and the loader, so they must be `Send + Sync`.
pub trait Component: Send + Sync {
    /// Human-readable name.
    fn name(&self) -> String;

    /// Short description.
    fn description(&self) -> String {
        String::new()
    }

    /// Called once the stream is bound, before any packet is delivered.
    ///
    /// `manager` is how the component sends packets and issues queries,
    /// passing itself as the `component` argument.
    ///
    /// # Errors
    ///
    /// Returning an error rolls back the registration.
    fn initialize(&self, jid: &Jid, manager: &Arc<ComponentManager>) -> Result<()>;

    /// Handle one inbound stanza.
    ///
    /// Called on the subdomain's dispatcher thread, in wire order. A slow
    /// handler delays only this subdomain.
    fn process_packet(&self, packet: Packet);

    /// Called once when the binding is torn down.
    fn shutdown(&self);
}

/// Receives the outcome of an asynchronous IQ query.
///
/// Exactly one of the two methods is called, exactly once.
pub trait IqResultListener: Send + Sync {
    /// The matching `result` or `error` reply arrived.
    fn received_answer(&self, packet: Packet);

    /// No reply arrived before the entry expired or the connection was lost.
    fn answer_timeout(&self, packet_id: &str);
}

/// Identity of a component instance.
///
/// Two keys are equal exactly when they refer to the same object, which is
/// how the manager maps a component back to its engine without requiring
/// components to implement `Eq` or `Hash`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentKey(usize);

impl ComponentKey {
    /// Key of the component behind `component`.
    pub fn of(component: &dyn Component) -> Self {
        Self((component as *const dyn Component).cast::<()>() as usize)
    }
}
