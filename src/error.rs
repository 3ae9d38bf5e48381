//! Error taxonomy shared by the engine, manager and loader.
//!
//! Errors local to one subdomain or one bundle never abort other work;
//! only [`Error::Config`] is treated as fatal by the binary.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by whack.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or unparseable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport failure while opening a component connection.
    #[error("failed to connect to {host}:{port}: {reason}")]
    Connect {
        /// Server host.
        host: String,
        /// Server port.
        port: u16,
        /// What went wrong.
        reason: String,
    },

    /// The server rejected the handshake or closed the stream before it completed.
    #[error("handshake for '{subdomain}' failed: {reason}")]
    Handshake {
        /// Subdomain that tried to bind.
        subdomain: String,
        /// Stream error condition or other reason.
        reason: String,
    },

    /// No response arrived within the connect timeout.
    #[error("timed out waiting for server while binding '{0}'")]
    Timeout(String),

    /// The subdomain is already bound to a different component instance.
    #[error("subdomain '{0}' already in use by another component")]
    DuplicateSubdomain(String),

    /// The component is not registered with the manager.
    #[error("component '{0}' is not bound")]
    NotBound(String),

    /// The engine exists but its connection is not in the bound state.
    #[error("connection for '{0}' is not bound")]
    NotConnected(String),

    /// A stanza could not be parsed or is not valid for the operation.
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// A bundle descriptor is missing or malformed.
    #[error("bundle '{bundle}' has a bad descriptor: {reason}")]
    BundleDescriptor {
        /// Bundle name.
        bundle: String,
        /// What is missing or malformed.
        reason: String,
    },

    /// Instantiating or registering a bundle's component failed.
    #[error("failed to load bundle '{bundle}' (class '{class}'): {reason}")]
    Load {
        /// Bundle name.
        bundle: String,
        /// Entry class named by the descriptor.
        class: String,
        /// Underlying cause.
        reason: String,
    },

    /// A bundle directory could not be deleted yet.
    #[error("could not delete '{path}' after {attempts} attempts")]
    TeardownRetry {
        /// Directory being deleted.
        path: String,
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// A component reported a failure from its own lifecycle hooks.
    #[error("component error: {0}")]
    Component(String),

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_context() {
        let err = Error::Load {
            bundle: "echo".into(),
            class: "Echo".into(),
            reason: "no such class".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("echo"));
        assert!(msg.contains("Echo"));
        assert!(msg.contains("no such class"));
    }

    #[test]
    fn test_io_errors_convert() {
        fn fails() -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(Error::Io(_))));
    }
}
