//! Application-wide constants for whack.
//!
//! This module centralizes protocol constants and timing knobs so the
//! engine, manager and loader agree on them. Constants are grouped by
//! domain.
//!
//! # Categories
//!
//! - **Protocol**: XML namespaces and well-known element names
//! - **Timeouts**: Connection and IQ correlation windows
//! - **Loader**: Scan cadence and directory teardown retries

use std::time::Duration;

// ============================================================================
// Protocol
// ============================================================================

/// Default TCP port servers listen on for external components.
pub const DEFAULT_COMPONENT_PORT: u16 = 5275;

/// Default namespace of a component stream.
pub const NS_COMPONENT_ACCEPT: &str = "jabber:component:accept";

/// Namespace bound to the `stream:` prefix.
pub const NS_STREAMS: &str = "http://etherx.jabber.org/streams";

/// Namespace of stanza error conditions.
pub const NS_STANZA_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// Closing tag sent when a component leaves the stream.
pub const STREAM_CLOSE: &str = "</stream:stream>";

/// Maximum size of the inbound stanza buffer.
///
/// A server that never completes a stanza would otherwise grow the buffer
/// without bound. Legitimate component traffic stays far below 1 MB.
pub const MAX_STANZA_BUFFER_SIZE: usize = 1024 * 1024;

// ============================================================================
// Timeouts
// ============================================================================

/// Default timeout for connect and handshake, in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;

/// How long an asynchronous IQ listener stays registered without a reply.
///
/// Bounds the correlation table when a reply never arrives.
pub const ASYNC_QUERY_EXPIRY: Duration = Duration::from_secs(300);

/// How often a connection's read task sweeps expired IQ entries.
pub const IQ_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// How long one stanza write may take before the connection is dropped.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the host waits for a scripted component to answer a lifecycle call.
pub const SCRIPT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Reconnection
// ============================================================================

/// Worker threads of the connection runtime.
pub const RUNTIME_WORKER_THREADS: usize = 2;

/// Default number of reconnect attempts after a lost connection.
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;

/// Default delay before the first reconnect attempt, in milliseconds.
pub const DEFAULT_RECONNECT_INITIAL_DELAY_MS: u64 = 1000;

/// Default ceiling of the reconnect backoff, in milliseconds.
pub const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;

// ============================================================================
// Loader
// ============================================================================

/// Interval between component directory scans, in seconds.
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 10;

/// Number of attempts to delete a stale bundle directory before giving up
/// until the next scan.
pub const DEFAULT_DELETE_RETRY_LIMIT: u32 = 5;

/// Delay between bundle directory delete attempts, in milliseconds.
pub const DEFAULT_DELETE_RETRY_DELAY_MS: u64 = 5000;

/// Name of the descriptor every bundle must carry at its root.
pub const BUNDLE_DESCRIPTOR: &str = "component.xml";

/// File extensions recognized as bundle packages (lowercase).
pub const BUNDLE_EXTENSIONS: &[&str] = &["jar", "war", "zip"];

/// Name of the configuration file inside the home directory.
pub const CONFIG_FILE_NAME: &str = "whack.json";

/// Name of the directory under home that holds component bundles.
pub const COMPONENTS_DIR_NAME: &str = "components";
