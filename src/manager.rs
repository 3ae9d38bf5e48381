//! Component Manager: the registry and control plane.
//!
//! Maps each subdomain to its [`ExternalComponent`] engine, and each
//! component instance to the same engine so a component can reach the
//! stream knowing only itself. Both maps live under one mutex and are only
//! touched here.
//!
//! Secrets, multiple-binding flags, the server name and the connect
//! timeout are configuration state read when an engine connects; changing
//! them never affects engines that are already bound.
//!
//! # Reconnection
//!
//! When a bound engine loses its connection, pending IQs have already been
//! failed as timeouts by the engine. The manager then retries on a fresh
//! engine following its [`ReconnectPolicy`], without re-initializing the
//! component. If every attempt fails the binding is removed.
//!
//! # Runtime
//!
//! The manager owns the tokio runtime every engine's I/O tasks and every
//! reconnection run on. Its public API stays blocking; calls bridge into
//! the runtime and only block the calling thread.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use scopeguard::ScopeGuard;
use tokio::runtime::{Handle, Runtime};
use tokio_util::sync::CancellationToken;

use crate::component::{Component, ComponentKey, IqResultListener};
use crate::constants::{
    DEFAULT_COMPONENT_PORT, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_RECONNECT_ATTEMPTS,
    DEFAULT_RECONNECT_INITIAL_DELAY_MS, DEFAULT_RECONNECT_MAX_DELAY_MS, RUNTIME_WORKER_THREADS,
    WRITE_TIMEOUT,
};
use crate::engine::ExternalComponent;
use crate::error::{Error, Result};
use crate::util::{block_on, lock};
use crate::xmpp::Packet;

/// Retry schedule after a bound connection is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts before the binding is dropped. Zero disables reconnection.
    pub max_attempts: u32,
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Upper bound for the doubled delay.
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            initial_delay: Duration::from_millis(DEFAULT_RECONNECT_INITIAL_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_RECONNECT_MAX_DELAY_MS),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug)]
struct Settings {
    server_name: Option<String>,
    connect_timeout: Duration,
    default_secret: Option<String>,
    secrets: HashMap<String, String>,
    allow_multiple: HashMap<String, bool>,
    properties: HashMap<String, String>,
    reconnect: ReconnectPolicy,
}

#[derive(Default)]
struct Bindings {
    by_subdomain: HashMap<String, Arc<ExternalComponent>>,
    by_component: HashMap<ComponentKey, Arc<ExternalComponent>>,
}

impl Bindings {
    fn insert(&mut self, subdomain: &str, engine: &Arc<ExternalComponent>) {
        let key = ComponentKey::of(engine.component().as_ref());
        self.by_subdomain
            .insert(subdomain.to_string(), Arc::clone(engine));
        self.by_component.insert(key, Arc::clone(engine));
    }

    /// Remove the binding of `subdomain` only if it is still `engine`.
    fn remove_if(&mut self, subdomain: &str, engine: &Arc<ExternalComponent>) -> bool {
        match self.by_subdomain.get(subdomain) {
            Some(current) if Arc::ptr_eq(current, engine) => {
                self.by_subdomain.remove(subdomain);
                self.by_component
                    .remove(&ComponentKey::of(engine.component().as_ref()));
                true
            }
            _ => false,
        }
    }

    fn is_current(&self, subdomain: &str, engine: &Arc<ExternalComponent>) -> bool {
        self.by_subdomain
            .get(subdomain)
            .is_some_and(|current| Arc::ptr_eq(current, engine))
    }
}

/// Registry of bound components and their engines.
pub struct ComponentManager {
    host: String,
    port: u16,
    me: Weak<ComponentManager>,
    settings: Mutex<Settings>,
    bindings: Mutex<Bindings>,
    /// Cancelled by `shutdown_all`; stops reconnection back-off.
    stopping: CancellationToken,
    handle: Handle,
    /// Taken on drop so the runtime can be released from any context.
    runtime: Option<Runtime>,
}

impl std::fmt::Debug for ComponentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentManager")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("subdomains", &self.subdomains())
            .finish_non_exhaustive()
    }
}

impl ComponentManager {
    /// A manager connecting to `host` on the default component port.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the connection runtime cannot be started.
    pub fn new(host: impl Into<String>) -> Result<Arc<Self>> {
        Self::with_port(host, DEFAULT_COMPONENT_PORT)
    }

    /// A manager connecting to `host:port`.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the connection runtime cannot be started.
    pub fn with_port(host: impl Into<String>, port: u16) -> Result<Arc<Self>> {
        let host = host.into();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(RUNTIME_WORKER_THREADS)
            .thread_name("whack-io")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Arc::new_cyclic(|me| Self {
            host,
            port,
            me: me.clone(),
            settings: Mutex::new(Settings {
                server_name: None,
                connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
                default_secret: None,
                secrets: HashMap::new(),
                allow_multiple: HashMap::new(),
                properties: HashMap::new(),
                reconnect: ReconnectPolicy::default(),
            }),
            bindings: Mutex::new(Bindings::default()),
            stopping: CancellationToken::new(),
            handle,
            runtime: Some(runtime),
        }))
    }

    /// Server host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Server port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Runtime the engines' I/O tasks run on.
    pub(crate) fn runtime(&self) -> &Handle {
        &self.handle
    }

    // ------------------------------------------------------------------
    // Configuration state
    // ------------------------------------------------------------------

    /// Set the secret used by `subdomain`.
    pub fn set_secret_key(&self, subdomain: &str, secret: &str) {
        lock(&self.settings)
            .secrets
            .insert(subdomain.to_string(), secret.to_string());
    }

    /// Secret for `subdomain`, falling back to the default secret.
    pub fn secret_key(&self, subdomain: &str) -> Option<String> {
        let settings = lock(&self.settings);
        settings
            .secrets
            .get(subdomain)
            .cloned()
            .or_else(|| settings.default_secret.clone())
    }

    /// Set the secret used by subdomains without their own.
    pub fn set_default_secret_key(&self, secret: &str) {
        lock(&self.settings).default_secret = Some(secret.to_string());
    }

    /// Whether `subdomain` advertises support for multiple bindings.
    pub fn is_multiple_allowed(&self, subdomain: &str) -> bool {
        lock(&self.settings)
            .allow_multiple
            .get(subdomain)
            .copied()
            .unwrap_or(false)
    }

    /// Set the multiple-bindings flag for `subdomain`.
    pub fn set_multiple_allowed(&self, subdomain: &str, allowed: bool) {
        lock(&self.settings)
            .allow_multiple
            .insert(subdomain.to_string(), allowed);
    }

    /// XMPP domain of the server, if configured.
    ///
    /// Without one, components bind with their bare subdomain and the
    /// server is expected to append its own domain.
    pub fn server_name(&self) -> Option<String> {
        lock(&self.settings).server_name.clone()
    }

    /// Set the XMPP domain of the server.
    pub fn set_server_name(&self, domain: &str) {
        lock(&self.settings).server_name = Some(domain.to_string());
    }

    /// How long `connect` waits for the server.
    pub fn connect_timeout(&self) -> Duration {
        lock(&self.settings).connect_timeout
    }

    /// Set how long `connect` waits for the server.
    pub fn set_connect_timeout(&self, timeout: Duration) {
        lock(&self.settings).connect_timeout = timeout;
    }

    /// Current reconnection schedule.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        lock(&self.settings).reconnect
    }

    /// Replace the reconnection schedule.
    pub fn set_reconnect_policy(&self, policy: ReconnectPolicy) {
        lock(&self.settings).reconnect = policy;
    }

    /// Property value, namespaced by the server domain.
    pub fn get_property(&self, name: &str) -> Option<String> {
        let settings = lock(&self.settings);
        let key = property_key(settings.server_name.as_deref(), name);
        settings.properties.get(&key).cloned()
    }

    /// Store a property, namespaced by the server domain.
    pub fn set_property(&self, name: &str, value: &str) {
        let mut settings = lock(&self.settings);
        let key = property_key(settings.server_name.as_deref(), name);
        settings.properties.insert(key, value.to_string());
    }

    /// Components managed here always run outside the server process.
    pub fn is_external_mode(&self) -> bool {
        true
    }

    // ------------------------------------------------------------------
    // Bindings
    // ------------------------------------------------------------------

    /// Bound subdomains, sorted.
    pub fn subdomains(&self) -> Vec<String> {
        let mut subdomains: Vec<_> = lock(&self.bindings).by_subdomain.keys().cloned().collect();
        subdomains.sort();
        subdomains
    }

    /// Whether `subdomain` has a binding whose connection is up.
    pub fn is_bound(&self, subdomain: &str) -> bool {
        lock(&self.bindings)
            .by_subdomain
            .get(subdomain)
            .is_some_and(|engine| engine.is_bound())
    }

    /// Component bound to `subdomain`.
    pub fn component(&self, subdomain: &str) -> Option<Arc<dyn Component>> {
        lock(&self.bindings)
            .by_subdomain
            .get(subdomain)
            .map(|engine| Arc::clone(engine.component()))
    }

    /// Bind `component` to `subdomain` on the manager's port.
    ///
    /// Connects, performs the handshake, initializes the component and
    /// starts reading. Adding the same instance twice is a no-op.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateSubdomain`] if another instance holds `subdomain`
    /// - any connect or handshake error, or the component's own
    ///   initialization error; the registration is rolled back first
    pub fn add_component(self: &Arc<Self>, subdomain: &str, component: Arc<dyn Component>) -> Result<()> {
        self.add_component_on_port(subdomain, component, self.port)
    }

    /// Bind `component` to `subdomain` through `port` instead of the
    /// manager's port.
    ///
    /// Reconnections of this binding use the same port.
    ///
    /// # Errors
    ///
    /// As [`add_component`](Self::add_component).
    pub fn add_component_on_port(
        self: &Arc<Self>,
        subdomain: &str,
        component: Arc<dyn Component>,
        port: u16,
    ) -> Result<()> {
        let key = ComponentKey::of(component.as_ref());
        let engine = {
            let mut bindings = lock(&self.bindings);
            if let Some(existing) = bindings.by_subdomain.get(subdomain) {
                if ComponentKey::of(existing.component().as_ref()) == key {
                    return Ok(());
                }
                return Err(Error::DuplicateSubdomain(subdomain.to_string()));
            }
            let engine = Arc::new(self.new_engine(subdomain, Arc::clone(&component)));
            bindings.insert(subdomain, &engine);
            engine
        };

        let rollback = scopeguard::guard(Arc::clone(&engine), |engine| {
            lock(&self.bindings).remove_if(subdomain, &engine);
            engine.close();
        });

        engine.connect(&self.host, port, self.connect_timeout())?;
        component.initialize(&engine.jid(), self)?;
        self.watch_connection(subdomain, &engine, port);
        engine.start()?;

        ScopeGuard::into_inner(rollback);
        log::info!(
            "[Manager] Bound '{}' to {}",
            component.name(),
            engine.domain()
        );
        Ok(())
    }

    /// Unbind `subdomain` and shut its component down.
    ///
    /// Unknown subdomains are ignored.
    pub fn remove_component(&self, subdomain: &str) {
        let engine = {
            let mut bindings = lock(&self.bindings);
            let engine = bindings.by_subdomain.get(subdomain).cloned();
            if let Some(engine) = &engine {
                bindings.remove_if(subdomain, engine);
            }
            engine
        };
        if let Some(engine) = engine {
            engine.shutdown();
            log::info!("[Manager] Unbound '{subdomain}'");
        }
    }

    /// Unbind every subdomain and stop pending reconnections.
    ///
    /// Waits a bounded time for every stream to be closed on the wire.
    pub fn shutdown_all(&self) {
        self.stopping.cancel();
        let engines: Vec<_> = lock(&self.bindings).by_subdomain.values().cloned().collect();
        for subdomain in self.subdomains() {
            self.remove_component(&subdomain);
        }

        let closing = async {
            for engine in &engines {
                engine.wait_closed().await;
            }
        };
        if block_on(&self.handle, tokio::time::timeout(WRITE_TIMEOUT, closing)).is_err() {
            log::warn!("[Manager] Streams still closing after {WRITE_TIMEOUT:?}");
        }
    }

    // ------------------------------------------------------------------
    // Stanza plumbing
    // ------------------------------------------------------------------

    /// Send `packet` on the stream of `component`.
    ///
    /// # Errors
    ///
    /// [`Error::NotBound`] if `component` is not registered, or the
    /// engine's send error.
    pub fn send_packet(&self, component: &dyn Component, packet: Packet) -> Result<()> {
        self.engine_of(component)?.send(packet)
    }

    /// Send an IQ and wait up to `timeout` for its reply.
    ///
    /// Returns `Ok(None)` on timeout.
    ///
    /// # Errors
    ///
    /// [`Error::NotBound`], [`Error::InvalidPacket`] for non-IQ packets, or
    /// the send error.
    pub fn query(&self, component: &dyn Component, packet: Packet, timeout: Duration) -> Result<Option<Packet>> {
        self.engine_of(component)?.query(packet, timeout)
    }

    /// Send an IQ and report its outcome to `listener`.
    ///
    /// # Errors
    ///
    /// [`Error::NotBound`], [`Error::InvalidPacket`] for non-IQ packets, or
    /// the send error.
    pub fn query_async(
        &self,
        component: &dyn Component,
        packet: Packet,
        listener: Arc<dyn IqResultListener>,
    ) -> Result<()> {
        self.engine_of(component)?.query_async(packet, listener)
    }

    pub(crate) fn send_packet_by_key(&self, key: ComponentKey, packet: Packet) -> Result<()> {
        self.engine_by_key(key, "component")?.send(packet)
    }

    pub(crate) fn query_by_key(&self, key: ComponentKey, packet: Packet, timeout: Duration) -> Result<Option<Packet>> {
        self.engine_by_key(key, "component")?.query(packet, timeout)
    }

    fn engine_of(&self, component: &dyn Component) -> Result<Arc<ExternalComponent>> {
        self.engine_by_key(ComponentKey::of(component), &component.name())
    }

    fn engine_by_key(&self, key: ComponentKey, label: &str) -> Result<Arc<ExternalComponent>> {
        lock(&self.bindings)
            .by_component
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotBound(label.to_string()))
    }

    fn new_engine(&self, subdomain: &str, component: Arc<dyn Component>) -> ExternalComponent {
        let domain = match self.server_name() {
            Some(server) if !server.is_empty() => format!("{subdomain}.{server}"),
            _ => subdomain.to_string(),
        };
        ExternalComponent::new(
            subdomain,
            domain,
            component,
            self.secret_key(subdomain),
            self.is_multiple_allowed(subdomain),
            self.handle.clone(),
        )
    }

    // ------------------------------------------------------------------
    // Reconnection
    // ------------------------------------------------------------------

    fn watch_connection(&self, subdomain: &str, engine: &Arc<ExternalComponent>, port: u16) {
        let manager = self.me.clone();
        let lost = Arc::downgrade(engine);
        let subdomain = subdomain.to_string();
        engine.set_disconnect_handler(Box::new(move || {
            if let (Some(manager), Some(lost)) = (manager.upgrade(), lost.upgrade()) {
                let runtime = manager.handle.clone();
                runtime.spawn(manager.reconnect(subdomain, lost, port));
            }
        }));
    }

    async fn reconnect(self: Arc<Self>, subdomain: String, lost: Arc<ExternalComponent>, port: u16) {
        let policy = self.reconnect_policy();
        lost.close();

        for attempt in 1..=policy.max_attempts {
            tokio::select! {
                () = self.stopping.cancelled() => return,
                () = tokio::time::sleep(policy.delay(attempt)) => {}
            }
            if !lock(&self.bindings).is_current(&subdomain, &lost) {
                log::debug!("[Manager] '{subdomain}' was removed; not reconnecting");
                return;
            }

            log::info!(
                "[Manager] Reconnecting '{subdomain}' (attempt {attempt}/{})",
                policy.max_attempts
            );
            let engine = Arc::new(self.new_engine(&subdomain, Arc::clone(lost.component())));
            let connected = match engine
                .connect_async(&self.host, port, self.connect_timeout())
                .await
            {
                Ok(()) => {
                    self.watch_connection(&subdomain, &engine, port);
                    engine.start()
                }
                Err(e) => Err(e),
            };

            match connected {
                Ok(()) => {
                    let replaced = {
                        let mut bindings = lock(&self.bindings);
                        let replaced = bindings.remove_if(&subdomain, &lost);
                        if replaced {
                            bindings.insert(&subdomain, &engine);
                        }
                        replaced
                    };
                    if replaced {
                        log::info!("[Manager] Reconnected '{subdomain}'");
                    } else {
                        engine.close();
                    }
                    return;
                }
                Err(e) => {
                    engine.close();
                    log::warn!("[Manager] Reconnect attempt {attempt} for '{subdomain}' failed: {e}");
                }
            }
        }

        if lock(&self.bindings).is_current(&subdomain, &lost) {
            log::error!("[Manager] Giving up on '{subdomain}'; removing binding");
            tokio::task::block_in_place(|| self.remove_component(&subdomain));
        }
    }
}

impl Drop for ComponentManager {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

fn property_key(server_name: Option<&str>, name: &str) -> String {
    format!("whack.{}.{name}", server_name.unwrap_or_default())
}
