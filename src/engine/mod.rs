//! Protocol engine: one component connection to the XMPP server.
//!
//! An [`ExternalComponent`] owns a single TCP stream for one subdomain and
//! moves through three phases:
//!
//! ```text
//! new ──connect()──► bound ──start()──► read task + dispatcher
//!                      │                    │
//!                 write task                │
//!           shutdown() / close() ◄──────────┘ (or connection loss)
//! ```
//!
//! # Tasks
//!
//! The stream is split once the handshake succeeds and each half gets a
//! task on the manager's runtime:
//!
//! - **Write task** drains an unbounded queue of serialized stanzas, so
//!   [`send`](ExternalComponent::send) never blocks and stanzas are never
//!   interleaved. On close it flushes the queue and ends the stream.
//! - **Read task** parses inbound stanzas. IQ replies with a pending id are
//!   handed to their listener; everything else is queued for the
//!   dispatcher. A ticker sweeps expired IQ entries in between.
//! - **Dispatcher** calls [`Component::process_packet`] in wire order on the
//!   blocking pool, so a handler may wait on a synchronous query without
//!   starving the read task that delivers its reply.
//!
//! One [`CancellationToken`] per engine stops both I/O tasks.

pub mod correlation;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use quick_xml::escape::escape;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::component::{Component, IqResultListener};
use crate::constants::{
    ASYNC_QUERY_EXPIRY, IQ_SWEEP_INTERVAL, NS_COMPONENT_ACCEPT, NS_STREAMS, STREAM_CLOSE,
    WRITE_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::hash::handshake_digest;
use crate::util::{block_on, lock, new_packet_id};
use crate::xmpp::{Jid, Packet, PacketKind, StanzaBuffer, StreamEvent};

pub use correlation::PendingIqs;

/// Called on the read task after the connection dropped unexpectedly.
pub type DisconnectHandler = Box<dyn FnOnce() + Send>;

/// Bytes read per socket call.
const READ_CHUNK: usize = 8192;

/// The protocol engine of one bound subdomain.
pub struct ExternalComponent {
    subdomain: String,
    domain: String,
    component: Arc<dyn Component>,
    secret: Option<String>,
    allow_multiple: bool,
    runtime: Handle,
    stream_id: Mutex<Option<String>>,
    outbound: Mutex<Option<UnboundedSender<String>>>,
    /// Read half and any bytes that arrived right after the handshake.
    reader: Mutex<Option<(OwnedReadHalf, StanzaBuffer)>>,
    pending: Mutex<PendingIqs>,
    bound: AtomicBool,
    shut_down: AtomicBool,
    closed: AtomicBool,
    cancel: CancellationToken,
    on_disconnect: Mutex<Option<DisconnectHandler>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ExternalComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalComponent")
            .field("subdomain", &self.subdomain)
            .field("domain", &self.domain)
            .field("bound", &self.is_bound())
            .finish_non_exhaustive()
    }
}

impl ExternalComponent {
    /// An unconnected engine for `component` on `subdomain`.
    ///
    /// `domain` is the full address the component answers to, usually
    /// `subdomain.serverdomain`. `secret` is resolved by the caller (the
    /// subdomain's own secret or the default one). I/O tasks run on
    /// `runtime`.
    pub fn new(
        subdomain: impl Into<String>,
        domain: impl Into<String>,
        component: Arc<dyn Component>,
        secret: Option<String>,
        allow_multiple: bool,
        runtime: Handle,
    ) -> Self {
        Self {
            subdomain: subdomain.into(),
            domain: domain.into(),
            component,
            secret,
            allow_multiple,
            runtime,
            stream_id: Mutex::new(None),
            outbound: Mutex::new(None),
            reader: Mutex::new(None),
            pending: Mutex::new(PendingIqs::new()),
            bound: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            on_disconnect: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Subdomain this engine binds.
    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    /// Full domain the component is addressed by.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// JID of the bound component.
    pub fn jid(&self) -> Jid {
        Jid::domain(self.domain.clone())
    }

    /// The component this engine serves.
    pub fn component(&self) -> &Arc<dyn Component> {
        &self.component
    }

    /// Stream id assigned by the server during the last handshake.
    pub fn stream_id(&self) -> Option<String> {
        lock(&self.stream_id).clone()
    }

    /// Whether the handshake succeeded and the connection is still up.
    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::SeqCst)
    }

    /// Number of IQ requests awaiting a reply.
    pub fn pending_queries(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Install the callback fired once when the connection is lost.
    pub fn set_disconnect_handler(&self, handler: DisconnectHandler) {
        *lock(&self.on_disconnect) = Some(handler);
    }

    /// Blocking form of [`connect_async`](Self::connect_async).
    pub fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<()> {
        block_on(&self.runtime, self.connect_async(host, port, timeout))
    }

    /// Open the TCP connection and perform the JEP-0014 handshake.
    ///
    /// The whole exchange is bounded by `timeout`. On success the engine is
    /// bound and can send, but does not read until [`start`](Self::start)
    /// is called after the component is initialized.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] when no secret is available
    /// - [`Error::Connect`] when the socket cannot be opened or fails
    /// - [`Error::Handshake`] when the server rejects the digest or closes
    ///   the stream before accepting it
    /// - [`Error::Timeout`] when the server does not answer in time
    pub async fn connect_async(&self, host: &str, port: u16, timeout: Duration) -> Result<()> {
        let secret = self.secret.as_deref().ok_or_else(|| {
            Error::Config(format!("no secret configured for '{}'", self.subdomain))
        })?;
        match tokio::time::timeout(timeout, self.handshake(host, port, secret)).await {
            Ok(result) => result,
            Err(_elapsed) => {
                log::warn!(
                    "[Engine:{}] No answer from {host}:{port} within {timeout:?}",
                    self.subdomain
                );
                Err(Error::Timeout(self.subdomain.clone()))
            }
        }
    }

    async fn handshake(&self, host: &str, port: u16, secret: &str) -> Result<()> {
        let connect_error = |reason: String| Error::Connect {
            host: host.to_string(),
            port,
            reason,
        };

        let mut stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| connect_error(e.to_string()))?;
        let _ = stream.set_nodelay(true);

        log::debug!("[Engine:{}] Connected to {host}:{port}", self.subdomain);

        stream
            .write_all(self.stream_header().as_bytes())
            .await
            .map_err(|e| connect_error(e.to_string()))?;

        let mut buffer = StanzaBuffer::new();
        let stream_id = loop {
            match self.handshake_event(&mut stream, &mut buffer).await? {
                StreamEvent::Open(header) => match header.id() {
                    Some(id) => break id.to_string(),
                    None => return Err(self.handshake_error("stream header carries no id")),
                },
                StreamEvent::Error(error) => return Err(self.stream_error(&error)),
                StreamEvent::Close => return Err(self.handshake_error("server closed the stream")),
                StreamEvent::Stanza(other) => {
                    log::debug!(
                        "[Engine:{}] Ignoring <{}/> before stream header",
                        self.subdomain,
                        other.name()
                    );
                }
            }
        };

        let digest = handshake_digest(&stream_id, secret);
        stream
            .write_all(format!("<handshake>{digest}</handshake>").as_bytes())
            .await
            .map_err(|e| connect_error(e.to_string()))?;

        loop {
            match self.handshake_event(&mut stream, &mut buffer).await? {
                StreamEvent::Stanza(p) if p.name() == "handshake" => break,
                StreamEvent::Error(error) => return Err(self.stream_error(&error)),
                StreamEvent::Close => return Err(self.handshake_error("server closed the stream")),
                StreamEvent::Open(_) => {}
                StreamEvent::Stanza(other) => {
                    log::debug!(
                        "[Engine:{}] Ignoring <{}/> before handshake reply",
                        self.subdomain,
                        other.name()
                    );
                }
            }
        }

        let (read_half, write_half) = stream.into_split();
        let (outbound, queued) = mpsc::unbounded_channel();
        let writer = self.runtime.spawn(write_loop(
            self.subdomain.clone(),
            write_half,
            queued,
            self.cancel.clone(),
        ));

        lock(&self.tasks).push(writer);
        *lock(&self.stream_id) = Some(stream_id);
        *lock(&self.outbound) = Some(outbound);
        *lock(&self.reader) = Some((read_half, buffer));
        self.bound.store(true, Ordering::SeqCst);

        log::info!(
            "[Engine:{}] Bound as {} on {host}:{port}",
            self.subdomain,
            self.domain
        );
        Ok(())
    }

    fn stream_header(&self) -> String {
        let mut header = format!(
            "<stream:stream xmlns='{NS_COMPONENT_ACCEPT}' xmlns:stream='{NS_STREAMS}' to='{}'",
            escape(self.domain.as_str())
        );
        if self.allow_multiple {
            header.push_str(" allowMultiple='true'");
        }
        header.push('>');
        header
    }

    fn handshake_error(&self, reason: impl Into<String>) -> Error {
        Error::Handshake {
            subdomain: self.subdomain.clone(),
            reason: reason.into(),
        }
    }

    fn stream_error(&self, error: &Packet) -> Error {
        let condition = error
            .first_child_name()
            .unwrap_or_else(|| "undefined-condition".to_string());
        self.handshake_error(format!("stream error: {condition}"))
    }

    /// Read until the buffer yields one event.
    async fn handshake_event(&self, stream: &mut TcpStream, buffer: &mut StanzaBuffer) -> Result<StreamEvent> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(event) = buffer
                .next_event()
                .map_err(|e| self.handshake_error(e.to_string()))?
            {
                return Ok(event);
            }
            match stream.read(&mut chunk).await {
                Ok(0) => return Err(self.handshake_error("server closed the connection")),
                Ok(n) => buffer.push(&chunk[..n])?,
                Err(e) => return Err(self.handshake_error(format!("read failed: {e}"))),
            }
        }
    }

    /// Spawn the read task and the dispatcher.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] when [`connect`](Self::connect) has not
    /// succeeded or the engine was closed since.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let (stream, buffer) = lock(&self.reader)
            .take()
            .ok_or_else(|| Error::NotConnected(self.subdomain.clone()))?;

        let (packet_tx, mut packet_rx) = mpsc::unbounded_channel::<Packet>();

        let component = Arc::clone(&self.component);
        self.runtime.spawn_blocking(move || {
            while let Some(packet) = packet_rx.blocking_recv() {
                component.process_packet(packet);
            }
        });

        let reader = self
            .runtime
            .spawn(Arc::clone(self).read_loop(stream, buffer, packet_tx));
        lock(&self.tasks).push(reader);
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, mut stream: OwnedReadHalf, mut buffer: StanzaBuffer, packets: UnboundedSender<Packet>) {
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut sweep = tokio::time::interval(IQ_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let lost = 'read: loop {
            loop {
                match buffer.next_event() {
                    Ok(Some(StreamEvent::Stanza(packet))) => self.route(packet, &packets),
                    Ok(Some(StreamEvent::Error(error))) => {
                        let condition = error.first_child_name().unwrap_or_default();
                        log::warn!("[Engine:{}] Stream error: {condition}", self.subdomain);
                        break 'read true;
                    }
                    Ok(Some(StreamEvent::Close)) => {
                        log::info!("[Engine:{}] Server closed the stream", self.subdomain);
                        break 'read true;
                    }
                    Ok(Some(StreamEvent::Open(_))) => {}
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("[Engine:{}] Dropping connection: {e}", self.subdomain);
                        break 'read true;
                    }
                }
            }

            tokio::select! {
                () = self.cancel.cancelled() => break 'read !self.closed.load(Ordering::SeqCst),
                _ = sweep.tick() => self.expire_queries(),
                read = stream.read(&mut chunk) => match read {
                    Ok(0) => break 'read true,
                    Ok(n) => {
                        if let Err(e) = buffer.push(&chunk[..n]) {
                            log::warn!("[Engine:{}] Dropping connection: {e}", self.subdomain);
                            break 'read true;
                        }
                    }
                    Err(e) => {
                        log::warn!("[Engine:{}] Read failed: {e}", self.subdomain);
                        break 'read true;
                    }
                },
            }
        };

        drop(packets);
        if lost && !self.closed.load(Ordering::SeqCst) {
            self.connection_lost();
        }
        log::debug!("[Engine:{}] Reader stopped", self.subdomain);
    }

    fn route(&self, packet: Packet, packets: &UnboundedSender<Packet>) {
        if packet.is_iq_response() {
            let listener = packet.id().and_then(|id| lock(&self.pending).take(id));
            if let Some(listener) = listener {
                listener.received_answer(packet);
                return;
            }
        }
        let _ = packets.send(packet);
    }

    fn expire_queries(&self) {
        let expired = lock(&self.pending).expire(Instant::now());
        for (id, listener) in expired {
            log::debug!("[Engine:{}] IQ '{id}' expired", self.subdomain);
            listener.answer_timeout(&id);
        }
    }

    fn flush_queries(&self) {
        let pending = lock(&self.pending).drain();
        for (id, listener) in pending {
            listener.answer_timeout(&id);
        }
    }

    fn connection_lost(&self) {
        self.bound.store(false, Ordering::SeqCst);
        lock(&self.outbound).take();
        self.cancel.cancel();
        self.flush_queries();
        log::warn!("[Engine:{}] Connection lost", self.subdomain);

        let handler = lock(&self.on_disconnect).take();
        if let Some(handler) = handler {
            handler();
        }
    }

    /// Queue one stanza for the write task.
    ///
    /// Stanzas without a `from` attribute are stamped with this engine's
    /// domain. Safe to call from any thread; stanzas go out whole and in
    /// the order they were queued.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] when unbound. A write that later fails drops
    /// the connection.
    pub fn send(&self, mut packet: Packet) -> Result<()> {
        if !self.is_bound() {
            return Err(Error::NotConnected(self.subdomain.clone()));
        }
        if packet.from().is_none() {
            packet.set_attribute("from", &self.domain);
        }
        let xml = packet.to_xml();

        let outbound = lock(&self.outbound);
        match outbound.as_ref().map(|tx| tx.send(xml)) {
            Some(Ok(())) => Ok(()),
            _ => Err(Error::NotConnected(self.subdomain.clone())),
        }
    }

    /// Register `listener` for the reply to `id`.
    pub fn add_iq_listener(&self, id: &str, listener: Arc<dyn IqResultListener>, ttl: Duration) {
        lock(&self.pending).register(id, listener, ttl);
    }

    /// Send an IQ and block the calling thread until its reply arrives or
    /// `timeout` elapses.
    ///
    /// Returns `Ok(None)` on timeout; the entry is gone either way and a
    /// late reply goes to the component like any other stanza.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPacket`] for non-IQ packets, or the send error.
    pub fn query(&self, packet: Packet, timeout: Duration) -> Result<Option<Packet>> {
        let (packet, id) = prepare_query(packet)?;
        let (tx, mut rx) = oneshot::channel();
        let waiter = Arc::new(Rendezvous {
            tx: Mutex::new(Some(tx)),
        });

        self.add_iq_listener(&id, waiter, timeout);
        if let Err(e) = self.send(packet) {
            lock(&self.pending).take(&id);
            return Err(e);
        }

        match block_on(&self.runtime, tokio::time::timeout(timeout, &mut rx)) {
            Ok(reply) => Ok(reply.ok().flatten()),
            Err(_elapsed) => {
                lock(&self.pending).take(&id);
                // A reply may have landed between the timeout and the take.
                Ok(rx.try_recv().ok().flatten())
            }
        }
    }

    /// Send an IQ and deliver its reply, or a timeout, to `listener`.
    ///
    /// The entry expires after a fixed long window so unanswered requests
    /// cannot grow the table without bound. If sending fails the listener
    /// is never called. Listeners run on the read task and must not block.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPacket`] for non-IQ packets, or the send error.
    pub fn query_async(&self, packet: Packet, listener: Arc<dyn IqResultListener>) -> Result<()> {
        let (packet, id) = prepare_query(packet)?;
        self.add_iq_listener(&id, listener, ASYNC_QUERY_EXPIRY);
        if let Err(e) = self.send(packet) {
            lock(&self.pending).take(&id);
            return Err(e);
        }
        Ok(())
    }

    /// Shut the component down and close the connection.
    ///
    /// Only the first call has an effect.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("[Engine:{}] Shutting down", self.subdomain);
        self.component.shutdown();
        self.close();
    }

    /// Close the stream without calling the component's shutdown hook.
    ///
    /// Queued stanzas are still written, followed by the stream close.
    /// Pending IQs are flushed as timeouts. Only the first call has an
    /// effect; it never waits for the I/O tasks, see
    /// [`wait_closed`](Self::wait_closed).
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.bound.store(false, Ordering::SeqCst);
        lock(&self.on_disconnect).take();
        lock(&self.outbound).take();
        lock(&self.reader).take();
        self.cancel.cancel();
        self.flush_queries();
        log::debug!("[Engine:{}] Closed", self.subdomain);
    }

    /// Wait for the read and write tasks to finish.
    pub async fn wait_closed(&self) {
        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

/// Drain `outbound` onto the socket until the engine is cancelled or the
/// queue closes, then end the stream.
async fn write_loop(
    subdomain: String,
    mut writer: OwnedWriteHalf,
    mut outbound: UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            xml = outbound.recv() => {
                let Some(xml) = xml else { break };
                if let Err(reason) = write_stanza(&mut writer, &xml).await {
                    log::warn!("[Engine:{subdomain}] Write failed: {reason}");
                    cancel.cancel();
                    return;
                }
                log::trace!("[Engine:{subdomain}] SENT {xml}");
            }
            () = cancel.cancelled() => break,
        }
    }

    let _ = write_stanza(&mut writer, STREAM_CLOSE).await;
    let _ = writer.shutdown().await;
    log::debug!("[Engine:{subdomain}] Writer stopped");
}

async fn write_stanza(writer: &mut OwnedWriteHalf, xml: &str) -> std::result::Result<(), String> {
    match tokio::time::timeout(WRITE_TIMEOUT, writer.write_all(xml.as_bytes())).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_elapsed) => Err(format!("timed out after {WRITE_TIMEOUT:?}")),
    }
}

/// Single-use handoff resolved by the read task.
struct Rendezvous {
    tx: Mutex<Option<oneshot::Sender<Option<Packet>>>>,
}

impl Rendezvous {
    fn resolve(&self, outcome: Option<Packet>) {
        if let Some(tx) = lock(&self.tx).take() {
            let _ = tx.send(outcome);
        }
    }
}

impl IqResultListener for Rendezvous {
    fn received_answer(&self, packet: Packet) {
        self.resolve(Some(packet));
    }

    fn answer_timeout(&self, _packet_id: &str) {
        self.resolve(None);
    }
}

/// Validate an outbound query and make sure it carries an id.
fn prepare_query(mut packet: Packet) -> Result<(Packet, String)> {
    if packet.kind() != PacketKind::Iq {
        return Err(Error::InvalidPacket(format!(
            "query expects an <iq/>, got <{}/>",
            packet.name()
        )));
    }
    let id = match packet.id() {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            let id = new_packet_id();
            packet.set_attribute("id", &id);
            id
        }
    };
    Ok((packet, id))
}
