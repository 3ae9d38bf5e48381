// Shared fixtures for integration tests: an in-process XMPP server that
// speaks the accept side of the component protocol, plus recording
// components and IQ listeners.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use whack::hash::handshake_digest;
use whack::xmpp::{StanzaBuffer, StreamEvent};
use whack::{Component, ComponentManager, IqResultListener, IqType, Jid, Packet};

/// How long tests wait for anything that should happen promptly.
pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct State {
    /// Stanzas received from bound components, with the domain they came from.
    received: Vec<(String, Packet)>,
    /// Live sessions by bound domain.
    sessions: HashMap<String, (u64, TcpStream)>,
    /// Stream headers sent by clients, in arrival order.
    headers: Vec<Packet>,
    bindings: usize,
    rejected: usize,
    next_session: u64,
}

struct Shared {
    secret: String,
    state: Mutex<State>,
    changed: Condvar,
    auto_reply: AtomicBool,
    accepting: AtomicBool,
    silent: AtomicBool,
}

/// A minimal XMPP server accepting component connections on 127.0.0.1.
pub struct FakeServer {
    port: u16,
    shared: Arc<Shared>,
}

impl FakeServer {
    /// Listen on an ephemeral port; components must authenticate with `secret`.
    pub fn start(secret: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let shared = Arc::new(Shared {
            secret: secret.to_string(),
            state: Mutex::new(State::default()),
            changed: Condvar::new(),
            auto_reply: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
            silent: AtomicBool::new(false),
        });

        let accept_shared = Arc::clone(&shared);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let shared = Arc::clone(&accept_shared);
                thread::spawn(move || serve(&shared, stream));
            }
        });

        Self { port, shared }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Answer every `get`/`set` IQ with an empty `result`.
    pub fn set_auto_reply(&self, enabled: bool) {
        self.shared.auto_reply.store(enabled, Ordering::SeqCst);
    }

    /// When false, new connections are dropped right after their header.
    pub fn set_accepting(&self, accepting: bool) {
        self.shared.accepting.store(accepting, Ordering::SeqCst);
    }

    /// When true, new connections are held open but never answered.
    pub fn set_silent(&self, silent: bool) {
        self.shared.silent.store(silent, Ordering::SeqCst);
    }

    /// Successful handshakes so far.
    pub fn bindings(&self) -> usize {
        self.shared.state.lock().unwrap().bindings
    }

    /// Handshakes rejected for a bad digest.
    pub fn rejected(&self) -> usize {
        self.shared.state.lock().unwrap().rejected
    }

    pub fn headers(&self) -> Vec<Packet> {
        self.shared.state.lock().unwrap().headers.clone()
    }

    pub fn is_connected(&self, domain: &str) -> bool {
        self.shared.state.lock().unwrap().sessions.contains_key(domain)
    }

    /// Wait until at least `count` handshakes have succeeded.
    pub fn wait_for_bindings(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.bindings >= count)
    }

    /// Wait until `domain` has no live session.
    pub fn wait_for_disconnect(&self, domain: &str, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| !state.sessions.contains_key(domain))
    }

    /// Wait for a stanza from `domain` that satisfies `matches`.
    pub fn wait_for_stanza<F>(&self, domain: &str, timeout: Duration, matches: F) -> Option<Packet>
    where
        F: Fn(&Packet) -> bool,
    {
        let mut found = None;
        self.wait_until(timeout, |state| {
            found = state
                .received
                .iter()
                .find(|(from, packet)| from == domain && matches(packet))
                .map(|(_, packet)| packet.clone());
            found.is_some()
        });
        found
    }

    /// Stanzas received from `domain` so far.
    pub fn received(&self, domain: &str) -> Vec<Packet> {
        self.shared
            .state
            .lock()
            .unwrap()
            .received
            .iter()
            .filter(|(from, _)| from == domain)
            .map(|(_, packet)| packet.clone())
            .collect()
    }

    /// Write raw XML to the session bound as `domain`.
    pub fn send_raw(&self, domain: &str, xml: &str) {
        let mut state = self.shared.state.lock().unwrap();
        let (_, stream) = state
            .sessions
            .get_mut(domain)
            .unwrap_or_else(|| panic!("no session for {domain}"));
        stream.write_all(xml.as_bytes()).unwrap();
        stream.flush().unwrap();
    }

    /// Route `packet` to the component bound as `domain`.
    pub fn send(&self, domain: &str, packet: &Packet) {
        self.send_raw(domain, &packet.to_xml());
    }

    /// Cut the TCP connection of `domain` without closing the stream.
    pub fn kill_session(&self, domain: &str) {
        let state = self.shared.state.lock().unwrap();
        if let Some((_, stream)) = state.sessions.get(domain) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn wait_until<F>(&self, timeout: Duration, mut done: F) -> bool
    where
        F: FnMut(&State) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if done(&state) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self.shared.changed.wait_timeout(state, deadline - now).unwrap().0;
        }
    }
}

/// Read until one stream event is available; `None` on EOF or error.
fn next_event(stream: &mut TcpStream, buffer: &mut StanzaBuffer) -> Option<StreamEvent> {
    let mut chunk = [0u8; 4096];
    loop {
        match buffer.next_event() {
            Ok(Some(event)) => return Some(event),
            Ok(None) => {}
            Err(_) => return None,
        }
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return None,
            Ok(n) => buffer.push(&chunk[..n]).ok()?,
        }
    }
}

fn serve(shared: &Shared, mut stream: TcpStream) {
    let mut buffer = StanzaBuffer::new();

    let Some(StreamEvent::Open(header)) = next_event(&mut stream, &mut buffer) else {
        return;
    };
    let domain = header.to().unwrap_or_default().to_string();
    let session = {
        let mut state = shared.state.lock().unwrap();
        state.headers.push(header);
        state.next_session += 1;
        state.next_session
    };
    shared.changed.notify_all();

    if shared.silent.load(Ordering::SeqCst) {
        let mut sink = [0u8; 1024];
        while matches!(stream.read(&mut sink), Ok(n) if n > 0) {}
        return;
    }
    if !shared.accepting.load(Ordering::SeqCst) {
        let _ = stream.shutdown(Shutdown::Both);
        return;
    }

    let stream_id = format!("fake{session}");
    let reply = format!(
        "<?xml version='1.0'?><stream:stream xmlns:stream='http://etherx.jabber.org/streams' \
         xmlns='jabber:component:accept' from='{domain}' id='{stream_id}'>"
    );
    if stream.write_all(reply.as_bytes()).is_err() {
        return;
    }

    let Some(StreamEvent::Stanza(handshake)) = next_event(&mut stream, &mut buffer) else {
        return;
    };
    let expected = handshake_digest(&stream_id, &shared.secret);
    if handshake.name() != "handshake" || handshake.text().as_deref() != Some(expected.as_str()) {
        let _ = stream.write_all(
            b"<stream:error><not-authorized xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>\
              </stream:error></stream:stream>",
        );
        shared.state.lock().unwrap().rejected += 1;
        shared.changed.notify_all();
        let _ = stream.shutdown(Shutdown::Both);
        return;
    }

    if stream.write_all(b"<handshake/>").is_err() {
        return;
    }
    {
        let mut state = shared.state.lock().unwrap();
        state.sessions.insert(domain.clone(), (session, stream.try_clone().unwrap()));
        state.bindings += 1;
    }
    shared.changed.notify_all();

    while let Some(event) = next_event(&mut stream, &mut buffer) {
        let StreamEvent::Stanza(packet) = event else {
            break;
        };
        if shared.auto_reply.load(Ordering::SeqCst)
            && matches!(packet.iq_type(), Some(IqType::Get | IqType::Set))
        {
            let _ = stream.write_all(packet.result_reply().to_xml().as_bytes());
        }
        shared.state.lock().unwrap().received.push((domain.clone(), packet));
        shared.changed.notify_all();
    }

    {
        let mut state = shared.state.lock().unwrap();
        if state.sessions.get(&domain).is_some_and(|(id, _)| *id == session) {
            state.sessions.remove(&domain);
        }
    }
    shared.changed.notify_all();
}

/// Manager pointed at `server` with its secret as the default.
pub fn manager_for(server: &FakeServer, secret: &str) -> Arc<ComponentManager> {
    let manager = ComponentManager::with_port("127.0.0.1", server.port()).unwrap();
    manager.set_default_secret_key(secret);
    manager.set_server_name("example.com");
    manager.set_connect_timeout(Duration::from_secs(2));
    manager
}

/// Component that records every lifecycle call and packet.
pub struct Recorder {
    name: String,
    fail_initialize: bool,
    jid: Mutex<Option<Jid>>,
    packets: Mutex<Vec<Packet>>,
    arrived: Condvar,
    initialized: AtomicUsize,
    shut_down: AtomicUsize,
}

impl Recorder {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name, false))
    }

    /// A recorder whose `initialize` fails.
    pub fn failing(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name, true))
    }

    fn build(name: &str, fail_initialize: bool) -> Self {
        Self {
            name: name.to_string(),
            fail_initialize,
            jid: Mutex::new(None),
            packets: Mutex::new(Vec::new()),
            arrived: Condvar::new(),
            initialized: AtomicUsize::new(0),
            shut_down: AtomicUsize::new(0),
        }
    }

    pub fn jid(&self) -> Option<Jid> {
        self.jid.lock().unwrap().clone()
    }

    pub fn initialized(&self) -> usize {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn shut_down(&self) -> usize {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` packets arrived and return them all.
    pub fn wait_for_packets(&self, count: usize, timeout: Duration) -> Vec<Packet> {
        let packets = self.packets.lock().unwrap();
        let (packets, _) = self
            .arrived
            .wait_timeout_while(packets, timeout, |p| p.len() < count)
            .unwrap();
        packets.clone()
    }
}

impl Component for Recorder {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn description(&self) -> String {
        format!("{} (test recorder)", self.name)
    }

    fn initialize(&self, jid: &Jid, _manager: &Arc<ComponentManager>) -> whack::Result<()> {
        self.initialized.fetch_add(1, Ordering::SeqCst);
        if self.fail_initialize {
            return Err(whack::Error::Component("refusing to start".into()));
        }
        *self.jid.lock().unwrap() = Some(jid.clone());
        Ok(())
    }

    fn process_packet(&self, packet: Packet) {
        self.packets.lock().unwrap().push(packet);
        self.arrived.notify_all();
    }

    fn shutdown(&self) {
        self.shut_down.fetch_add(1, Ordering::SeqCst);
    }
}

/// Outcome delivered to a [`OutcomeListener`].
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Answer(Packet),
    Timeout(String),
}

/// IQ listener forwarding its outcome to a channel.
pub struct OutcomeListener {
    tx: Mutex<mpsc::Sender<Outcome>>,
}

impl OutcomeListener {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<Outcome>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(Self { tx: Mutex::new(tx) }), rx)
    }
}

impl IqResultListener for OutcomeListener {
    fn received_answer(&self, packet: Packet) {
        let _ = self.tx.lock().unwrap().send(Outcome::Answer(packet));
    }

    fn answer_timeout(&self, packet_id: &str) {
        let _ = self.tx.lock().unwrap().send(Outcome::Timeout(packet_id.to_string()));
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn eventually<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}
