//! Shared fixtures: an in-memory gate, a scripted relay and a recording
//! delegate.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use sg_crypto::{IdentityKeyPair, KeyReusePolicy};
use sg_proto::{
    codec, CertifiedMessage, Content, Envelope, HandshakeCommand, HandshakeMessage, Id, Keyring, Packer,
    PlainMessage,
};
use sg_session::{
    Gate, GateError, GateStatus, SessionConfig, SessionDelegate, SessionDriver, SessionState, StoreReason,
};
use tokio::runtime::Handle;

// ── MockGate ─────────────────────────────────────────────────────────────────

pub struct Wire {
    pub status: GateStatus,
    pub inbound: VecDeque<Bytes>,
    pub written: Vec<Bytes>,
    pub fail_writes: bool,
    pub opens: usize,
    pub reconnects: usize,
    pub closes: usize,
}

impl Default for Wire {
    fn default() -> Self {
        Self {
            status: GateStatus::Init,
            inbound: VecDeque::new(),
            written: Vec::new(),
            fail_writes: false,
            opens: 0,
            reconnects: 0,
            closes: 0,
        }
    }
}

pub type SharedWire = Arc<Mutex<Wire>>;

/// Gate whose status and traffic are driven by the test through [`Wire`].
pub struct MockGate {
    wire: SharedWire,
}

impl MockGate {
    pub fn new(wire: SharedWire) -> Self {
        Self { wire }
    }
}

impl Gate for MockGate {
    fn open(&mut self) -> Result<(), GateError> {
        let mut wire = self.wire.lock();
        wire.opens += 1;
        if wire.status == GateStatus::Init {
            wire.status = GateStatus::Connecting;
        }
        Ok(())
    }

    fn close(&mut self) {
        let mut wire = self.wire.lock();
        wire.closes += 1;
        wire.status = GateStatus::Init;
    }

    fn status(&self) -> GateStatus {
        self.wire.lock().status
    }

    fn pump_once(&mut self, dispatch: &mut dyn FnMut(Bytes)) -> bool {
        let packet = self.wire.lock().inbound.pop_front();
        match packet {
            Some(packet) => {
                dispatch(packet);
                true
            }
            None => false,
        }
    }

    fn write(&mut self, payload: &[u8]) -> bool {
        let mut wire = self.wire.lock();
        if wire.fail_writes || wire.status != GateStatus::Connected {
            return false;
        }
        wire.written.push(Bytes::copy_from_slice(payload));
        true
    }

    fn reconnect(&mut self) -> Result<(), GateError> {
        self.wire.lock().reconnects += 1;
        Ok(())
    }
}

// ── Recorder ─────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct Recorder {
    pub connected: Mutex<usize>,
    pub transitions: Mutex<Vec<(SessionState, SessionState)>>,
    pub dispatched: Mutex<Vec<PlainMessage>>,
    pub stored: Mutex<Vec<(CertifiedMessage, StoreReason)>>,
    pub saved: Mutex<Vec<(PlainMessage, Option<String>)>>,
    pub delivered: Mutex<Vec<String>>,
}

impl SessionDelegate for Recorder {
    fn on_connected(&self) {
        *self.connected.lock() += 1;
    }

    fn on_state_changed(&self, from: SessionState, to: SessionState) {
        self.transitions.lock().push((from, to));
    }

    fn dispatch_decrypted(&self, message: PlainMessage) {
        self.dispatched.lock().push(message);
    }

    fn store_message(&self, message: &CertifiedMessage, reason: StoreReason) {
        self.stored.lock().push((message.clone(), reason));
    }

    fn save_message(&self, message: &PlainMessage, receipt: Option<&str>) -> bool {
        self.saved
            .lock()
            .push((message.clone(), receipt.map(str::to_owned)));
        true
    }

    fn on_delivered(&self, receipt: &str) {
        self.delivered.lock().push(receipt.to_owned());
    }
}

// ── MockRelay ────────────────────────────────────────────────────────────────

/// Relay that answers the first `challenges` handshakes with "again" and a
/// fresh token, then accepts. Text messages are acknowledged with a receipt.
pub struct MockRelay {
    pub id: Id,
    pub packer: Packer,
    challenges_left: usize,
    issued: usize,
    /// Session token carried by every handshake start received, in order.
    pub handshakes: Vec<Option<String>>,
    pub received: Vec<PlainMessage>,
    pub auto_receipt: bool,
}

impl MockRelay {
    pub fn new(packer: Packer, challenges: usize) -> Self {
        Self {
            id: Id::from("relay"),
            packer,
            challenges_left: challenges,
            issued: 0,
            handshakes: Vec::new(),
            received: Vec::new(),
            auto_receipt: true,
        }
    }

    /// Consume everything the client wrote and queue the replies.
    pub fn respond(&mut self, wire: &SharedWire) {
        let written: Vec<Bytes> = std::mem::take(&mut wire.lock().written);
        for packet in written {
            let certified = codec::decode(&packet).expect("client wrote a valid document");
            let plain = self.packer.unpack(&certified).expect("relay can open client packets");
            let client = plain.envelope.sender.clone();

            let reply = match &plain.content {
                Content::Handshake(cmd) if cmd.message == HandshakeMessage::Start => {
                    self.handshakes.push(cmd.session_key.clone());
                    if self.challenges_left > 0 {
                        self.challenges_left -= 1;
                        self.issued += 1;
                        Content::Handshake(HandshakeCommand::again(format!("token-{}", self.issued)))
                    } else {
                        Content::Handshake(HandshakeCommand::accepted(cmd.session_key.clone()))
                    }
                }
                _ => {
                    self.received.push(plain.clone());
                    if !self.auto_receipt {
                        continue;
                    }
                    Content::receipt(certified.receipt_token())
                }
            };
            self.inject(wire, &client, reply);
        }
    }

    pub fn inject(&self, wire: &SharedWire, to: &Id, content: Content) {
        let plain = PlainMessage::new(Envelope::new(self.id.clone(), to.clone()), content);
        let certified = self.packer.pack(&plain).expect("relay can seal replies");
        let packet = codec::encode(&certified).expect("encodable");
        wire.lock().inbound.push_back(packet);
    }
}

// ── Fixture ──────────────────────────────────────────────────────────────────

pub struct Fixture {
    pub driver: Arc<SessionDriver>,
    pub wire: SharedWire,
    pub relay: MockRelay,
    pub recorder: Arc<Recorder>,
}

/// Route driver logs through the test harness; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> SessionConfig {
    SessionConfig {
        idle_sleep_ms: 5,
        sealing_workers: 1,
        ..SessionConfig::default()
    }
}

/// Client "alice" with contact "bob" (whose mailbox the relay can read) and
/// relay "relay" answering `challenges` times with "again" before accepting.
/// Must run inside a tokio runtime.
pub fn fixture(challenges: usize) -> Fixture {
    fixture_with(test_config(), challenges)
}

pub fn fixture_with(config: SessionConfig, challenges: usize) -> Fixture {
    init_tracing();
    let alice = IdentityKeyPair::generate();
    let relay = IdentityKeyPair::generate();
    let bob = IdentityKeyPair::generate();

    let client_ring = Keyring::new();
    client_ring.add_contact("relay".into(), relay.public_key());
    client_ring.add_contact("bob".into(), bob.public_key());
    let relay_ring = Keyring::new();
    relay_ring.add_contact("alice".into(), alice.public_key());
    relay_ring.add_identity("relay".into(), relay);
    // The relay also hosts bob's mailbox so tests can read what alice sent.
    relay_ring.add_identity("bob".into(), bob);
    client_ring.add_identity("alice".into(), alice);

    let wire: SharedWire = Arc::new(Mutex::new(Wire::default()));
    let recorder = Arc::new(Recorder::default());
    let driver = SessionDriver::new(
        config,
        Arc::new(client_ring),
        recorder.clone(),
        Box::new(MockGate::new(wire.clone())),
        Handle::current(),
    )
    .expect("valid config");

    Fixture {
        driver,
        wire,
        relay: MockRelay::new(
            Packer::new(Arc::new(relay_ring), KeyReusePolicy::UntilInvalidated),
            challenges,
        ),
        recorder,
    }
}

impl Fixture {
    /// One driver tick followed by the relay answering whatever was written.
    pub fn step(&mut self) -> bool {
        let did = self.driver.tick();
        self.relay.respond(&self.wire);
        did
    }

    /// Log in as alice with the gate up and tick until the session runs.
    pub fn establish(&mut self) {
        self.wire.lock().status = GateStatus::Connected;
        self.driver.login("alice".into());
        for _ in 0..50 {
            if self.driver.state() == SessionState::Running {
                return;
            }
            self.step();
        }
        panic!("session never reached Running: {:?}", self.driver.state());
    }

    pub async fn wait_queued(&self, count: usize) {
        for _ in 0..400 {
            if self.driver.queue().len() >= count {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("queue never reached {count} items");
    }
}
