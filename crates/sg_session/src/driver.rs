//! Session driver: the loop that ties gate, state machine and queue together.
//!
//! One `tick` does, in order:
//! 1. pump the gate and handle inbound packets, then advance the state
//!    machine; if the gate did I/O the tick ends here;
//! 2. outside `Running`, purge the queue and report idle;
//! 3. claim the next queued packet (purge and report idle if none);
//! 4. write it; a refused write fails the item and hands it back to the
//!    application once.
//!
//! Outbound messages that carry a not yet confirmed content key are tracked
//! by receipt token. A receipt confirms the key; handing the message back to
//! the application retires it, so the next message starts a fresh key
//! instead of relying on one the receiver may never see.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sg_proto::{
    codec, CertifiedMessage, Content, Envelope, HandshakeCommand, HandshakeMessage, Id, KeyDirectory,
    KeyStamp, Packer, PlainMessage,
};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::delegate::{SessionDelegate, StoreReason};
use crate::error::SessionError;
use crate::gate::{Gate, GateStatus, TransportGate};
use crate::pool::WorkerPool;
use crate::queue::DeliveryQueue;
use crate::state::{next_state, Session, SessionState};

/// Everything the outbound path needs, shared between the driver and the
/// sealing workers.
#[derive(Clone)]
struct Outbox {
    packer: Packer,
    queue: Arc<DeliveryQueue>,
    delegate: Arc<dyn SessionDelegate>,
    /// Unconfirmed key carried by each queued message, by receipt token.
    stamps: Arc<Mutex<HashMap<String, KeyStamp>>>,
    /// Cleared by `close`; held while enqueueing so a late job cannot slip a
    /// message in behind the final drain.
    open: Arc<Mutex<bool>>,
}

pub struct SessionDriver {
    config: SessionConfig,
    outbox: Outbox,
    gate: Mutex<Box<dyn Gate>>,
    session: Mutex<Session>,
    pool: WorkerPool,
    runtime: Handle,
    running: AtomicBool,
    last_gate: Mutex<GateStatus>,
}

impl SessionDriver {
    pub fn new(
        config: SessionConfig,
        keys: Arc<dyn KeyDirectory>,
        delegate: Arc<dyn SessionDelegate>,
        gate: Box<dyn Gate>,
        runtime: Handle,
    ) -> Result<Arc<Self>, SessionError> {
        config.validate()?;
        let packer = Packer::new(keys, config.key_reuse.policy());
        let queue = Arc::new(DeliveryQueue::new(config.expiry()));
        let pool = WorkerPool::new(&runtime, config.sealing_workers);
        let last_gate = gate.status();

        Ok(Arc::new(Self {
            config,
            outbox: Outbox {
                packer,
                queue,
                delegate,
                stamps: Arc::new(Mutex::new(HashMap::new())),
                open: Arc::new(Mutex::new(true)),
            },
            gate: Mutex::new(gate),
            session: Mutex::new(Session::new()),
            pool,
            runtime,
            running: AtomicBool::new(false),
            last_gate: Mutex::new(last_gate),
        }))
    }

    /// Driver over a [`TransportGate`] to the configured relay.
    pub fn connect(
        config: SessionConfig,
        keys: Arc<dyn KeyDirectory>,
        delegate: Arc<dyn SessionDelegate>,
        runtime: Handle,
    ) -> Result<Arc<Self>, SessionError> {
        let gate = TransportGate::new(&config, runtime.clone());
        Self::new(config, keys, delegate, Box::new(gate), runtime)
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        self.session.lock().state()
    }

    pub fn identity(&self) -> Option<Id> {
        self.session.lock().identity().cloned()
    }

    pub fn session_key(&self) -> Option<String> {
        self.session.lock().session_key().map(str::to_owned)
    }

    pub fn gate_status(&self) -> GateStatus {
        self.gate.lock().status()
    }

    pub fn queue(&self) -> &Arc<DeliveryQueue> {
        &self.outbox.queue
    }

    pub fn packer(&self) -> &Packer {
        &self.outbox.packer
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ── Application calls ────────────────────────────────────────────────────

    /// Select the local identity; any established session is dropped and
    /// renegotiated.
    pub fn login(&self, identity: Id) {
        info!(identity = %identity, "login");
        self.session.lock().login(identity);
    }

    pub fn logout(&self) {
        info!("logout");
        self.session.lock().logout();
    }

    /// Wrap `content` in a message and send it. Without an explicit sender
    /// the current identity is used; with neither, nothing is sent.
    pub fn send_content(&self, sender: Option<Id>, receiver: Id, content: Content, priority: i32) -> bool {
        let sender = match sender.or_else(|| self.identity()) {
            Some(sender) => sender,
            None => {
                warn!(receiver = %receiver, "no identity selected, message not sent");
                return false;
            }
        };
        let plain = PlainMessage::new(Envelope::new(sender, receiver), content);
        self.send_message(plain, priority)
    }

    /// Seal, certify and enqueue `plain` on the worker pool. Returns as soon
    /// as the job is scheduled, or `false` once the driver is closed. A job
    /// that finishes after `close` hands its message back as unsent.
    pub fn send_message(&self, plain: PlainMessage, priority: i32) -> bool {
        if !self.outbox.is_open() {
            warn!(receiver = %plain.envelope.receiver, "driver closed, message not sent");
            return false;
        }
        let outbox = self.outbox.clone();
        self.pool.submit(move || outbox.seal_and_enqueue(plain, priority))
    }

    /// Queue an already certified message, typically one previously handed
    /// back through `store_message`. Returns `false` once the driver is
    /// closed or if the message cannot be encoded.
    pub fn send_certified(&self, message: CertifiedMessage, priority: i32) -> bool {
        self.outbox.enqueue(message, None, priority)
    }

    /// Open the gate and run the tick loop on the runtime until [`close`].
    ///
    /// [`close`]: SessionDriver::close
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, SessionError> {
        self.gate.lock().open()?;
        *self.outbox.open.lock() = true;
        self.running.store(true, Ordering::SeqCst);

        let driver = Arc::clone(self);
        let idle = self.config.idle_sleep();
        info!(relay = %self.config.relay_addr(), "session driver started");
        Ok(self.runtime.spawn(async move {
            while driver.is_running() {
                if driver.tick() {
                    tokio::task::yield_now().await;
                } else {
                    time::sleep(idle).await;
                }
            }
            debug!("session driver loop exited");
        }))
    }

    /// Stop the loop, release the gate and hand back everything that never
    /// left the queue. Sends still being sealed are handed back by their
    /// worker when they finish.
    pub fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        *self.outbox.open.lock() = false;
        self.gate.lock().close();
        let unsent = self.outbox.queue.drain_virgin();
        if !unsent.is_empty() {
            info!(count = unsent.len(), "storing unsent messages");
        }
        for message in &unsent {
            self.outbox.store(message, StoreReason::Unsent);
        }
        info!("session driver closed");
    }

    // ── Tick ─────────────────────────────────────────────────────────────────

    pub fn tick(&self) -> bool {
        let mut inbound = Vec::new();
        let (did_io, status) = {
            let mut gate = self.gate.lock();
            let did_io = gate.pump_once(&mut |packet: Bytes| inbound.push(packet));
            (did_io, gate.status())
        };

        self.observe_gate(status);
        for packet in &inbound {
            self.receive(packet);
        }
        self.evaluate(status);

        if did_io {
            return true;
        }

        let now = Utc::now();
        if self.state() != SessionState::Running {
            self.purge(now);
            return false;
        }

        let Some(item) = self.outbox.queue.next() else {
            self.purge(now);
            return false;
        };

        let written = self.gate.lock().write(&item.packet);
        if written {
            self.outbox.queue.mark_sent(item.id);
            debug!(id = item.id, priority = item.priority, "message handed to gate");
        } else {
            self.outbox.queue.mark_failed(item.id);
            warn!(id = item.id, "gate refused message");
            if let Some(message) = self.outbox.queue.take_for_store(item.id) {
                self.outbox.store(&message, StoreReason::WriteFailed);
            }
        }
        true
    }

    fn observe_gate(&self, status: GateStatus) {
        let previous = std::mem::replace(&mut *self.last_gate.lock(), status);
        if previous != status && status == GateStatus::Connected {
            info!(relay = %self.config.relay_addr(), "gate connected");
            self.outbox.delegate.on_connected();
        }
    }

    fn evaluate(&self, status: GateStatus) {
        let now = Utc::now();
        let transition = {
            let mut session = self.session.lock();
            let conditions = session.conditions(status, now, self.config.handshake_timeout());
            next_state(session.state(), &conditions).map(|next| {
                let previous = session.state();
                session.enter(next, now);
                (previous, next)
            })
        };

        if let Some((from, to)) = transition {
            info!(from = ?from, to = ?to, "session state changed");
            self.outbox.delegate.on_state_changed(from, to);
            self.on_enter(to);
        }
    }

    fn on_enter(&self, state: SessionState) {
        match state {
            SessionState::Handshaking => {
                let token = self.session.lock().session_key().map(str::to_owned);
                self.send_handshake(token);
            }
            SessionState::Error => {
                if let Err(err) = self.gate.lock().reconnect() {
                    warn!(error = %err, "gate reconnect failed");
                }
            }
            SessionState::Running => {
                info!(relay = %self.config.relay_id, "session established");
            }
            _ => {}
        }
    }

    fn purge(&self, now: DateTime<Utc>) {
        for purged in self.outbox.queue.purge(now) {
            if let Some(message) = purged.stranded {
                warn!(id = purged.item.id, receiver = %message.envelope().receiver, "message expired undelivered");
                self.outbox.store(&message, StoreReason::Expired);
            }
        }
    }

    // ── Handshake ────────────────────────────────────────────────────────────

    fn send_handshake(&self, token: Option<String>) {
        let Some(identity) = self.identity() else {
            warn!("handshake requested without identity");
            return;
        };
        let plain = PlainMessage::new(
            Envelope::new(identity, self.config.relay_id.clone()),
            Content::Handshake(HandshakeCommand::start(token)),
        );
        let packet = match self.outbox.packer.pack(&plain).and_then(|m| codec::encode(&m)) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(error = %err, retryable = err.is_retryable(), "failed to build handshake");
                return;
            }
        };
        if self.gate.lock().write(&packet) {
            debug!("handshake sent");
        } else {
            warn!("gate refused handshake");
        }
    }

    fn on_handshake(&self, sender: &Id, command: &HandshakeCommand) {
        if sender != &self.config.relay_id {
            warn!(sender = %sender, "handshake from non-relay sender ignored");
            return;
        }
        match command.message {
            HandshakeMessage::Again => {
                let Some(token) = command.session_key.clone() else {
                    warn!("handshake challenge without session token ignored");
                    return;
                };
                if self.session.lock().challenge(token.clone()) {
                    info!("relay issued a new session token, handshaking again");
                    self.send_handshake(Some(token));
                } else {
                    warn!("handshake challenge with no matching session ignored");
                }
            }
            HandshakeMessage::Accepted => {
                if self.session.lock().accept(command.session_key.clone()) {
                    info!("handshake accepted");
                } else {
                    warn!("handshake acceptance with no matching session ignored");
                }
            }
            HandshakeMessage::Start => {
                warn!("unexpected handshake start from relay ignored");
            }
        }
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    fn receive(&self, packet: &Bytes) {
        let certified = match codec::decode(packet) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, len = packet.len(), "dropping undecodable packet");
                return;
            }
        };

        let Some(identity) = self.identity() else {
            debug!("no identity selected, dropping inbound message");
            return;
        };
        if certified.envelope().receiver != identity {
            warn!(receiver = %certified.envelope().receiver, "dropping message for another identity");
            return;
        }

        let plain = match self.outbox.packer.unpack(&certified) {
            Ok(plain) => plain,
            Err(err) => {
                warn!(
                    error = %err,
                    sender = %certified.envelope().sender,
                    retryable = err.is_retryable(),
                    "dropping inbound message"
                );
                return;
            }
        };

        match &plain.content {
            Content::Handshake(command) => self.on_handshake(&plain.envelope.sender, command),
            Content::Receipt { signature, .. } => {
                if self.outbox.queue.acknowledge(signature) {
                    debug!(sender = %plain.envelope.sender, "delivery acknowledged");
                    self.outbox.settle(signature, true);
                    self.outbox.delegate.on_delivered(signature);
                } else {
                    debug!("receipt for unknown message");
                }
            }
            _ => {
                if !self.outbox.delegate.save_message(&plain, None) {
                    warn!(sender = %plain.envelope.sender, "failed to save inbound message");
                }
                self.outbox.delegate.dispatch_decrypted(plain);
            }
        }
    }
}

impl Outbox {
    fn is_open(&self) -> bool {
        *self.open.lock()
    }

    fn seal_and_enqueue(&self, plain: PlainMessage, priority: i32) {
        let (certified, stamp) = match self.packer.pack_stamped(&plain) {
            Ok(packed) => packed,
            Err(err) => {
                warn!(
                    error = %err,
                    receiver = %plain.envelope.receiver,
                    retryable = err.is_retryable(),
                    "failed to seal outgoing message"
                );
                return;
            }
        };
        let receipt = certified.receipt_token();
        // Saved first so an acknowledgement can always be correlated.
        if !self.delegate.save_message(&plain, Some(&receipt)) {
            warn!(receiver = %plain.envelope.receiver, "failed to save outgoing message");
        }
        if !self.enqueue(certified.clone(), stamp.clone(), priority) {
            if let Some(stamp) = stamp {
                self.packer.retire(&stamp);
            }
            self.delegate.store_message(&certified, StoreReason::Unsent);
        }
    }

    /// Returns `false` without queueing once closed.
    fn enqueue(&self, message: CertifiedMessage, stamp: Option<KeyStamp>, priority: i32) -> bool {
        let open = self.open.lock();
        if !*open {
            debug!(receiver = %message.envelope().receiver, "driver closed, message not queued");
            return false;
        }
        let receipt = message.receipt_token();
        // Tracked before the item becomes claimable so a fast receipt finds it.
        if let Some(stamp) = stamp {
            self.stamps.lock().insert(receipt.clone(), stamp);
        }
        match self.queue.enqueue(message, priority) {
            Ok(item) => {
                debug!(id = item.id, priority, "message queued");
                true
            }
            Err(err) => {
                warn!(error = %err, "failed to queue outgoing message");
                self.stamps.lock().remove(&receipt);
                false
            }
        }
    }

    /// Resolve the key carried by the message with this receipt token:
    /// confirmed on delivery, retired otherwise.
    fn settle(&self, receipt: &str, delivered: bool) {
        let Some(stamp) = self.stamps.lock().remove(receipt) else {
            return;
        };
        if delivered {
            self.packer.confirm(&stamp);
        } else if self.packer.retire(&stamp) {
            debug!(receiver = %stamp.direction, "content key retired with undelivered message");
        }
    }

    fn store(&self, message: &CertifiedMessage, reason: StoreReason) {
        self.settle(&message.receipt_token(), false);
        self.delegate.store_message(message, reason);
    }
}
