//! Session delegate that prints to the terminal and forwards delivery events
//! to the running command.

use sg_proto::{CertifiedMessage, Content, PlainMessage};
use sg_session::{SessionDelegate, SessionState, StoreReason};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Delivered(String),
    Stored(StoreReason),
}

pub struct ConsoleDelegate {
    events: mpsc::UnboundedSender<Event>,
}

impl ConsoleDelegate {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events }, rx)
    }
}

impl SessionDelegate for ConsoleDelegate {
    fn on_connected(&self) {
        info!("connected to relay");
    }

    fn on_state_changed(&self, from: SessionState, to: SessionState) {
        info!(from = ?from, to = ?to, "session state");
    }

    fn dispatch_decrypted(&self, message: PlainMessage) {
        let sender = &message.envelope.sender;
        let time = message.envelope.time.to_rfc3339();
        match &message.content {
            Content::Text { text } => println!("[{time}] {sender}: {text}"),
            Content::Application { app, body } => println!("[{time}] {sender} ({app}): {body}"),
            other => println!("[{time}] {sender}: {other:?}"),
        }
    }

    fn store_message(&self, message: &CertifiedMessage, reason: StoreReason) {
        warn!(
            receiver = %message.envelope().receiver,
            reason = ?reason,
            "message not delivered"
        );
        let _ = self.events.send(Event::Stored(reason));
    }

    fn on_delivered(&self, receipt: &str) {
        info!(receipt, "delivered");
        let _ = self.events.send(Event::Delivered(receipt.to_owned()));
    }
}
