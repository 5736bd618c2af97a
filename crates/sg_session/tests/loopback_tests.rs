//! End-to-end sessions against a minimal relay on the loopback interface,
//! once over TCP and once over UDP.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use common::{init_tracing, test_config, Recorder};
use sg_crypto::{IdentityKeyPair, KeyReusePolicy};
use sg_proto::{
    codec, Content, Envelope, HandshakeCommand, HandshakeMessage, Keyring, Packer, PlainMessage,
};
use sg_session::{GateStatus, SessionConfig, SessionDriver, SessionState, TransportKind};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::runtime::Handle;

fn keys() -> (Arc<Keyring>, Packer) {
    let alice = IdentityKeyPair::generate();
    let relay = IdentityKeyPair::generate();

    let client = Keyring::new();
    client.add_contact("relay".into(), relay.public_key());
    let server = Keyring::new();
    server.add_contact("alice".into(), alice.public_key());
    server.add_identity("relay".into(), relay);
    client.add_identity("alice".into(), alice);

    (
        Arc::new(client),
        Packer::new(Arc::new(server), KeyReusePolicy::UntilInvalidated),
    )
}

/// Accept every handshake, acknowledge everything else.
fn answer(relay: &Packer, packet: &[u8]) -> Option<Bytes> {
    let certified = codec::decode(packet).ok()?;
    let plain = relay.unpack(&certified).ok()?;
    let content = match &plain.content {
        Content::Handshake(cmd) if cmd.message == HandshakeMessage::Start => {
            Content::Handshake(HandshakeCommand::accepted(Some("loopback".into())))
        }
        _ => Content::receipt(certified.receipt_token()),
    };
    let reply = PlainMessage::new(Envelope::new("relay".into(), plain.envelope.sender), content);
    codec::encode(&relay.pack(&reply).ok()?).ok()
}

async fn serve_stream(listener: TcpListener, relay: Packer) {
    let Ok((mut socket, _)) = listener.accept().await else {
        return;
    };
    let mut buf = BytesMut::new();
    loop {
        while let Ok(Some(frame)) = codec::decode_frame(&mut buf, 1 << 20) {
            if let Some(reply) = answer(&relay, &frame) {
                if socket.write_all(&codec::encode_frame(&reply)).await.is_err() {
                    return;
                }
            }
        }
        match socket.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

async fn serve_datagram(socket: UdpSocket, relay: Packer) {
    let mut buf = vec![0u8; 65_536];
    while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
        if let Some(reply) = answer(&relay, &buf[..n]) {
            let _ = socket.send_to(&reply, peer).await;
        }
    }
}

async fn wait_until(what: &str, mut ready: impl FnMut() -> bool) {
    for _ in 0..500 {
        if ready() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn run_session(config: SessionConfig, keys: Arc<Keyring>) {
    init_tracing();
    let recorder = Arc::new(Recorder::default());
    let driver = SessionDriver::connect(config, keys, recorder.clone(), Handle::current()).unwrap();
    driver.login("alice".into());
    let task = driver.start().unwrap();

    wait_until("session running", || driver.state() == SessionState::Running).await;
    assert_eq!(driver.session_key().as_deref(), Some("loopback"));
    assert_eq!(*recorder.connected.lock(), 1);

    assert!(driver.send_content(None, "relay".into(), Content::text("ping"), 0));
    wait_until("delivery receipt", || recorder.delivered.lock().len() == 1).await;

    let receipt = recorder.saved.lock()[0].1.clone().unwrap();
    assert_eq!(recorder.delivered.lock()[0], receipt);

    driver.close();
    task.await.unwrap();
    assert_eq!(driver.gate_status(), GateStatus::Init);
    assert!(recorder.stored.lock().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_transport_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (client, relay) = keys();
    let server = tokio::spawn(serve_stream(listener, relay));

    let config = SessionConfig {
        relay_port: port,
        transport: TransportKind::Stream,
        ..test_config()
    };
    run_session(config, client).await;
    server.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn datagram_transport_round_trip() {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    let (client, relay) = keys();
    let server = tokio::spawn(serve_datagram(socket, relay));

    let config = SessionConfig {
        relay_port: port,
        transport: TransportKind::Datagram,
        ..test_config()
    };
    run_session(config, client).await;
    server.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_relay_cycles_through_error() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    init_tracing();
    let (client, _relay) = keys();
    let config = SessionConfig {
        relay_port: port,
        reconnect_interval_ms: 20,
        ..test_config()
    };

    let recorder = Arc::new(Recorder::default());
    let driver = SessionDriver::connect(config, client, recorder.clone(), Handle::current()).unwrap();
    driver.login("alice".into());
    let task = driver.start().unwrap();

    wait_until("a full reconnect cycle", || {
        let transitions = recorder.transitions.lock();
        transitions.contains(&(SessionState::Connecting, SessionState::Error))
            && transitions.contains(&(SessionState::Error, SessionState::Default))
    })
    .await;
    assert_eq!(*recorder.connected.lock(), 0);

    driver.close();
    task.await.unwrap();
}
