use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use sg_proto::codec;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use super::{Gate, GateStatus};
use crate::config::{SessionConfig, TransportKind};
use crate::error::GateError;

/// Largest UDP payload over IPv4.
const MAX_DATAGRAM: usize = 65_507;
/// Inbound packets handed out per `pump_once`.
const PUMP_BATCH: usize = 16;

/// Tokio-backed gate over TCP (length-framed) or UDP (one packet per
/// datagram). The socket lives on a spawned task; the gate talks to it
/// through channels so none of its methods block.
///
/// Each link reports into its own status cell. A task from a closed link
/// that is still unwinding can only touch its own cell, never the status of
/// the link that replaced it.
pub struct TransportGate {
    remote: String,
    kind: TransportKind,
    connect_timeout: Duration,
    reconnect_interval: Duration,
    max_frame_len: usize,
    runtime: Handle,
    link: Option<Link>,
    next_attempt: Option<Instant>,
}

struct Link {
    status: Arc<Mutex<GateStatus>>,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    outbound: mpsc::UnboundedSender<Bytes>,
    task: JoinHandle<()>,
}

impl TransportGate {
    pub fn new(config: &SessionConfig, runtime: Handle) -> Self {
        Self {
            remote: config.relay_addr(),
            kind: config.transport,
            connect_timeout: config.connect_timeout(),
            reconnect_interval: config.reconnect_interval(),
            max_frame_len: config.max_frame_len,
            runtime,
            link: None,
            next_attempt: None,
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }
}

impl Gate for TransportGate {
    fn open(&mut self) -> Result<(), GateError> {
        if self.link.is_some() {
            return Ok(());
        }
        if self.remote.starts_with(':') || self.remote.ends_with(':') {
            return Err(GateError::InvalidRemote(self.remote.clone()));
        }

        let now = Instant::now();
        let delay = self
            .next_attempt
            .map(|at| at.saturating_duration_since(now))
            .unwrap_or_default();
        self.next_attempt = Some(now + delay + self.reconnect_interval);

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let status = Arc::new(Mutex::new(GateStatus::Connecting));

        let link = LinkTask {
            remote: self.remote.clone(),
            kind: self.kind,
            delay,
            connect_timeout: self.connect_timeout,
            max_frame_len: self.max_frame_len,
            status: Arc::clone(&status),
            inbound: inbound_tx,
            outbound: outbound_rx,
        };
        debug!(remote = %self.remote, delay_ms = delay.as_millis() as u64, "opening relay link");
        let task = self.runtime.spawn(link.run());

        self.link = Some(Link {
            status,
            inbound: inbound_rx,
            outbound: outbound_tx,
            task,
        });
        Ok(())
    }

    fn close(&mut self) {
        if let Some(link) = self.link.take() {
            link.task.abort();
            info!(remote = %self.remote, "relay link closed");
        }
    }

    fn status(&self) -> GateStatus {
        self.link
            .as_ref()
            .map_or(GateStatus::Init, |link| *link.status.lock())
    }

    fn pump_once(&mut self, dispatch: &mut dyn FnMut(Bytes)) -> bool {
        let Some(link) = self.link.as_mut() else {
            return false;
        };
        let mut handled = 0;
        while handled < PUMP_BATCH {
            match link.inbound.try_recv() {
                Ok(packet) => {
                    dispatch(packet);
                    handled += 1;
                }
                Err(_) => break,
            }
        }
        handled > 0
    }

    fn write(&mut self, payload: &[u8]) -> bool {
        if self.status() != GateStatus::Connected {
            return false;
        }
        if self.kind == TransportKind::Datagram && payload.len() > MAX_DATAGRAM {
            warn!(len = payload.len(), "packet too large for a datagram");
            return false;
        }
        if self.kind == TransportKind::Stream && payload.len() > self.max_frame_len {
            warn!(len = payload.len(), max = self.max_frame_len, "packet exceeds frame limit");
            return false;
        }
        match &self.link {
            Some(link) => link.outbound.send(Bytes::copy_from_slice(payload)).is_ok(),
            None => false,
        }
    }
}

impl Drop for TransportGate {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            link.task.abort();
        }
    }
}

fn set_status(status: &Mutex<GateStatus>, next: GateStatus) {
    let mut current = status.lock();
    if *current != next {
        debug!(from = ?*current, to = ?next, "gate status changed");
        *current = next;
    }
}

// ── Link task ────────────────────────────────────────────────────────────────

struct LinkTask {
    remote: String,
    kind: TransportKind,
    delay: Duration,
    connect_timeout: Duration,
    max_frame_len: usize,
    status: Arc<Mutex<GateStatus>>,
    inbound: mpsc::UnboundedSender<Bytes>,
    outbound: mpsc::UnboundedReceiver<Bytes>,
}

impl LinkTask {
    async fn run(mut self) {
        if !self.delay.is_zero() {
            time::sleep(self.delay).await;
        }
        let result = match self.kind {
            TransportKind::Stream => self.run_stream().await,
            TransportKind::Datagram => self.run_datagram().await,
        };
        match result {
            Ok(()) => info!(remote = %self.remote, "relay link finished"),
            Err(err) => warn!(remote = %self.remote, error = %err, "relay link failed"),
        }
        set_status(&self.status, GateStatus::Error);
    }

    async fn run_stream(&mut self) -> Result<(), GateError> {
        let stream = time::timeout(self.connect_timeout, TcpStream::connect(&self.remote))
            .await
            .map_err(|_| GateError::ConnectTimeout(self.connect_timeout))??;
        stream.set_nodelay(true)?;
        info!(remote = %self.remote, transport = "stream", "relay connected");
        set_status(&self.status, GateStatus::Connected);

        let (reader, writer) = stream.into_split();
        tokio::select! {
            res = read_frames(reader, self.max_frame_len, &self.inbound) => res,
            res = write_frames(writer, &mut self.outbound) => res,
        }
    }

    async fn run_datagram(&mut self) -> Result<(), GateError> {
        let addr = time::timeout(self.connect_timeout, lookup_host(&self.remote))
            .await
            .map_err(|_| GateError::ConnectTimeout(self.connect_timeout))??
            .next()
            .ok_or_else(|| GateError::Resolve(self.remote.clone()))?;
        let local = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;
        info!(remote = %self.remote, transport = "datagram", "relay connected");
        set_status(&self.status, GateStatus::Connected);

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                received = socket.recv(&mut buf) => {
                    let n = received?;
                    if self.inbound.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        return Ok(());
                    }
                }
                payload = self.outbound.recv() => match payload {
                    Some(payload) => {
                        socket.send(&payload).await?;
                    }
                    None => return Ok(()),
                },
            }
        }
    }
}

async fn read_frames(
    mut reader: OwnedReadHalf,
    max_frame_len: usize,
    inbound: &mpsc::UnboundedSender<Bytes>,
) -> Result<(), GateError> {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        while let Some(frame) = codec::decode_frame(&mut buf, max_frame_len)? {
            if inbound.send(frame).is_err() {
                return Ok(());
            }
        }
        if reader.read_buf(&mut buf).await? == 0 {
            return Err(GateError::Disconnected);
        }
    }
}

async fn write_frames(
    mut writer: OwnedWriteHalf,
    outbound: &mut mpsc::UnboundedReceiver<Bytes>,
) -> Result<(), GateError> {
    while let Some(payload) = outbound.recv().await {
        writer.write_all(&codec::encode_frame(&payload)).await?;
    }
    writer.shutdown().await?;
    Ok(())
}
