use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;

use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::broadcast;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

use super::{IoErrorKind, PeerEvent, ReadCommand, ServiceState};
use crate::message::{MessageCodec, PeerMessage};
use crate::peer::PeerAddr;
use crate::queue::RightEndpoint;

type ReadinessFuture<'a> = Pin<Box<dyn Future<Output = (PeerAddr, io::Result<()>)> + Send + 'a>>;

struct ReadConn {
    half: OwnedReadHalf,
    codec: MessageCodec,
    buffer: BytesMut,
}

enum Wake {
    Shutdown,
    Command(ReadCommand),
    Ready(PeerAddr, io::Result<()>),
}

/// Waits for read-readiness across every subscribed peer socket, drains
/// whatever bytes are available through the framer, and republishes the
/// framed messages as [`PeerEvent`]s.
///
/// The socket read halves live exclusively inside this service; the rest of
/// the system refers to peers by address only.
pub struct ReadMultiplexer {
    endpoint: RightEndpoint<ReadCommand, PeerEvent>,
    shutdown: broadcast::Receiver<()>,
    conns: HashMap<PeerAddr, ReadConn>,
    state: ServiceState,
}

impl ReadMultiplexer {
    pub fn new(
        endpoint: RightEndpoint<ReadCommand, PeerEvent>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            endpoint,
            shutdown,
            conns: HashMap::new(),
            state: ServiceState::Active,
        }
    }

    /// Blocking service loop; returns once the multiplexer is Inactive.
    pub async fn run(mut self) {
        info!("read multiplexer started");
        while self.state != ServiceState::Inactive {
            match self.wait_for_wake().await {
                Wake::Shutdown => {
                    self.state = ServiceState::Inactive;
                }
                Wake::Command(command) => self.handle_command(command),
                Wake::Ready(addr, Ok(())) => self.drain(addr).await,
                Wake::Ready(addr, Err(error)) => {
                    warn!(peer = %addr, %error, "readiness wait failed");
                    self.conns.remove(&addr);
                    self.endpoint
                        .push(PeerEvent::IoError(addr, IoErrorKind::Read))
                        .await;
                }
            }
            if self.state == ServiceState::Deactivating {
                // Read side has no buffered outbound work; flush what the
                // framers already hold and stop.
                self.drain_all_buffers().await;
                self.conns.clear();
                self.state = ServiceState::Inactive;
            }
        }
        info!("read multiplexer stopped");
    }

    /// Park until the shutdown signal, a command, or any subscribed socket
    /// becomes readable. Shutdown wins over everything else.
    async fn wait_for_wake(&mut self) -> Wake {
        let mut readiness: Vec<ReadinessFuture<'_>> = self
            .conns
            .iter()
            .map(|(addr, conn)| {
                let addr = *addr;
                let half = &conn.half;
                Box::pin(async move { (addr, half.readable().await) }) as ReadinessFuture<'_>
            })
            .collect();
        if readiness.is_empty() {
            readiness.push(Box::pin(futures::future::pending()));
        }

        tokio::select! {
            biased;
            _ = self.shutdown.recv() => Wake::Shutdown,
            command = self.endpoint.pop() => Wake::Command(command),
            ((addr, result), _, _) = futures::future::select_all(readiness) => {
                Wake::Ready(addr, result)
            }
        }
    }

    fn handle_command(&mut self, command: ReadCommand) {
        match command {
            ReadCommand::Subscribe(addr, half) => {
                if self.state != ServiceState::Active {
                    debug!(peer = %addr, "subscription refused while deactivating");
                    return;
                }
                debug!(peer = %addr, "read side subscribed");
                self.conns.insert(
                    addr,
                    ReadConn {
                        half,
                        // The peer's handshake is the first thing on the wire.
                        codec: MessageCodec::inbound(),
                        buffer: BytesMut::new(),
                    },
                );
            }
            // Unsubscribing an unknown peer is a no-op.
            ReadCommand::Unsubscribe(addr) => {
                if self.conns.remove(&addr).is_some() {
                    debug!(peer = %addr, "read side unsubscribed");
                }
            }
            ReadCommand::Deactivate => {
                self.state = ServiceState::Deactivating;
            }
        }
    }

    /// Pull every currently available byte off a readable socket and
    /// republish the complete frames found in it.
    async fn drain(&mut self, addr: PeerAddr) {
        let Some(conn) = self.conns.get_mut(&addr) else {
            return;
        };

        let mut closed = false;
        let mut failed = false;
        loop {
            match conn.half.try_read_buf(&mut conn.buffer) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(_) => continue,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) => {
                    warn!(peer = %addr, %error, "socket read failed");
                    failed = true;
                    break;
                }
            }
        }

        let messages = Self::decode_buffered(conn);
        if closed || failed {
            self.conns.remove(&addr);
        }

        for message in messages {
            self.endpoint.push(PeerEvent::Message(addr, message)).await;
        }
        if failed {
            self.endpoint
                .push(PeerEvent::IoError(addr, IoErrorKind::Read))
                .await;
        } else if closed {
            debug!(peer = %addr, "peer closed the connection");
            self.endpoint.push(PeerEvent::Disconnected(addr)).await;
        }
    }

    fn decode_buffered(conn: &mut ReadConn) -> Vec<PeerMessage> {
        let mut messages = Vec::new();
        loop {
            match conn.codec.decode(&mut conn.buffer) {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => break,
                // The codec reports malformed input as a message variant;
                // a decoder error here means the framer itself gave up.
                Err(error) => {
                    warn!(%error, "framer error, discarding buffered bytes");
                    conn.buffer.clear();
                    break;
                }
            }
        }
        messages
    }

    async fn drain_all_buffers(&mut self) {
        let addrs: Vec<PeerAddr> = self.conns.keys().copied().collect();
        for addr in addrs {
            if let Some(conn) = self.conns.get_mut(&addr) {
                let messages = Self::decode_buffered(conn);
                for message in messages {
                    self.endpoint.push(PeerEvent::Message(addr, message)).await;
                }
            }
        }
    }
}
