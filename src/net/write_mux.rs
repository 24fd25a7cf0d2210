use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::broadcast;
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::Encoder;
use tracing::{debug, info, warn};

use super::{IoErrorKind, PeerEvent, ServiceState, WriteCommand};
use crate::message::MessageCodec;
use crate::peer::PeerAddr;
use crate::queue::RightEndpoint;

type ReadinessFuture<'a> = Pin<Box<dyn Future<Output = (PeerAddr, io::Result<()>)> + Send + 'a>>;

struct WriteConn {
    half: OwnedWriteHalf,
    codec: MessageCodec,
    /// Serialized bytes not yet accepted by the socket.
    pending: BytesMut,
}

enum Wake {
    Shutdown,
    Command(WriteCommand),
    Ready(PeerAddr, io::Result<()>),
}

/// Write-side counterpart of [`super::ReadMultiplexer`]: serializes queued
/// messages per peer and flushes them whenever the socket accepts bytes,
/// keeping partial-write accounting in the pending buffer.
///
/// Only sockets with pending bytes participate in the readiness wait.
pub struct WriteMultiplexer {
    endpoint: RightEndpoint<WriteCommand, PeerEvent>,
    shutdown: broadcast::Receiver<()>,
    conns: HashMap<PeerAddr, WriteConn>,
    state: ServiceState,
}

impl WriteMultiplexer {
    pub fn new(
        endpoint: RightEndpoint<WriteCommand, PeerEvent>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            endpoint,
            shutdown,
            conns: HashMap::new(),
            state: ServiceState::Active,
        }
    }

    pub async fn run(mut self) {
        info!("write multiplexer started");
        while self.state != ServiceState::Inactive {
            match self.wait_for_wake().await {
                Wake::Shutdown => {
                    self.state = ServiceState::Inactive;
                }
                Wake::Command(command) => self.handle_command(command),
                Wake::Ready(addr, Ok(())) => self.flush(addr).await,
                Wake::Ready(addr, Err(error)) => {
                    warn!(peer = %addr, %error, "readiness wait failed");
                    self.conns.remove(&addr);
                    self.endpoint
                        .push(PeerEvent::IoError(addr, IoErrorKind::Write))
                        .await;
                }
            }
            if self.state == ServiceState::Deactivating && self.is_drained() {
                self.conns.clear();
                self.state = ServiceState::Inactive;
            }
        }
        info!("write multiplexer stopped");
    }

    fn is_drained(&self) -> bool {
        self.conns.values().all(|conn| conn.pending.is_empty())
    }

    async fn wait_for_wake(&mut self) -> Wake {
        let mut readiness: Vec<ReadinessFuture<'_>> = self
            .conns
            .iter()
            .filter(|(_, conn)| !conn.pending.is_empty())
            .map(|(addr, conn)| {
                let addr = *addr;
                let half = &conn.half;
                Box::pin(async move { (addr, half.writable().await) }) as ReadinessFuture<'_>
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

    fn handle_command(&mut self, command: WriteCommand) {
        match command {
            WriteCommand::Subscribe(addr, half) => {
                if self.state != ServiceState::Active {
                    debug!(peer = %addr, "subscription refused while deactivating");
                    return;
                }
                debug!(peer = %addr, "write side subscribed");
                self.conns.insert(
                    addr,
                    WriteConn {
                        half,
                        codec: MessageCodec::new(),
                        pending: BytesMut::new(),
                    },
                );
            }
            // Idempotent; unknown peers are ignored.
            WriteCommand::Unsubscribe(addr) => {
                if self.conns.remove(&addr).is_some() {
                    debug!(peer = %addr, "write side unsubscribed");
                }
            }
            WriteCommand::Send(addr, message) => {
                if self.state != ServiceState::Active {
                    return;
                }
                let Some(conn) = self.conns.get_mut(&addr) else {
                    debug!(peer = %addr, "send to unsubscribed peer dropped");
                    return;
                };
                if let Err(error) = conn.codec.encode(message, &mut conn.pending) {
                    warn!(peer = %addr, %error, "unencodable message dropped");
                }
            }
            WriteCommand::Deactivate => {
                self.state = ServiceState::Deactivating;
            }
        }
    }

    /// Write as much of the pending buffer as the socket accepts.
    async fn flush(&mut self, addr: PeerAddr) {
        let Some(conn) = self.conns.get_mut(&addr) else {
            return;
        };

        let mut failed = false;
        while !conn.pending.is_empty() {
            match conn.half.try_write(&conn.pending) {
                Ok(written) => {
                    conn.pending.advance(written);
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) => {
                    warn!(peer = %addr, %error, "socket write failed");
                    failed = true;
                    break;
                }
            }
        }

        if failed {
            self.conns.remove(&addr);
            self.endpoint
                .push(PeerEvent::IoError(addr, IoErrorKind::Write))
                .await;
        }
    }
}
