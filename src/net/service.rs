use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, info};

use super::{PeerEvent, ReadCommand, ReadMultiplexer, WriteCommand, WriteMultiplexer};
use crate::message::{Handshake, PeerMessage};
use crate::peer::PeerAddr;
use crate::queue::{BoundedQueue, DuplexChannel, LeftEndpoint, PushPolicy};
use crate::torrent::InfoHash;

const EVENT_QUEUE_CAPACITY: usize = 256;
const READ_COMMAND_CAPACITY: usize = 64;
const WRITE_COMMAND_CAPACITY: usize = 256;

/// Façade over the peer transport: dials peers, performs the outbound half
/// of the handshake, and hands the socket halves to the two multiplexers.
///
/// Everything the I/O layer observes is republished on one event queue, in
/// per-peer FIFO order; `send` is the single entry point for outgoing
/// messages.
pub struct PeerService {
    events: Arc<BoundedQueue<PeerEvent>>,
    read_commands: LeftEndpoint<ReadCommand, PeerEvent>,
    write_commands: LeftEndpoint<WriteCommand, PeerEvent>,
    info_hash: InfoHash,
    peer_id: [u8; 20],
    connect_timeout: Duration,
}

impl PeerService {
    /// Build the service and spawn both multiplexer tasks.
    pub fn spawn(
        info_hash: InfoHash,
        peer_id: [u8; 20],
        connect_timeout: Duration,
        shutdown: &broadcast::Sender<()>,
    ) -> Self {
        let events = Arc::new(BoundedQueue::new(EVENT_QUEUE_CAPACITY, PushPolicy::Block));

        // Both multiplexers feed the same event queue, so the consumer sees
        // one ordered stream per peer.
        let (read_commands, read_endpoint) = DuplexChannel::from_queues(
            Arc::new(BoundedQueue::new(READ_COMMAND_CAPACITY, PushPolicy::Block)),
            Arc::clone(&events),
        );
        let (write_commands, write_endpoint) = DuplexChannel::from_queues(
            Arc::new(BoundedQueue::new(WRITE_COMMAND_CAPACITY, PushPolicy::Block)),
            Arc::clone(&events),
        );

        tokio::spawn(ReadMultiplexer::new(read_endpoint, shutdown.subscribe()).run());
        tokio::spawn(WriteMultiplexer::new(write_endpoint, shutdown.subscribe()).run());

        info!("peer service started");
        Self {
            events,
            read_commands,
            write_commands,
            info_hash,
            peer_id,
            connect_timeout,
        }
    }

    /// The single event endpoint consumed by the orchestrator.
    pub fn events(&self) -> Arc<BoundedQueue<PeerEvent>> {
        Arc::clone(&self.events)
    }

    /// Dial a peer in the background. The outcome arrives on the event
    /// queue as `Connected` or `IoError(_, ConnectFailed)`.
    pub fn connect(&self, addr: PeerAddr) {
        let events = Arc::clone(&self.events);
        let read_commands = self.read_commands.clone();
        let write_commands = self.write_commands.clone();
        let info_hash = self.info_hash;
        let peer_id = self.peer_id;
        let connect_timeout = self.connect_timeout;

        tokio::spawn(async move {
            match establish(addr, info_hash, peer_id, connect_timeout).await {
                Ok((read_half, write_half)) => {
                    // The write half subscribes before Connected goes out, so
                    // a send issued in response to Connected is always behind
                    // the subscription in the command queue. The read half
                    // subscribes after, so no inbound message can precede
                    // Connected on the event queue.
                    write_commands
                        .push(WriteCommand::Subscribe(addr, write_half))
                        .await;
                    events.push(PeerEvent::Connected(addr)).await;
                    read_commands
                        .push(ReadCommand::Subscribe(addr, read_half))
                        .await;
                }
                Err(error) => {
                    debug!(peer = %addr, %error, "connect failed");
                    events
                        .push(PeerEvent::IoError(addr, super::IoErrorKind::ConnectFailed))
                        .await;
                }
            }
        });
    }

    /// Queue one message for a connected peer.
    pub async fn send(&self, addr: PeerAddr, message: PeerMessage) {
        self.write_commands
            .push(WriteCommand::Send(addr, message))
            .await;
    }

    /// Drop a peer from both multiplexers. Safe to call twice.
    pub async fn disconnect(&self, addr: PeerAddr) {
        self.read_commands
            .push(ReadCommand::Unsubscribe(addr))
            .await;
        self.write_commands
            .push(WriteCommand::Unsubscribe(addr))
            .await;
    }

    /// Ask both multiplexers to drain and stop accepting subscriptions.
    pub async fn deactivate(&self) {
        self.read_commands.push(ReadCommand::Deactivate).await;
        self.write_commands.push(WriteCommand::Deactivate).await;
    }
}

/// Dial, send our handshake, and split the stream. The peer's handshake is
/// not awaited here; it arrives through the read multiplexer as the first
/// framed message.
async fn establish(
    addr: PeerAddr,
    info_hash: InfoHash,
    peer_id: [u8; 20],
    connect_timeout: Duration,
) -> anyhow::Result<(OwnedReadHalf, OwnedWriteHalf)> {
    let mut stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .context("Connection attempt timed out")?
        .context("Failed to connect")?;

    let handshake = Handshake::new(info_hash, peer_id);
    stream
        .write_all(&handshake.to_bytes())
        .await
        .context("Failed to send handshake")?;

    debug!(peer = %addr, "connected, handshake sent");
    Ok(stream.into_split())
}
