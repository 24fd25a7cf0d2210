use std::collections::BTreeSet;

use tracing::{debug, warn};

use super::PeerAddr;
use crate::file::WriteData;
use crate::message::{PeerMessage, PieceIndex};
use crate::piece::{PieceStateManager, BLOCK_SIZE};

/// Outcome of processing one message, reported back to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Keep the connection; nothing terminal happened.
    Open,
    /// Orderly end of this peer; disconnect it and carry on.
    Closed,
    /// Protocol-level fatal condition; the caller should shut down.
    Error,
    /// The peer delivered data that failed verification. Drop this peer and
    /// re-source its piece from someone else.
    HashCheckFail,
    /// This peer supplied the torrent's final missing piece.
    Complete,
}

/// Everything one `handle_message` call wants the orchestrator to do.
#[derive(Debug)]
pub struct SessionOutput {
    /// Messages to send to this peer, in order.
    pub outgoing: Vec<PeerMessage>,
    /// Verified pieces ready for the disk queue.
    pub writes: Vec<WriteData>,
    pub status: SessionStatus,
}

impl SessionOutput {
    fn open() -> Self {
        Self {
            outgoing: Vec::new(),
            writes: Vec::new(),
            status: SessionStatus::Open,
        }
    }
}

/// Protocol state machine for a single connected peer.
///
/// Behavior is a pure function of the session tuple (the four choke/interest
/// flags plus the advertised set) and the incoming message; the machine owns
/// no I/O. It is created after the handshake and dropped on disconnect.
#[derive(Debug)]
pub struct PeerSession {
    addr: PeerAddr,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    /// Piece indices this peer has advertised via Have/Bitfield.
    advertised: BTreeSet<PieceIndex>,
    /// The piece currently being fetched from this peer.
    assigned: Option<PieceIndex>,
}

impl PeerSession {
    pub fn new(addr: PeerAddr) -> Self {
        // Cold start per the protocol: both sides choked, neither interested.
        Self {
            addr,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            advertised: BTreeSet::new(),
            assigned: None,
        }
    }

    pub fn addr(&self) -> PeerAddr {
        self.addr
    }

    /// The piece this peer is mid-download on, if any. The orchestrator
    /// re-sources it when the peer goes away.
    pub fn assigned(&self) -> Option<PieceIndex> {
        self.assigned
    }

    pub fn advertised(&self) -> &BTreeSet<PieceIndex> {
        &self.advertised
    }

    pub fn is_peer_choking(&self) -> bool {
        self.peer_choking
    }

    pub fn is_am_interested(&self) -> bool {
        self.am_interested
    }

    /// Feed one decoded message through the state machine.
    pub fn handle_message(
        &mut self,
        message: PeerMessage,
        pieces: &mut PieceStateManager,
    ) -> SessionOutput {
        let mut out = SessionOutput::open();

        match message {
            PeerMessage::Choke => {
                debug!(peer = %self.addr, "peer choked us");
                self.peer_choking = true;
            }
            PeerMessage::Unchoke => {
                debug!(peer = %self.addr, "peer unchoked us");
                self.peer_choking = false;
                self.request_next(pieces, &mut out);
            }
            PeerMessage::Interested => {
                self.peer_interested = true;
            }
            PeerMessage::NotInterested => {
                self.peer_interested = false;
            }
            PeerMessage::Have(index) => {
                self.advertised.insert(index);
                self.express_interest(&mut out);
            }
            PeerMessage::Bitfield(bitfield) => {
                for index in bitfield.iter() {
                    self.advertised.insert(index);
                }
                self.express_interest(&mut out);
            }
            PeerMessage::Piece {
                index,
                begin,
                block,
            } => {
                return self.handle_block(index, begin, &block, pieces);
            }
            PeerMessage::KeepAlive => {}
            PeerMessage::Request { index, .. } => {
                // Seeding is not implemented; acknowledge by ignoring.
                debug!(peer = %self.addr, index, "ignoring upload request");
            }
            PeerMessage::Cancel { .. } | PeerMessage::Port(_) => {}
            PeerMessage::Handshake(_) => {
                debug!(peer = %self.addr, "ignoring repeated handshake");
            }
            PeerMessage::SerializeError { reason, .. } => {
                warn!(peer = %self.addr, reason, "undecodable message, dropping peer");
                out.status = SessionStatus::Closed;
            }
        }

        out
    }

    /// First advertisement from a peer we are not yet interested in: tell
    /// it so, once.
    fn express_interest(&mut self, out: &mut SessionOutput) {
        if !self.am_interested {
            self.am_interested = true;
            out.outgoing.push(PeerMessage::Interested);
        }
    }

    fn handle_block(
        &mut self,
        index: PieceIndex,
        begin: u32,
        block: &[u8],
        pieces: &mut PieceStateManager,
    ) -> SessionOutput {
        let mut out = SessionOutput::open();

        if pieces.is_piece_complete(index) {
            debug!(peer = %self.addr, index, "block for a finished piece, discarding");
            return out;
        }
        let Some(piece) = pieces.get(index) else {
            debug!(peer = %self.addr, index, "block for unknown piece, discarding");
            return out;
        };

        // Stale or duplicate block (retransmission, or a piece we already
        // finished): discard silently and stay open.
        if piece.is_complete() || u64::from(begin) != piece.next_offset() {
            debug!(peer = %self.addr, index, begin, "stale block offset, discarding");
            return out;
        }

        if let Err(error) = pieces.add_block(index, u64::from(begin), block) {
            debug!(peer = %self.addr, index, %error, "rejected block, discarding");
            return out;
        }

        let Some(piece) = pieces.get(index) else {
            return out;
        };
        if !piece.is_complete() {
            // More of the same piece.
            if !self.peer_choking {
                self.request_next(pieces, &mut out);
            }
            return out;
        }

        let data = piece.assembled().to_vec();
        if !pieces.hash_check(index, &data) {
            warn!(peer = %self.addr, index, "piece failed hash verification");
            // The orchestrator reads `assigned` to re-source the piece.
            out.status = SessionStatus::HashCheckFail;
            return out;
        }

        debug!(peer = %self.addr, index, "piece verified");
        out.writes.push(WriteData {
            piece_index: index,
            data,
        });
        pieces.make_completed(index);
        self.assigned = None;

        if pieces.is_torrent_complete() {
            out.status = SessionStatus::Complete;
            return out;
        }

        if !self.peer_choking {
            self.request_next(pieces, &mut out);
        }
        out
    }

    /// Emit the next block request: continue the assigned piece, or pick a
    /// fresh one from what this peer advertises. Idle when nothing fits.
    fn request_next(&mut self, pieces: &mut PieceStateManager, out: &mut SessionOutput) {
        if self.assigned.is_none() {
            self.assigned = pieces.next_available(&self.advertised);
        }
        let Some(index) = self.assigned else {
            return;
        };
        let Some(piece) = pieces.get(index) else {
            self.assigned = None;
            return;
        };
        if piece.is_complete() {
            self.assigned = None;
            return;
        }

        let length = BLOCK_SIZE.min(piece.remaining()) as u32;
        out.outgoing.push(PeerMessage::Request {
            index,
            begin: piece.next_offset() as u32,
            length,
        });
    }
}
