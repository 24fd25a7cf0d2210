use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::file::{DiskFileManager, FileManager, WriteData};
use crate::message::PeerMessage;
use crate::net::{IoErrorKind, PeerEvent, PeerService};
use crate::peer::{AdmissionCommand, PeerAddr, PeerSession, PeerTracker, SessionStatus};
use crate::persist::{NoPersistence, Persistence, StateDir};
use crate::piece::PieceStateManager;
use crate::queue::{BoundedQueue, DuplexChannel, LeftEndpoint, PushPolicy};
use crate::torrent::{InfoHash, Torrent};
use crate::tracker::{
    generate_peer_id, tracker_worker, AnnounceEvent, AnnounceRequest, TrackerClient,
};

use super::config::ClientConfig;
use super::state::{format_bytes, DownloadStats};

const DISK_QUEUE_CAPACITY: usize = 64;
const TRACKER_QUEUE_CAPACITY: usize = 8;

/// Main session coordinator for downloading a torrent.
pub struct TorrentSession {
    torrent: Torrent,
    config: ClientConfig,
    peer_id: String,
}

/// How the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunOutcome {
    Completed,
    Interrupted,
    Fatal,
}

impl TorrentSession {
    /// Create a new session for downloading a torrent file.
    pub async fn new(
        torrent_path: impl AsRef<Path> + std::fmt::Debug,
        config: ClientConfig,
    ) -> Result<Self> {
        let torrent = Torrent::open(torrent_path)
            .await
            .context("Failed to open torrent file")?;

        Ok(Self {
            torrent,
            config,
            peer_id: generate_peer_id(),
        })
    }

    /// Run the download to completion (or interruption).
    pub async fn start(self) -> Result<()> {
        let total_size = self.torrent.length();
        let uniform_size = self.torrent.piece_length();
        let total_pieces = self.torrent.piece_count();
        let info_hash = self
            .torrent
            .info_hash
            .context("Torrent missing info hash")?;

        let persist: Arc<dyn Persistence> = match &self.config.state_dir {
            Some(dir) => Arc::new(StateDir::new(dir.clone())?),
            None => Arc::new(NoPersistence),
        };

        let mut pieces = PieceStateManager::new();
        pieces
            .populate(&self.torrent.info.pieces.0, total_size, uniform_size)
            .context("Torrent geometry is inconsistent")?;

        let known = persist.load_known_pieces(&info_hash)?;
        for index in &known {
            pieces.mark_known_complete(*index);
        }
        if !known.is_empty() {
            info!(resumed = known.len(), "resuming from persisted state");
        }
        if pieces.is_torrent_complete() {
            println!("{} is already complete", self.torrent.info.name);
            return Ok(());
        }

        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        // Disk worker: pops verified pieces and writes them out.
        let disk_queue = Arc::new(BoundedQueue::new(DISK_QUEUE_CAPACITY, PushPolicy::Block));
        let disk_manager = DiskFileManager::new(
            self.config.download_path.clone(),
            self.torrent.file_layout(),
            uniform_size,
        )
        .context("Failed to create disk manager")?;
        tokio::spawn(disk_worker(
            Arc::clone(&disk_queue),
            disk_manager,
            Arc::clone(&persist),
            info_hash,
            shutdown_tx.subscribe(),
        ));

        // Tracker worker: a previously recorded tracker wins over the
        // descriptor's announce URL.
        let announce_url = persist
            .load_trackers(&info_hash)?
            .into_iter()
            .next()
            .unwrap_or_else(|| self.torrent.announce.clone());
        let tracker_client = TrackerClient::new(
            announce_url.clone(),
            info_hash,
            self.peer_id.clone(),
            self.config.listen_port,
        );
        let (tracker_endpoint, tracker_worker_endpoint) = DuplexChannel::new(
            TRACKER_QUEUE_CAPACITY,
            PushPolicy::Block,
            TRACKER_QUEUE_CAPACITY,
            PushPolicy::Block,
        );
        tokio::spawn(tracker_worker(
            tracker_client,
            tracker_worker_endpoint,
            shutdown_tx.subscribe(),
        ));

        let service = PeerService::spawn(
            info_hash,
            peer_id_bytes(&self.peer_id),
            self.config.connection_timeout,
            &shutdown_tx,
        );

        println!("Torrent: {}", self.torrent.info.name);
        println!(
            "Size:    {} ({} pieces)",
            format_bytes(total_size),
            total_pieces
        );
        println!("Tracker: {}", announce_url);
        println!();

        let progress = ProgressBar::new(u64::from(total_pieces));
        progress.set_style(
            ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} pieces  {msg}")
                .context("bad progress template")?
                .progress_chars("##-"),
        );
        progress.set_position(pieces.completed_count() as u64);

        let stats = DownloadStats::new(total_pieces, pieces.completed_count() as u64);

        let orchestrator = Orchestrator {
            info_hash,
            total_size,
            events: service.events(),
            service,
            tracker: tracker_endpoint,
            disk: disk_queue,
            shutdown: shutdown_tx,
            pieces,
            admission: PeerTracker::with_caps(
                self.config.max_peers_per_torrent,
                self.config.max_peers_global,
            ),
            sessions: HashMap::new(),
            stats,
            progress,
            announce_in_flight: false,
            next_announce: None,
            earliest_announce: Instant::now(),
            announce_retry: self.config.announce_retry,
        };

        match orchestrator.run().await {
            RunOutcome::Completed => {
                println!("\nDownload complete: {}", self.torrent.info.name);
                Ok(())
            }
            RunOutcome::Interrupted => {
                eprintln!("\nInterrupted; partial state kept");
                Ok(())
            }
            RunOutcome::Fatal => bail!("a core I/O service failed; aborting"),
        }
    }
}

/// What the event loop should do after handling one event.
enum Flow {
    Continue,
    Complete,
    Fatal,
}

/// Owns all protocol state: the piece manager, the admission controller and
/// every peer session live on this task and are mutated nowhere else. All
/// other tasks talk to it through queues.
struct Orchestrator {
    info_hash: InfoHash,
    total_size: u64,
    service: PeerService,
    events: Arc<BoundedQueue<PeerEvent>>,
    tracker: LeftEndpoint<AnnounceRequest, AnnounceEvent>,
    disk: Arc<BoundedQueue<WriteData>>,
    shutdown: broadcast::Sender<()>,
    pieces: PieceStateManager,
    admission: PeerTracker,
    sessions: HashMap<PeerAddr, PeerSession>,
    stats: DownloadStats,
    progress: ProgressBar,
    announce_in_flight: bool,
    /// When the next announce fires, if one is scheduled.
    next_announce: Option<Instant>,
    /// Honors the tracker's min-interval between announces.
    earliest_announce: Instant,
    announce_retry: Duration,
}

impl Orchestrator {
    async fn run(mut self) -> RunOutcome {
        let mut shutdown_rx = self.shutdown.subscribe();

        let commands = self.admission.activate(self.info_hash);
        self.execute(commands).await;

        let outcome = loop {
            let timer_armed = self.next_announce.is_some();
            let deadline = self
                .next_announce
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    break RunOutcome::Interrupted;
                }

                _ = tokio::signal::ctrl_c() => {
                    eprintln!("\nShutting down...");
                    break RunOutcome::Interrupted;
                }

                _ = tokio::time::sleep_until(deadline), if timer_armed => {
                    self.next_announce = None;
                    self.request_announce().await;
                }

                event = self.events.pop() => {
                    match self.handle_event(event).await {
                        Flow::Continue => {}
                        Flow::Complete => break RunOutcome::Completed,
                        Flow::Fatal => break RunOutcome::Fatal,
                    }
                }

                announce = self.tracker.pop() => {
                    self.handle_announce(announce).await;
                }
            }
        };

        self.finish(outcome).await;
        outcome
    }

    async fn finish(&mut self, outcome: RunOutcome) {
        // Hand off what already verified, then stop the workers.
        while !self.disk.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.service.deactivate().await;
        let _ = self.shutdown.send(());

        // Whatever is still queued is informational only at this point.
        while self.events.can_pop() {
            let _ = self.events.try_pop();
        }

        match outcome {
            RunOutcome::Completed => {
                self.progress.finish_with_message(format!(
                    "{}  done!",
                    format_bytes(self.stats.downloaded_bytes())
                ));
            }
            _ => {
                self.progress.finish_and_clear();
                eprintln!(
                    "Downloaded {}/{} pieces ({})",
                    self.stats.pieces_completed(),
                    self.stats.total_pieces(),
                    format_bytes(self.stats.downloaded_bytes()),
                );
            }
        }
    }

    async fn handle_event(&mut self, event: PeerEvent) -> Flow {
        match event {
            PeerEvent::Connected(addr) => {
                info!(peer = %addr, "peer connected");
                self.sessions.insert(addr, PeerSession::new(addr));
                let commands = self.admission.on_connect_success(self.info_hash, addr);
                self.execute(commands).await;
                Flow::Continue
            }

            PeerEvent::Message(addr, PeerMessage::Handshake(handshake)) => {
                if handshake.info_hash != self.info_hash {
                    warn!(peer = %addr, theirs = %handshake.info_hash, "info hash mismatch, dropping peer");
                    self.drop_peer(addr).await;
                } else {
                    debug!(peer = %addr, "handshake verified");
                }
                Flow::Continue
            }

            PeerEvent::Message(addr, message) => {
                let Some(session) = self.sessions.get_mut(&addr) else {
                    debug!(peer = %addr, "message for unknown session dropped");
                    return Flow::Continue;
                };
                let output = session.handle_message(message, &mut self.pieces);

                for outgoing in output.outgoing {
                    self.service.send(addr, outgoing).await;
                }
                for write in output.writes {
                    self.stats.add_downloaded(write.data.len() as u64);
                    self.stats.increment_pieces();
                    self.update_progress();
                    self.disk.push(write).await;
                }

                match output.status {
                    SessionStatus::Open => Flow::Continue,
                    SessionStatus::Closed => {
                        self.drop_peer(addr).await;
                        Flow::Continue
                    }
                    SessionStatus::HashCheckFail => {
                        warn!(peer = %addr, "dropping peer after hash check failure");
                        self.drop_peer(addr).await;
                        Flow::Continue
                    }
                    SessionStatus::Error => {
                        error!(peer = %addr, "protocol-fatal condition, shutting down");
                        Flow::Fatal
                    }
                    SessionStatus::Complete => {
                        info!("torrent complete");
                        Flow::Complete
                    }
                }
            }

            PeerEvent::Disconnected(addr) => {
                debug!(peer = %addr, "peer disconnected");
                self.drop_peer(addr).await;
                Flow::Continue
            }

            PeerEvent::IoError(addr, IoErrorKind::ConnectFailed) => {
                debug!(peer = %addr, "connect attempt failed");
                let commands = self.admission.on_connect_failed(self.info_hash, addr);
                self.execute(commands).await;
                Flow::Continue
            }

            PeerEvent::IoError(addr, kind) if kind.is_peer_scoped() => {
                warn!(peer = %addr, ?kind, "peer I/O error");
                self.drop_peer(addr).await;
                Flow::Continue
            }

            PeerEvent::IoError(_, _) => {
                error!("I/O multiplexer failed, shutting down");
                Flow::Fatal
            }
        }
    }

    /// Remove a peer entirely: session, socket subscriptions, admission
    /// slot. Any piece it was mid-download on goes back to the pool.
    async fn drop_peer(&mut self, addr: PeerAddr) {
        if let Some(session) = self.sessions.remove(&addr) {
            if let Some(index) = session.assigned() {
                debug!(peer = %addr, piece = index, "re-sourcing piece from another peer");
                self.pieces.make_failed(index);
            }
        }
        self.service.disconnect(addr).await;
        let commands = self.admission.on_disconnect(self.info_hash, addr);
        self.execute(commands).await;
    }

    async fn execute(&mut self, commands: Vec<AdmissionCommand>) {
        for command in commands {
            match command {
                AdmissionCommand::TryConnect(_, addr) => {
                    debug!(peer = %addr, "dialing");
                    self.service.connect(addr);
                }
                AdmissionCommand::Disconnect(_, addr) => {
                    if let Some(session) = self.sessions.remove(&addr) {
                        if let Some(index) = session.assigned() {
                            self.pieces.make_failed(index);
                        }
                    }
                    self.service.disconnect(addr).await;
                }
                AdmissionCommand::DoAnnounce(_) => {
                    self.schedule_announce();
                }
            }
        }
    }

    /// Arm the announce timer, no earlier than the tracker's min interval.
    fn schedule_announce(&mut self) {
        if self.announce_in_flight || self.next_announce.is_some() {
            return;
        }
        self.next_announce = Some(self.earliest_announce.max(Instant::now()));
    }

    async fn request_announce(&mut self) {
        if self.announce_in_flight {
            return;
        }
        self.announce_in_flight = true;
        let left = self.pieces.bytes_remaining();
        self.tracker
            .push(AnnounceRequest {
                uploaded: self.stats.uploaded_bytes(),
                downloaded: self.total_size - left,
                left,
            })
            .await;
    }

    async fn handle_announce(&mut self, event: AnnounceEvent) {
        self.announce_in_flight = false;
        match event.result {
            Ok(response) => {
                let interval = response.interval.max(1);
                let min_interval = response.min_interval.unwrap_or(interval).max(1);
                self.earliest_announce = Instant::now() + Duration::from_secs(min_interval);
                // Regular cadence; admission may pull it forward later, but
                // never past the min interval.
                self.next_announce = Some(Instant::now() + Duration::from_secs(interval));

                let commands = self.admission.on_announce(self.info_hash, &response.peers.0);
                self.execute(commands).await;
            }
            Err(error) => {
                warn!(%error, "announce failed, retrying later");
                self.earliest_announce = Instant::now() + self.announce_retry;
                self.next_announce = Some(self.earliest_announce);
            }
        }
    }

    fn update_progress(&self) {
        self.progress.set_position(self.stats.pieces_completed());
        self.progress.set_message(format!(
            "{}  {}/s  {} peers",
            format_bytes(self.stats.downloaded_bytes()),
            format_bytes(self.stats.download_speed() as u64),
            self.sessions.len(),
        ));
    }
}

fn peer_id_bytes(peer_id: &str) -> [u8; 20] {
    let mut bytes = [0u8; 20];
    let src = peer_id.as_bytes();
    let len = src.len().min(20);
    bytes[..len].copy_from_slice(&src[..len]);
    bytes
}

/// Background task that writes verified pieces to disk and records them in
/// the resume store. Completion is fire-and-forget for the protocol side.
async fn disk_worker(
    queue: Arc<BoundedQueue<WriteData>>,
    mut files: impl FileManager,
    persist: Arc<dyn Persistence>,
    info_hash: InfoHash,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => break,

            write = queue.pop() => {
                if let Err(error) = files.write_piece(write.piece_index, &write.data) {
                    error!(piece = write.piece_index, %error, "failed to write piece");
                    continue;
                }
                if let Err(error) = persist.save_piece(&info_hash, write.piece_index) {
                    warn!(piece = write.piece_index, %error, "failed to record piece");
                }
                debug!(piece = write.piece_index, "piece persisted");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_bytes_copies_exactly_twenty() {
        let id = generate_peer_id();
        let bytes = peer_id_bytes(&id);
        assert_eq!(&bytes[..], id.as_bytes());
    }

    #[test]
    fn peer_id_bytes_tolerates_short_input() {
        let bytes = peer_id_bytes("short");
        assert_eq!(&bytes[..5], b"short");
        assert!(bytes[5..].iter().all(|b| *b == 0));
    }
}
