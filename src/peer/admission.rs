use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::PeerAddr;
use crate::torrent::InfoHash;

pub const DEFAULT_PER_TORRENT_CAP: usize = 20;
pub const DEFAULT_GLOBAL_CAP: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    NotConnected,
    Connecting,
    Connected,
}

/// What the orchestrator should do next, recomputed on every trigger event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionCommand {
    TryConnect(InfoHash, PeerAddr),
    Disconnect(InfoHash, PeerAddr),
    /// The known-peer pool for this torrent is exhausted; ask the tracker
    /// for a fresh batch.
    DoAnnounce(InfoHash),
}

#[derive(Debug, Clone)]
struct PeerRecord {
    status: ConnectionStatus,
    /// A connection to this peer succeeded at least once.
    has_connected_before: bool,
    /// A connection to this peer was attempted at least once.
    attempted: bool,
}

impl PeerRecord {
    fn known() -> Self {
        Self {
            status: ConnectionStatus::NotConnected,
            has_connected_before: false,
            attempted: false,
        }
    }

    /// A candidate for dialing: currently unconnected, and not a peer whose
    /// only attempts ever made all failed. Peers that once connected may be
    /// retried; peers that never managed to are left alone for good.
    fn is_dialable(&self) -> bool {
        self.status == ConnectionStatus::NotConnected
            && (!self.attempted || self.has_connected_before)
    }
}

/// Global per-torrent view of known and connected peers; decides which peers
/// to dial, which to drop, and when to ask the tracker for more.
///
/// Peer records are kept for the lifetime of the process, even across
/// torrent deactivation, so connect-success history is never lost.
#[derive(Debug)]
pub struct PeerTracker {
    per_torrent_cap: usize,
    global_cap: usize,
    peers: BTreeMap<InfoHash, BTreeMap<PeerAddr, PeerRecord>>,
    active: BTreeSet<InfoHash>,
}

impl Default for PeerTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerTracker {
    pub fn new() -> Self {
        Self::with_caps(DEFAULT_PER_TORRENT_CAP, DEFAULT_GLOBAL_CAP)
    }

    pub fn with_caps(per_torrent_cap: usize, global_cap: usize) -> Self {
        Self {
            per_torrent_cap,
            global_cap,
            peers: BTreeMap::new(),
            active: BTreeSet::new(),
        }
    }

    /// Peers of `torrent` that are connected or being dialed.
    pub fn connected_count(&self, torrent: &InfoHash) -> usize {
        self.peers
            .get(torrent)
            .map(|records| {
                records
                    .values()
                    .filter(|record| record.status != ConnectionStatus::NotConnected)
                    .count()
            })
            .unwrap_or(0)
    }

    fn global_count(&self) -> usize {
        self.peers
            .keys()
            .map(|torrent| self.connected_count(torrent))
            .sum()
    }

    pub fn is_active(&self, torrent: &InfoHash) -> bool {
        self.active.contains(torrent)
    }

    /// Start managing a torrent. With an empty peer pool this immediately
    /// asks for an announce.
    pub fn activate(&mut self, torrent: InfoHash) -> Vec<AdmissionCommand> {
        self.active.insert(torrent);
        self.peers.entry(torrent).or_default();
        self.recompute(torrent)
    }

    /// Stop managing a torrent: disconnect all its active peers. Records
    /// stay behind so their connect history survives a reactivation.
    pub fn deactivate(&mut self, torrent: InfoHash) -> Vec<AdmissionCommand> {
        self.active.remove(&torrent);
        let mut commands = Vec::new();
        if let Some(records) = self.peers.get_mut(&torrent) {
            for (addr, record) in records.iter_mut() {
                if record.status != ConnectionStatus::NotConnected {
                    record.status = ConnectionStatus::NotConnected;
                    commands.push(AdmissionCommand::Disconnect(torrent, *addr));
                }
            }
        }
        commands
    }

    /// Tracker announce produced a batch of candidate peers.
    pub fn on_announce(
        &mut self,
        torrent: InfoHash,
        announced: &[PeerAddr],
    ) -> Vec<AdmissionCommand> {
        let records = self.peers.entry(torrent).or_default();
        for addr in announced {
            records.entry(*addr).or_insert_with(PeerRecord::known);
        }
        debug!(%torrent, batch = announced.len(), known = records.len(), "announce merged");
        self.recompute(torrent)
    }

    pub fn on_connect_success(
        &mut self,
        torrent: InfoHash,
        addr: PeerAddr,
    ) -> Vec<AdmissionCommand> {
        if let Some(record) = self.record_mut(torrent, addr) {
            record.status = ConnectionStatus::Connected;
            record.has_connected_before = true;
        }
        self.recompute(torrent)
    }

    /// A dial attempt failed. The record keeps `attempted` set with
    /// `has_connected_before` still false, which permanently disqualifies
    /// the peer from future dialing.
    pub fn on_connect_failed(
        &mut self,
        torrent: InfoHash,
        addr: PeerAddr,
    ) -> Vec<AdmissionCommand> {
        if let Some(record) = self.record_mut(torrent, addr) {
            record.status = ConnectionStatus::NotConnected;
        }
        self.recompute(torrent)
    }

    pub fn on_disconnect(&mut self, torrent: InfoHash, addr: PeerAddr) -> Vec<AdmissionCommand> {
        if let Some(record) = self.record_mut(torrent, addr) {
            record.status = ConnectionStatus::NotConnected;
        }
        self.recompute(torrent)
    }

    fn record_mut(&mut self, torrent: InfoHash, addr: PeerAddr) -> Option<&mut PeerRecord> {
        self.peers.get_mut(&torrent)?.get_mut(&addr)
    }

    /// Fill the torrent up to its caps with dialable peers; fall back to an
    /// announce when the pool runs dry below target.
    fn recompute(&mut self, torrent: InfoHash) -> Vec<AdmissionCommand> {
        let mut commands = Vec::new();
        if !self.active.contains(&torrent) {
            return commands;
        }

        loop {
            if self.connected_count(&torrent) >= self.per_torrent_cap
                || self.global_count() >= self.global_cap
            {
                return commands;
            }

            let candidate = self.peers.get(&torrent).and_then(|records| {
                records
                    .iter()
                    .find(|(_, record)| record.is_dialable())
                    .map(|(addr, _)| *addr)
            });

            match candidate {
                Some(addr) => {
                    if let Some(record) = self.record_mut(torrent, addr) {
                        record.status = ConnectionStatus::Connecting;
                        record.attempted = true;
                    }
                    commands.push(AdmissionCommand::TryConnect(torrent, addr));
                }
                None => {
                    // Below target with nobody left to dial.
                    commands.push(AdmissionCommand::DoAnnounce(torrent));
                    return commands;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn torrent(tag: u8) -> InfoHash {
        InfoHash::new([tag; 20])
    }

    fn peer(last: u8) -> PeerAddr {
        format!("10.0.0.{}:6881", last).parse().unwrap()
    }

    fn peers(n: u8) -> Vec<PeerAddr> {
        (1..=n).map(peer).collect()
    }

    #[test]
    fn activation_with_no_peers_asks_for_announce() {
        let mut tracker = PeerTracker::new();
        let commands = tracker.activate(torrent(1));
        assert_eq!(commands, vec![AdmissionCommand::DoAnnounce(torrent(1))]);
    }

    #[test]
    fn announce_dials_up_to_per_torrent_cap() {
        let mut tracker = PeerTracker::with_caps(3, 100);
        tracker.activate(torrent(1));

        let commands = tracker.on_announce(torrent(1), &peers(10));
        let dials = commands
            .iter()
            .filter(|c| matches!(c, AdmissionCommand::TryConnect(..)))
            .count();
        assert_eq!(dials, 3);
        assert_eq!(tracker.connected_count(&torrent(1)), 3);
    }

    #[test]
    fn per_torrent_cap_is_never_exceeded() {
        let mut tracker = PeerTracker::with_caps(2, 100);
        tracker.activate(torrent(1));
        tracker.on_announce(torrent(1), &peers(5));

        for addr in peers(5) {
            tracker.on_connect_success(torrent(1), addr);
            assert!(tracker.connected_count(&torrent(1)) <= 2);
        }
    }

    #[test]
    fn global_cap_is_never_exceeded() {
        let mut tracker = PeerTracker::with_caps(10, 4);
        tracker.activate(torrent(1));
        tracker.activate(torrent(2));

        tracker.on_announce(torrent(1), &peers(10));
        let commands = tracker.on_announce(torrent(2), &peers(10));

        let total: usize = [torrent(1), torrent(2)]
            .iter()
            .map(|t| tracker.connected_count(t))
            .sum();
        assert!(total <= 4);
        // The second torrent only got the slots the first left over.
        assert!(
            commands
                .iter()
                .filter(|c| matches!(c, AdmissionCommand::TryConnect(..)))
                .count()
                <= 4
        );
    }

    #[test]
    fn disconnect_frees_a_slot_for_the_next_peer() {
        let mut tracker = PeerTracker::with_caps(1, 100);
        tracker.activate(torrent(1));
        tracker.on_announce(torrent(1), &peers(2));

        tracker.on_connect_success(torrent(1), peer(1));
        let commands = tracker.on_disconnect(torrent(1), peer(1));

        // Slot freed; exactly one replacement dial goes out. Peer 1 sorts
        // first and has connected before, so it is the one retried.
        assert_eq!(
            commands,
            vec![AdmissionCommand::TryConnect(torrent(1), peer(1))]
        );
    }

    #[test]
    fn failed_slot_goes_to_the_next_candidate() {
        let mut tracker = PeerTracker::with_caps(1, 100);
        tracker.activate(torrent(1));
        tracker.on_announce(torrent(1), &peers(2));

        // Peer 1's dial fails; peer 2 takes the slot.
        let commands = tracker.on_connect_failed(torrent(1), peer(1));
        assert_eq!(
            commands,
            vec![AdmissionCommand::TryConnect(torrent(1), peer(2))]
        );
    }

    #[test]
    fn failed_peers_are_never_redialed() {
        let mut tracker = PeerTracker::with_caps(5, 100);
        tracker.activate(torrent(1));
        tracker.on_announce(torrent(1), &[peer(1)]);

        let commands = tracker.on_connect_failed(torrent(1), peer(1));
        // Pool exhausted instead of retrying the dead peer.
        assert_eq!(commands, vec![AdmissionCommand::DoAnnounce(torrent(1))]);
    }

    #[test]
    fn previously_connected_peers_may_reconnect() {
        let mut tracker = PeerTracker::with_caps(5, 100);
        tracker.activate(torrent(1));
        tracker.on_announce(torrent(1), &[peer(1)]);

        tracker.on_connect_success(torrent(1), peer(1));
        let commands = tracker.on_disconnect(torrent(1), peer(1));

        assert!(commands.contains(&AdmissionCommand::TryConnect(torrent(1), peer(1))));
    }

    #[test]
    fn announce_requested_when_pool_runs_dry() {
        let mut tracker = PeerTracker::with_caps(5, 100);
        tracker.activate(torrent(1));

        let commands = tracker.on_announce(torrent(1), &peers(2));
        // Two dials plus a request for more candidates.
        assert_eq!(
            commands.last(),
            Some(&AdmissionCommand::DoAnnounce(torrent(1)))
        );
    }

    #[test]
    fn deactivate_disconnects_but_keeps_history() {
        let mut tracker = PeerTracker::with_caps(5, 100);
        tracker.activate(torrent(1));
        tracker.on_announce(torrent(1), &peers(2));
        tracker.on_connect_success(torrent(1), peer(1));

        let commands = tracker.deactivate(torrent(1));
        assert!(commands.contains(&AdmissionCommand::Disconnect(torrent(1), peer(1))));
        assert_eq!(tracker.connected_count(&torrent(1)), 0);
        assert!(!tracker.is_active(&torrent(1)));

        // Reactivation remembers which peers were reachable.
        let commands = tracker.activate(torrent(1));
        assert!(commands.contains(&AdmissionCommand::TryConnect(torrent(1), peer(1))));
    }

    #[test]
    fn inactive_torrents_get_no_commands() {
        let mut tracker = PeerTracker::new();
        let commands = tracker.on_announce(torrent(1), &peers(3));
        assert!(commands.is_empty());
    }
}
