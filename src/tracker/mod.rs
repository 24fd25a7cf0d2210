use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use rand::Rng;
use serde::de::{self, Deserializer, Visitor};
use serde_derive::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::peer::PeerAddr;
use crate::queue::RightEndpoint;
use crate::torrent::InfoHash;

const PEER_ID_LENGTH: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("announce request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to encode announce parameters: {0}")]
    Encode(#[from] serde_urlencoded::ser::Error),
    #[error("failed to decode tracker response: {0}")]
    Decode(#[from] serde_bencode::Error),
    #[error("tracker refused the announce: {0}")]
    Refused(String),
}

/// Compact peer list: 6 bytes per peer, 4 of IPv4 address then 2 of port,
/// both big-endian.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactPeers(pub Vec<PeerAddr>);

impl CompactPeers {
    pub fn iter(&self) -> std::slice::Iter<'_, PeerAddr> {
        self.0.iter()
    }
}

struct CompactPeersVisitor;

impl<'de> Visitor<'de> for CompactPeersVisitor {
    type Value = CompactPeers;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a byte string whose length is a multiple of 6")
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        if v.len() % 6 != 0 {
            return Err(E::custom(format!("peer list length {} not divisible by 6", v.len())));
        }
        Ok(CompactPeers(
            v.chunks_exact(6)
                .map(|entry| {
                    SocketAddrV4::new(
                        Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]),
                        u16::from_be_bytes([entry[4], entry[5]]),
                    )
                })
                .collect(),
        ))
    }
}

impl<'de> serde::Deserialize<'de> for CompactPeers {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_bytes(CompactPeersVisitor)
    }
}

/// What the announce yields; the download engine only consumes the
/// intervals and the raw peer list.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerResponse {
    /// Seconds the tracker wants between regular announces.
    #[serde(default)]
    pub interval: u64,

    /// Hard lower bound on the announce cadence, when the tracker sets one.
    #[serde(rename = "min interval", default)]
    pub min_interval: Option<u64>,

    #[serde(rename = "failure reason", default)]
    pub failure_reason: Option<String>,

    #[serde(default)]
    pub peers: CompactPeers,
}

/// Stats portion of the announce query string; the info hash is appended
/// separately because it is raw bytes, not UTF-8.
#[derive(Debug, Clone, Serialize)]
struct AnnounceParams {
    peer_id: String,
    port: u16,
    uploaded: u64,
    downloaded: u64,
    left: u64,
    compact: u8,
}

/// HTTP announce client for a single torrent's tracker.
#[derive(Debug, Clone)]
pub struct TrackerClient {
    announce_url: String,
    info_hash: InfoHash,
    peer_id: String,
    port: u16,
}

impl TrackerClient {
    pub fn new(announce_url: String, info_hash: InfoHash, peer_id: String, port: u16) -> Self {
        Self {
            announce_url,
            info_hash,
            peer_id,
            port,
        }
    }

    /// Announce our stats and fetch a fresh batch of candidate peers.
    pub async fn announce(
        &self,
        uploaded: u64,
        downloaded: u64,
        left: u64,
    ) -> Result<TrackerResponse, TrackerError> {
        let params = AnnounceParams {
            peer_id: self.peer_id.clone(),
            port: self.port,
            uploaded,
            downloaded,
            left,
            compact: 1,
        };
        let query = serde_urlencoded::to_string(&params)?;
        let url = format!(
            "{}?{}&info_hash={}",
            self.announce_url,
            query,
            self.info_hash.url_encoded(),
        );

        debug!(%url, "announcing");
        let body = reqwest::get(url).await?.bytes().await?;
        let response: TrackerResponse = serde_bencode::from_bytes(&body)?;

        if let Some(reason) = &response.failure_reason {
            return Err(TrackerError::Refused(reason.clone()));
        }
        info!(
            peers = response.peers.0.len(),
            interval = response.interval,
            "announce succeeded"
        );
        Ok(response)
    }
}

/// A 20-byte printable peer id with the client prefix.
pub fn generate_peer_id() -> String {
    let prefix = "-SW0001-";
    let mut id = String::with_capacity(PEER_ID_LENGTH);
    id.push_str(prefix);

    let mut rng = rand::thread_rng();
    while id.len() < PEER_ID_LENGTH {
        id.push(rng.gen_range('0'..='Z'));
    }
    id
}

/// Announce request sent by the orchestrator to the tracker worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceRequest {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// Tracker worker reply; failures ride along so the orchestrator can decide
/// whether to retry later.
#[derive(Debug)]
pub struct AnnounceEvent {
    pub result: Result<TrackerResponse, TrackerError>,
}

/// Worker loop: one announce per queued request, results pushed back on the
/// same channel. HTTP never blocks the orchestrator.
pub async fn tracker_worker(
    client: TrackerClient,
    endpoint: RightEndpoint<AnnounceRequest, AnnounceEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!("tracker worker started");
    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => break,

            request = endpoint.pop() => {
                let result = client
                    .announce(request.uploaded, request.downloaded, request.left)
                    .await;
                if let Err(error) = &result {
                    warn!(%error, "announce failed");
                }
                endpoint.push(AnnounceEvent { result }).await;
            }
        }
    }
    info!("tracker worker stopped");
}
