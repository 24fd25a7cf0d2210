use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Directory where downloaded files will be saved.
    pub download_path: PathBuf,
    /// Resume-state directory; `None` disables persistence.
    pub state_dir: Option<PathBuf>,
    /// Port reported to the tracker.
    pub listen_port: u16,
    /// Connected-peer target per torrent.
    pub max_peers_per_torrent: usize,
    /// Connected-peer cap across every active torrent.
    pub max_peers_global: usize,
    /// Timeout for establishing peer connections.
    pub connection_timeout: Duration,
    /// How long to wait before retrying a failed announce.
    pub announce_retry: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            download_path: PathBuf::from("."),
            state_dir: None,
            listen_port: 6881,
            max_peers_per_torrent: 20,
            max_peers_global: 200,
            connection_timeout: Duration::from_secs(10),
            announce_retry: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    pub fn with_download_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.download_path = path.into();
        self
    }

    pub fn with_state_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(path.into());
        self
    }

    pub fn with_peer_caps(mut self, per_torrent: usize, global: usize) -> Self {
        self.max_peers_per_torrent = per_torrent;
        self.max_peers_global = global;
        self
    }

    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }
}
