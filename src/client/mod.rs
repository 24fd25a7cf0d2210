mod config;
mod session;
mod state;

pub use config::ClientConfig;
pub use session::TorrentSession;
pub use state::{format_bytes, DownloadStats};
