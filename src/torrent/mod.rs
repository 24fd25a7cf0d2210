use core::fmt;
use std::path::Path;

use anyhow::Context;
use serde_derive::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

mod hashes;

pub use hashes::Hashes;

/// 20-byte SHA-1 of the bencoded info dictionary. Identifies a torrent
/// everywhere in the client; maps are keyed by it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Percent-encodes every byte, the form trackers expect in the announce
    /// query string.
    pub fn url_encoded(&self) -> String {
        let mut encoded = String::with_capacity(self.0.len() * 3);
        for byte in self.0 {
            encoded.push('%');
            encoded.push_str(&format!("{:02X}", byte));
        }
        encoded
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", hex::encode(self.0))
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("bencode decoding error: {0}")]
    BencodeDecoding(#[from] serde_bencode::Error),
    #[error("torrent has no pieces")]
    NoPieces,
    #[error("piece length must be non-zero")]
    ZeroPieceLength,
}

/// A parsed torrent descriptor (metainfo file).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Torrent {
    /// The URL of the tracker.
    pub announce: String,
    pub info: Info,
    #[serde(skip)]
    pub info_hash: Option<InfoHash>,
}

impl Torrent {
    /// Read and parse a `.torrent` file, computing the info hash.
    #[tracing::instrument]
    pub async fn open(path: impl AsRef<Path> + fmt::Debug) -> anyhow::Result<Self> {
        let raw = tokio::fs::read(path)
            .await
            .context("Failed opening torrent file")?;
        let mut torrent: Torrent =
            serde_bencode::from_bytes(&raw).context("Failed parsing torrent file")?;
        torrent.validate()?;
        torrent
            .compute_info_hash()
            .context("Failed to hash info dictionary")?;

        tracing::info!("Opened torrent {}", torrent.info.name);
        Ok(torrent)
    }

    fn validate(&self) -> Result<(), TorrentError> {
        if self.info.pieces.0.is_empty() {
            return Err(TorrentError::NoPieces);
        }
        if self.info.piece_length == 0 {
            return Err(TorrentError::ZeroPieceLength);
        }
        Ok(())
    }

    /// The info hash is the SHA-1 of the info dict exactly as bencoded, so
    /// the dict is re-encoded rather than hashed from the raw file bytes.
    pub fn compute_info_hash(&mut self) -> anyhow::Result<InfoHash> {
        if let Some(hash) = self.info_hash {
            return Ok(hash);
        }
        let info_encoded =
            serde_bencode::to_bytes(&self.info).context("Failed to re-encode info dictionary")?;

        let mut hasher = Sha1::new();
        hasher.update(&info_encoded);
        let hash = InfoHash::new(hasher.finalize().into());

        self.info_hash = Some(hash);
        Ok(hash)
    }

    /// Total content length in bytes across all files.
    pub fn length(&self) -> u64 {
        match &self.info.keys {
            Keys::SingleFile { length } => *length,
            Keys::MultiFile { files } => files.iter().map(|file| file.length).sum(),
        }
    }

    pub fn piece_count(&self) -> u32 {
        self.info.pieces.0.len() as u32
    }

    pub fn piece_length(&self) -> u64 {
        self.info.piece_length
    }

    /// Output file layout as (relative path, length) pairs.
    pub fn file_layout(&self) -> Vec<(String, u64)> {
        match &self.info.keys {
            Keys::SingleFile { length } => vec![(self.info.name.clone(), *length)],
            Keys::MultiFile { files } => files
                .iter()
                .map(|file| {
                    let path = file.path.join(std::path::MAIN_SEPARATOR_STR);
                    (path, file.length)
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Info {
    /// The suggested name to save the file (or directory) as.
    pub name: String,

    /// The number of bytes in each piece; all pieces are this size except
    /// possibly the last one.
    #[serde(rename = "piece length")]
    pub piece_length: u64,

    /// SHA-1 digest of each piece, in index order.
    pub pieces: Hashes,

    #[serde(flatten)]
    pub keys: Keys,
}

/// There is a key `length` or a key `files`, but not both or neither.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Keys {
    /// A single-file torrent.
    SingleFile { length: u64 },
    /// A directory of files, concatenated in list order for piece purposes.
    MultiFile { files: Vec<File> },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct File {
    pub length: u64,

    /// Subdirectory names, the last of which is the actual file name.
    pub path: Vec<String>,
}
