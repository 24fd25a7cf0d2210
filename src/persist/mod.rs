use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use tracing::debug;

use crate::message::PieceIndex;
use crate::torrent::InfoHash;

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("state file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt state file entry: {0}")]
    Corrupt(String),
}

/// Read/write contract against the resume store. Called at startup, at
/// shutdown and after each successful piece hash check; the engine never
/// depends on how the store is laid out.
pub trait Persistence: Send + Sync {
    fn load_known_pieces(&self, info_hash: &InfoHash) -> Result<BTreeSet<PieceIndex>, PersistError>;
    fn save_piece(&self, info_hash: &InfoHash, index: PieceIndex) -> Result<(), PersistError>;
    fn load_trackers(&self, info_hash: &InfoHash) -> Result<Vec<String>, PersistError>;
}

/// Line-oriented state directory: `<hex info-hash>.pieces` holds one decimal
/// piece index per line, `<hex info-hash>.trackers` one announce URL per
/// line.
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: PathBuf) -> Result<Self, PersistError> {
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn pieces_path(&self, info_hash: &InfoHash) -> PathBuf {
        self.root.join(format!("{}.pieces", info_hash))
    }

    fn trackers_path(&self, info_hash: &InfoHash) -> PathBuf {
        self.root.join(format!("{}.trackers", info_hash))
    }
}

impl Persistence for StateDir {
    fn load_known_pieces(&self, info_hash: &InfoHash) -> Result<BTreeSet<PieceIndex>, PersistError> {
        let path = self.pieces_path(info_hash);
        if !path.exists() {
            return Ok(BTreeSet::new());
        }

        let mut pieces = BTreeSet::new();
        for line in fs::read_to_string(path)?.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let index: PieceIndex = line
                .parse()
                .map_err(|_| PersistError::Corrupt(format!("bad piece index {:?}", line)))?;
            pieces.insert(index);
        }
        debug!(%info_hash, resumed = pieces.len(), "loaded known pieces");
        Ok(pieces)
    }

    fn save_piece(&self, info_hash: &InfoHash, index: PieceIndex) -> Result<(), PersistError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.pieces_path(info_hash))?;
        writeln!(file, "{}", index)?;
        Ok(())
    }

    fn load_trackers(&self, info_hash: &InfoHash) -> Result<Vec<String>, PersistError> {
        let path = self.trackers_path(info_hash);
        if !path.exists() {
            return Ok(Vec::new());
        }
        Ok(fs::read_to_string(path)?
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }
}

/// Store that remembers nothing; every run starts from scratch.
pub struct NoPersistence;

impl Persistence for NoPersistence {
    fn load_known_pieces(&self, _: &InfoHash) -> Result<BTreeSet<PieceIndex>, PersistError> {
        Ok(BTreeSet::new())
    }

    fn save_piece(&self, _: &InfoHash, _: PieceIndex) -> Result<(), PersistError> {
        Ok(())
    }

    fn load_trackers(&self, _: &InfoHash) -> Result<Vec<String>, PersistError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_root(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("swarm_rs_state_{}_{}", tag, rand::random::<u32>()))
    }

    #[test]
    fn pieces_round_trip() {
        let root = scratch_root("pieces");
        let store = StateDir::new(root.clone()).unwrap();
        let hash = InfoHash::new([5; 20]);

        store.save_piece(&hash, 3).unwrap();
        store.save_piece(&hash, 0).unwrap();
        store.save_piece(&hash, 17).unwrap();

        let loaded = store.load_known_pieces(&hash).unwrap();
        assert_eq!(loaded, [0, 3, 17].into_iter().collect());
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn missing_files_read_as_empty() {
        let root = scratch_root("empty");
        let store = StateDir::new(root.clone()).unwrap();
        let hash = InfoHash::new([6; 20]);

        assert!(store.load_known_pieces(&hash).unwrap().is_empty());
        assert!(store.load_trackers(&hash).unwrap().is_empty());
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn torrents_do_not_share_state() {
        let root = scratch_root("separate");
        let store = StateDir::new(root.clone()).unwrap();

        store.save_piece(&InfoHash::new([1; 20]), 1).unwrap();
        let other = store.load_known_pieces(&InfoHash::new([2; 20])).unwrap();
        assert!(other.is_empty());
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn corrupt_entries_are_reported() {
        let root = scratch_root("corrupt");
        let store = StateDir::new(root.clone()).unwrap();
        let hash = InfoHash::new([7; 20]);
        fs::write(store.pieces_path(&hash), "1\nnot-a-number\n").unwrap();

        assert!(matches!(
            store.load_known_pieces(&hash),
            Err(PersistError::Corrupt(_))
        ));
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn trackers_load_line_per_url() {
        let root = scratch_root("trackers");
        let store = StateDir::new(root.clone()).unwrap();
        let hash = InfoHash::new([8; 20]);
        fs::write(
            store.trackers_path(&hash),
            "http://a.example/announce\n\nhttp://b.example/announce\n",
        )
        .unwrap();

        assert_eq!(
            store.load_trackers(&hash).unwrap(),
            vec![
                "http://a.example/announce".to_string(),
                "http://b.example/announce".to_string(),
            ]
        );
        fs::remove_dir_all(root).unwrap();
    }
}
