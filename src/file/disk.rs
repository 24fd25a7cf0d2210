use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

use anyhow::Context;
use tracing::debug;

use super::FileManager;
use crate::message::PieceIndex;

/// Writes verified pieces into the torrent's output files.
///
/// Pieces address the torrent's content as one contiguous byte range, so a
/// single piece may span the boundary between two (or more) files.
pub struct DiskFileManager {
    files: Vec<File>,
    layout: Vec<(String, u64)>,
    piece_size: u64,
}

impl DiskFileManager {
    pub fn new(
        download_dir: PathBuf,
        layout: Vec<(String, u64)>,
        piece_size: u64,
    ) -> anyhow::Result<Self> {
        let mut handles = Vec::with_capacity(layout.len());

        for (relative, length) in &layout {
            let path = download_dir.join(relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            file.set_len(*length)
                .with_context(|| format!("Failed to size {}", path.display()))?;
            handles.push(file);
        }

        Ok(Self {
            files: handles,
            layout,
            piece_size,
        })
    }
}

impl FileManager for DiskFileManager {
    fn write_piece(&mut self, piece_index: PieceIndex, data: &[u8]) -> anyhow::Result<()> {
        let mut absolute = u64::from(piece_index) * self.piece_size;
        let mut remaining = data;

        let mut file_start = 0u64;
        for (file_index, (_, file_size)) in self.layout.iter().enumerate() {
            let file_end = file_start + file_size;
            if absolute < file_end && !remaining.is_empty() {
                let within = absolute - file_start;
                let fits = ((file_size - within).min(remaining.len() as u64)) as usize;

                self.files[file_index]
                    .seek(SeekFrom::Start(within))
                    .context("Failed to seek output file")?;
                self.files[file_index]
                    .write_all(&remaining[..fits])
                    .context("Failed to write piece data")?;

                remaining = &remaining[fits..];
                absolute += fits as u64;
            }
            if remaining.is_empty() {
                break;
            }
            file_start = file_end;
        }

        debug!(piece_index, bytes = data.len(), "piece written to disk");
        Ok(())
    }
}
