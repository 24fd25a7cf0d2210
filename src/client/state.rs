use std::time::Instant;

/// Download counters, owned and updated by the orchestrator only; other
/// tasks learn about progress through events, never by reading these.
#[derive(Debug)]
pub struct DownloadStats {
    downloaded_bytes: u64,
    uploaded_bytes: u64,
    pieces_completed: u64,
    total_pieces: u32,
    start_time: Instant,
}

impl DownloadStats {
    pub fn new(total_pieces: u32, already_completed: u64) -> Self {
        Self {
            downloaded_bytes: 0,
            uploaded_bytes: 0,
            pieces_completed: already_completed,
            total_pieces,
            start_time: Instant::now(),
        }
    }

    pub fn add_downloaded(&mut self, bytes: u64) {
        self.downloaded_bytes += bytes;
    }

    pub fn increment_pieces(&mut self) {
        self.pieces_completed += 1;
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded_bytes
    }

    pub fn pieces_completed(&self) -> u64 {
        self.pieces_completed
    }

    pub fn total_pieces(&self) -> u32 {
        self.total_pieces
    }

    /// Bytes per second since the session started.
    pub fn download_speed(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed < 0.001 {
            return 0.0;
        }
        self.downloaded_bytes as f64 / elapsed
    }
}

/// Format byte count as human-readable string (e.g. "631.0 MB").
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let mut stats = DownloadStats::new(10, 2);
        stats.add_downloaded(100);
        stats.add_downloaded(50);
        stats.increment_pieces();

        assert_eq!(stats.downloaded_bytes(), 150);
        assert_eq!(stats.pieces_completed(), 3);
        assert_eq!(stats.total_pieces(), 10);
    }

    #[test]
    fn byte_formatting() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GB");
    }
}
