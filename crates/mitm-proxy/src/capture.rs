//! Capture file emission (part of C8): a binary `.mcs` trace of every
//! frame the proxy has seen, written for offline analysis. Grounded on
//! `mcproxy.c`'s `save_packet`, which appends one fixed header plus raw
//! bytes per frame and fsyncs after every write.

use chrono::{Datelike, Timelike};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::handshake::Direction;

/// One `.mcs` capture file, open for append-only writes.
///
/// A write failure disables capture for the rest of the session (§7)
/// rather than tearing the session down -- the capture file is a
/// diagnostic aid, not part of the protocol.
pub struct CaptureFile {
    file: Option<File>,
    path: PathBuf,
}

impl CaptureFile {
    /// Create `<capture_dir>/YYYYMMDD_HHMMSS.mcs`, creating the
    /// directory if needed. `now` is injected so tests (and callers
    /// that don't want a wall-clock dependency) can supply a fixed
    /// timestamp.
    pub async fn create(
        capture_dir: &Path,
        now: chrono::DateTime<chrono::Utc>,
    ) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(capture_dir).await?;
        let name = format!(
            "{:04}{:02}{:02}_{:02}{:02}{:02}.mcs",
            now.year(),
            now.month(),
            now.day(),
            now.hour(),
            now.minute(),
            now.second()
        );
        let path = capture_dir.join(name);
        let file = File::create(&path).await?;
        Ok(Self {
            file: Some(file),
            path,
        })
    }

    /// Append one frame record: `u32 direction, u32 sec, u32 usec, u32
    /// length, length bytes`, all big-endian, flushed immediately.
    /// `frame` is the post-decompression, pre-decryption-on-read bytes
    /// (type prefix included), as the spec's capture-file interface
    /// requires.
    pub async fn append(&mut self, direction: Direction, frame: &[u8], sec: u32, usec: u32) {
        let Some(file) = self.file.as_mut() else {
            return;
        };

        let mut record = Vec::with_capacity(16 + frame.len());
        record.extend_from_slice(&direction_code(direction).to_be_bytes());
        record.extend_from_slice(&sec.to_be_bytes());
        record.extend_from_slice(&usec.to_be_bytes());
        record.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        record.extend_from_slice(frame);

        if let Err(e) = file.write_all(&record).await {
            tracing::warn!(path = %self.path.display(), error = %e, "capture file write failed, disabling capture");
            self.file = None;
            return;
        }
        if let Err(e) = file.flush().await {
            tracing::warn!(path = %self.path.display(), error = %e, "capture file flush failed, disabling capture");
            self.file = None;
        }
    }

    /// Flush and close, dropping the handle. Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush().await;
        }
    }
}

fn direction_code(direction: Direction) -> u32 {
    match direction {
        Direction::ServerToClient => 0,
        Direction::ClientToServer => 1,
    }
}

/// Synchronous record encoder used by tests to check the on-disk shape
/// without spinning up a tokio runtime.
#[cfg(test)]
fn encode_record(direction: Direction, frame: &[u8], sec: u32, usec: u32) -> Vec<u8> {
    let mut record = Vec::new();
    record
        .write_all(&direction_code(direction).to_be_bytes())
        .unwrap();
    record.write_all(&sec.to_be_bytes()).unwrap();
    record.write_all(&usec.to_be_bytes()).unwrap();
    record
        .write_all(&(frame.len() as u32).to_be_bytes())
        .unwrap();
    record.write_all(frame).unwrap();
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_codes_match_spec() {
        assert_eq!(direction_code(Direction::ServerToClient), 0);
        assert_eq!(direction_code(Direction::ClientToServer), 1);
    }

    #[test]
    fn record_layout_is_four_be_headers_then_payload() {
        let frame = b"hello frame";
        let record = encode_record(Direction::ClientToServer, frame, 12, 345);

        assert_eq!(&record[0..4], &1u32.to_be_bytes());
        assert_eq!(&record[4..8], &12u32.to_be_bytes());
        assert_eq!(&record[8..12], &345u32.to_be_bytes());
        assert_eq!(&record[12..16], &(frame.len() as u32).to_be_bytes());
        assert_eq!(&record[16..], frame);
    }

    #[tokio::test]
    async fn create_and_append_then_close() {
        let dir = tempfile::tempdir().unwrap();
        let now = chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let mut capture = CaptureFile::create(dir.path(), now).await.unwrap();

        capture
            .append(Direction::ServerToClient, b"abc", 1, 2)
            .await;
        capture.close().await;

        let contents = tokio::fs::read(&capture.path).await.unwrap();
        assert_eq!(contents.len(), 16 + 3);
    }

    #[tokio::test]
    async fn append_after_close_is_a_silent_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let now = chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let mut capture = CaptureFile::create(dir.path(), now).await.unwrap();
        capture.close().await;
        capture.append(Direction::ClientToServer, b"x", 0, 0).await;
    }
}
