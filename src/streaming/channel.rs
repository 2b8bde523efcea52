//! Hand-off between producing workers and the single connection writer.
//!
//! Workers never touch the connection. They package bytes into [`Chunk`]s
//! and push them onto one bounded queue; the writer task drains it in order.
//! Every blocking send also watches the session's cancellation token.

use crate::error::{Error, FileError, Result};
use crate::streaming::protocol::{Frame, MessageKind};
use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Chunk: worker -> writer
// =============================================================================

/// Unit of hand-off. Never split or merged once queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub kind: MessageKind,
    pub id: u32,
    pub data: Bytes,
}

impl Chunk {
    pub fn new(kind: MessageKind, id: u32, data: Bytes) -> Self {
        Self { kind, id, data }
    }

    /// Empty chunk that ends stream `id`.
    pub fn terminator(kind: MessageKind, id: u32) -> Self {
        Self::new(kind, id, Bytes::new())
    }

    pub fn into_frame(self) -> Frame {
        Frame::new(self.kind, self.id, self.data)
    }
}

// =============================================================================
// Queue
// =============================================================================

pub type ChunkReceiver = mpsc::Receiver<Chunk>;

/// Bounded worker -> writer queue. `depth` 1 makes every hand-off wait for
/// the writer.
pub fn chunk_queue(depth: usize, cancel: CancellationToken) -> (ChunkSender, ChunkReceiver) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (ChunkSender { tx, cancel }, rx)
}

/// Cloneable producer handle. The queue closes when every clone is dropped.
#[derive(Debug, Clone)]
pub struct ChunkSender {
    tx: mpsc::Sender<Chunk>,
    cancel: CancellationToken,
}

impl ChunkSender {
    /// Enqueue one chunk, waiting for room.
    ///
    /// Returns [`Error::Cancelled`] as soon as the session is cancelled,
    /// or when the writer has gone away.
    pub async fn send(&self, chunk: Chunk) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            sent = self.tx.send(chunk) => sent.map_err(|_| Error::Cancelled),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Stream writer for one (kind, id) pair.
    pub fn writer(&self, kind: MessageKind, id: u32, chunk_size: usize) -> ChunkWriter {
        ChunkWriter {
            sender: self.clone(),
            kind,
            id,
            chunk_size: chunk_size.max(1),
            buf: BytesMut::with_capacity(chunk_size),
            written: 0,
        }
    }
}

// =============================================================================
// ChunkWriter
// =============================================================================

/// Buffers one stream's bytes into `chunk_size` chunks.
///
/// [`ChunkWriter::finish`] must be called to send the terminator; a writer
/// dropped without it leaves the stream open, which the peer reports as
/// incomplete.
#[derive(Debug)]
pub struct ChunkWriter {
    sender: ChunkSender,
    kind: MessageKind,
    id: u32,
    chunk_size: usize,
    buf: BytesMut,
    written: u64,
}

impl ChunkWriter {
    pub async fn write(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let room = self.chunk_size - self.buf.len();
            let take = room.min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buf.len() == self.chunk_size {
                self.flush().await?;
            }
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let data = self.buf.split().freeze();
        self.written += data.len() as u64;
        self.sender
            .send(Chunk::new(self.kind, self.id, data))
            .await
    }

    /// Send buffered bytes and the terminator. Returns the payload bytes sent.
    pub async fn finish(mut self) -> Result<u64> {
        self.flush().await?;
        self.sender
            .send(Chunk::terminator(self.kind, self.id))
            .await?;
        Ok(self.written)
    }
}

// =============================================================================
// Session report
// =============================================================================

/// Outcome of one session that did not fail fatally.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SessionReport {
    /// Negotiated protocol version.
    pub version: u16,

    /// Files sent or rebuilt from full content
    pub files_full: u64,

    /// Files sent or rebuilt from a delta
    pub files_delta: u64,

    /// Directories, symlinks and empty files materialized from the manifest
    pub files_metadata: u64,

    /// Files already up to date
    pub files_skipped: u64,

    /// Extraneous entries removed from the target
    pub files_deleted: u64,

    /// Bytes that crossed the wire as file data or delta literals
    pub bytes_literal: u64,

    /// Per-file failures; the session continued past each of them
    pub errors: Vec<FileError>,
}

impl SessionReport {
    pub fn new(version: u16) -> Self {
        Self {
            version,
            ..Self::default()
        }
    }

    pub fn record_error(&mut self, err: FileError) {
        tracing::warn!(path = %err.path, kind = ?err.kind, "{}", err.message);
        self.errors.push(err);
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Entries transferred or materialized.
    pub fn files_transferred(&self) -> u64 {
        self.files_full + self.files_delta + self.files_metadata
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FileErrorKind;
    use std::time::Duration;

    #[tokio::test]
    async fn test_chunk_writer_splits_and_terminates() {
        let (tx, mut rx) = chunk_queue(8, CancellationToken::new());
        let mut writer = tx.writer(MessageKind::FileData, 3, 4);
        writer.write(b"abcdefghij").await.unwrap();
        assert_eq!(writer.finish().await.unwrap(), 10);
        drop(tx);

        let mut payloads = Vec::new();
        while let Some(chunk) = rx.recv().await {
            assert_eq!(chunk.id, 3);
            assert_eq!(chunk.kind, MessageKind::FileData);
            payloads.push(chunk.data);
        }
        assert_eq!(
            payloads,
            vec![
                Bytes::from_static(b"abcd"),
                Bytes::from_static(b"efgh"),
                Bytes::from_static(b"ij"),
                Bytes::new(),
            ]
        );
    }

    #[tokio::test]
    async fn test_blocked_send_observes_cancellation() {
        let cancel = CancellationToken::new();
        let (tx, _rx) = chunk_queue(1, cancel.clone());

        // Fill the single slot; nobody drains it
        tx.send(Chunk::terminator(MessageKind::Delta, 0))
            .await
            .unwrap();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let blocked = tx.send(Chunk::terminator(MessageKind::Delta, 1));
        let result = tokio::time::timeout(Duration::from_secs(2), blocked)
            .await
            .expect("send did not observe cancellation");
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_send_after_writer_gone() {
        let (tx, rx) = chunk_queue(1, CancellationToken::new());
        drop(rx);
        let result = tx.send(Chunk::terminator(MessageKind::Delta, 0)).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn test_session_report_json() {
        let mut report = SessionReport::new(1);
        report.files_full = 2;
        report.files_metadata = 1;
        report.record_error(FileError::new("x", FileErrorKind::Io, "denied"));
        assert_eq!(report.files_transferred(), 3);
        assert!(!report.is_clean());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["errors"][0]["kind"], "io");
    }
}
