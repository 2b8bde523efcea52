//! Sending side of a session.
//!
//! Publishes the manifest, then serves the receiver's requests: a signature
//! is answered with a delta, an empty file-data frame with the full content.
//! Requests are read in arrival order and handed to the worker pool; the
//! session ends once the receiver signals end-of-exchange and every job has
//! drained through the writer.

use crate::config::SessionConfig;
use crate::delta::{compute_delta_with, DeltaOp, Signature};
use crate::error::{Error, FileError, FileErrorKind, Result};
use crate::streaming::channel::{chunk_queue, ChunkSender, SessionReport};
use crate::streaming::generator::{generate_manifest, FileEnumerator, LocalManifest};
use crate::streaming::manifest::{write_manifest, FileInfo};
use crate::streaming::mux::{notify_peer, primary_error, run_writer, WorkerPool};
use crate::streaming::protocol::{
    negotiate_client, read_frame, ErrorMessage, Frame, MessageKind, MAX_PAYLOAD_SIZE,
};
use anyhow::Context;
use bytes::BytesMut;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader, BufWriter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Delta ops in flight between the scan and the chunk writer.
const DELTA_OP_QUEUE: usize = 4;

/// What the workers need to answer a request.
struct SendContext {
    files: Vec<FileInfo>,
    sources: Vec<PathBuf>,
    chunk_size: usize,
}

/// Result of one worker job.
enum JobOutcome {
    Sent { delta: bool, literal: u64 },
    Failed(FileError),
    Cancelled,
}

/// Push the enumerated files over `conn`.
///
/// Returns the session report, whose `errors` hold every per-file failure,
/// or the fatal error that ended the session.
pub async fn send_files<S, E>(
    mut conn: S,
    mut enumerator: E,
    config: &SessionConfig,
) -> Result<SessionReport>
where
    S: AsyncRead + AsyncWrite + Unpin,
    E: FileEnumerator + Send + 'static,
{
    config.validate().map_err(Error::local)?;

    // Enumerate before the handshake so a bad source never touches the wire
    let manifest = tokio::task::spawn_blocking(move || generate_manifest(&mut enumerator))
        .await
        .map_err(|e| Error::Local(format!("enumeration task failed: {}", e)))?
        .map_err(Error::local)?;

    let version = negotiate_client(&mut conn, config.max_version()).await?;
    let mut report = SessionReport::new(version.get());
    report.files_metadata = manifest
        .files
        .iter()
        .filter(|f| !f.is_regular() || f.size == 0)
        .count() as u64;

    let LocalManifest {
        files,
        sources,
        errors,
    } = manifest;
    for err in errors {
        report.record_error(err);
    }

    let (rd, wr) = tokio::io::split(conn);
    let mut reader = BufReader::new(rd);
    let mut writer = BufWriter::new(wr);

    write_manifest(&mut writer, &files).await?;
    tracing::info!(files = files.len(), version = %version, "manifest sent");

    let ctx = Arc::new(SendContext {
        files,
        sources,
        chunk_size: config.chunk_size,
    });
    let cancel = CancellationToken::new();
    let (chunks, rx) = chunk_queue(config.queue_depth, cancel.clone());

    let serve = serve_requests(&mut reader, chunks, ctx, config.workers);
    let write = async {
        let written = run_writer(rx, &mut writer, cancel.clone()).await;
        if written.is_err() {
            cancel.cancel();
        }
        written
    };
    let (served, written) = tokio::join!(serve, write);

    let outcomes = match (served, written) {
        (Ok(outcomes), Ok(_)) => outcomes,
        (served, written) => {
            let err = primary_error(served.err().into_iter().chain(written.err()))
                .unwrap_or(Error::Cancelled);
            notify_peer(&mut writer, &err).await;
            return Err(err);
        }
    };

    for outcome in outcomes {
        match outcome {
            JobOutcome::Sent { delta, literal } => {
                if delta {
                    report.files_delta += 1;
                } else {
                    report.files_full += 1;
                }
                report.bytes_literal += literal;
            }
            JobOutcome::Failed(err) => report.record_error(err),
            JobOutcome::Cancelled => return Err(Error::Cancelled),
        }
    }

    tracing::info!(
        full = report.files_full,
        delta = report.files_delta,
        errors = report.errors.len(),
        "send complete"
    );
    Ok(report)
}

/// Read the receiver's requests until end-of-exchange, spawning one job per
/// request. Drops `chunks` only after every job is done, which lets the
/// writer close the exchange.
async fn serve_requests<R>(
    reader: &mut R,
    chunks: ChunkSender,
    ctx: Arc<SendContext>,
    workers: usize,
) -> Result<Vec<JobOutcome>>
where
    R: AsyncRead + Unpin,
{
    let cancel = chunks.cancel_token().clone();
    let mut pool = WorkerPool::new(workers, cancel.clone());
    let mut partial: HashMap<u32, BytesMut> = HashMap::new();
    let mut requested: HashSet<u32> = HashSet::new();

    let served = async {
        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                frame = read_frame(&mut *reader) => frame?,
            };

            match frame.kind {
                MessageKind::EndOfExchange => return Ok(()),
                MessageKind::Error => {
                    let msg = ErrorMessage::decode(frame.payload)?;
                    return Err(Error::Remote(msg.into()));
                }
                MessageKind::Signature => {
                    check_request(&ctx, &mut requested, &frame, frame.is_terminator())?;
                    if !frame.is_terminator() {
                        buffer_signature(&mut partial, &frame)?;
                        continue;
                    }
                    let raw = partial.remove(&frame.id).unwrap_or_default().freeze();
                    let sig = Signature::decode(raw).map_err(|e| {
                        Error::protocol(format!("malformed signature for id {}: {:#}", frame.id, e))
                    })?;
                    tracing::debug!(id = frame.id, blocks = sig.blocks.len(), "delta requested");
                    pool.spawn(send_delta(ctx.clone(), frame.id, sig, chunks.clone()))
                        .await?;
                }
                MessageKind::FileData => {
                    if !frame.is_terminator() {
                        return Err(Error::protocol(format!(
                            "file data from receiver for id {}",
                            frame.id
                        )));
                    }
                    check_request(&ctx, &mut requested, &frame, true)?;
                    tracing::debug!(id = frame.id, "full content requested");
                    pool.spawn(send_full(ctx.clone(), frame.id, chunks.clone()))
                        .await?;
                }
                MessageKind::Delta => {
                    return Err(Error::protocol(format!(
                        "delta from receiver for id {}",
                        frame.id
                    )));
                }
            }
        }
    };
    let served: Result<()> = served.await;

    if served.is_err() {
        cancel.cancel();
    }
    let outcomes = pool.join().await;
    drop(chunks);
    served.map(|()| outcomes)
}

/// Collect one signature chunk. A signature never needs more than one
/// frame's worth of bytes.
fn buffer_signature(partial: &mut HashMap<u32, BytesMut>, frame: &Frame) -> Result<()> {
    let buf = partial.entry(frame.id).or_default();
    if buf.len() + frame.payload.len() > MAX_PAYLOAD_SIZE as usize {
        return Err(Error::protocol(format!(
            "signature for id {} exceeds {} bytes",
            frame.id, MAX_PAYLOAD_SIZE
        )));
    }
    buf.extend_from_slice(&frame.payload);
    Ok(())
}

/// A request must name a regular file of the manifest, at most once.
/// `complete` marks the frame that finishes the request.
fn check_request(
    ctx: &SendContext,
    requested: &mut HashSet<u32>,
    frame: &Frame,
    complete: bool,
) -> Result<()> {
    let info = ctx.files.get(frame.id as usize).ok_or_else(|| {
        Error::protocol(format!(
            "stream id {} out of range ({} files)",
            frame.id,
            ctx.files.len()
        ))
    })?;
    if !info.is_regular() {
        return Err(Error::protocol(format!(
            "request for non-regular entry {} (id {})",
            info.path, frame.id
        )));
    }
    if requested.contains(&frame.id) || (complete && !requested.insert(frame.id)) {
        return Err(Error::protocol(format!(
            "duplicate request for {} (id {})",
            info.path, frame.id
        )));
    }
    Ok(())
}

fn job_outcome(path: &str, delta: bool, result: anyhow::Result<u64>) -> JobOutcome {
    match result {
        Ok(literal) => JobOutcome::Sent { delta, literal },
        Err(e) if matches!(e.downcast_ref::<Error>(), Some(Error::Cancelled)) => {
            JobOutcome::Cancelled
        }
        Err(e) => JobOutcome::Failed(FileError::from_anyhow(path, FileErrorKind::Io, &e)),
    }
}

/// Stream the whole file as file-data chunks.
async fn send_full(ctx: Arc<SendContext>, id: u32, chunks: ChunkSender) -> JobOutcome {
    let idx = id as usize;
    let result = async {
        let mut file = File::open(&ctx.sources[idx])
            .await
            .context("Failed to open file for full transfer")?;
        let mut out = chunks.writer(MessageKind::FileData, id, ctx.chunk_size);
        let mut buf = vec![0u8; ctx.chunk_size];
        loop {
            let n = file.read(&mut buf).await.context("Failed to read file")?;
            if n == 0 {
                break;
            }
            out.write(&buf[..n]).await?;
        }
        Ok::<_, anyhow::Error>(out.finish().await?)
    };
    job_outcome(&ctx.files[idx].path, false, result.await)
}

/// Diff the local file against the receiver's signature and stream the ops.
/// Returns the literal bytes sent.
///
/// The scan runs on the blocking pool and hands each op over a small
/// channel, so literals reach the chunk queue while the file is still
/// being read.
async fn send_delta(
    ctx: Arc<SendContext>,
    id: u32,
    sig: Signature,
    chunks: ChunkSender,
) -> JobOutcome {
    let idx = id as usize;
    let result = async {
        let (ops_tx, mut ops_rx) = mpsc::channel::<DeltaOp>(DELTA_OP_QUEUE);
        let source = ctx.sources[idx].clone();
        let scan = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let file = std::fs::File::open(&source).context("Failed to open file for delta")?;
            compute_delta_with(&sig, std::io::BufReader::new(file), |op| {
                ops_tx
                    .blocking_send(op)
                    .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "delta stream closed"))
            })?;
            Ok(())
        });

        let mut out = chunks.writer(MessageKind::Delta, id, ctx.chunk_size);
        let forward = async move {
            let mut literal = 0u64;
            let mut buf = BytesMut::new();
            while let Some(op) = ops_rx.recv().await {
                if let DeltaOp::Literal(data) = &op {
                    literal += data.len() as u64;
                }
                buf.clear();
                op.encode_into(&mut buf);
                out.write(&buf).await?;
            }
            Ok::<_, Error>((out, literal))
        };

        let (scanned, forwarded) = tokio::join!(scan, forward);
        let (out, literal) = forwarded?;
        scanned.context("Delta task failed")??;
        out.finish().await?;
        Ok::<_, anyhow::Error>(literal)
    };
    job_outcome(&ctx.files[idx].path, true, result.await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{compute_signature, DeltaApplier};
    use crate::streaming::channel::Chunk;
    use crate::streaming::manifest::FileMode;
    use std::fs;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn context(tmp: &TempDir, name: &str, content: &[u8], chunk_size: usize) -> Arc<SendContext> {
        let source = tmp.path().join(name);
        fs::write(&source, content).unwrap();
        Arc::new(SendContext {
            files: vec![FileInfo {
                path: name.to_string(),
                size: content.len() as u64,
                mode: FileMode::regular(0o644),
                mtime_secs: 0,
                mtime_nanos: 0,
                link: None,
            }],
            sources: vec![source],
            chunk_size,
        })
    }

    async fn drain(mut rx: crate::streaming::channel::ChunkReceiver) -> Vec<Chunk> {
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.push(chunk);
        }
        out
    }

    #[tokio::test]
    async fn test_send_full_chunks_file() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp, "test.txt", b"hello world", 4);
        let (tx, rx) = chunk_queue(16, CancellationToken::new());

        let outcome = send_full(ctx, 0, tx).await;
        assert!(matches!(
            outcome,
            JobOutcome::Sent {
                delta: false,
                literal: 11
            }
        ));

        let chunks = drain(rx).await;
        let body: Vec<u8> = chunks.iter().flat_map(|c| c.data.to_vec()).collect();
        assert_eq!(body, b"hello world");
        assert!(chunks.last().unwrap().data.is_empty());
        assert!(chunks.iter().all(|c| c.kind == MessageKind::FileData));
    }

    #[tokio::test]
    async fn test_send_delta_rebuilds_source() {
        let tmp = TempDir::new().unwrap();
        let base = b"the quick brown fox jumps over the lazy dog".repeat(50);
        let mut updated = base.clone();
        updated.splice(100..100, b"INSERTED".iter().copied());
        let ctx = context(&tmp, "doc.txt", &updated, 64);

        let sig = compute_signature(Cursor::new(&base), 32).unwrap();
        let (tx, rx) = chunk_queue(16, CancellationToken::new());
        let outcome = send_delta(ctx, 0, sig, tx).await;
        let JobOutcome::Sent { delta, literal } = outcome else {
            panic!("delta job failed");
        };
        assert!(delta);
        assert!(literal < updated.len() as u64 / 4);

        let mut applier = DeltaApplier::new(Cursor::new(base.clone()), base.len() as u64);
        let mut out = Vec::new();
        for chunk in drain(rx).await {
            assert_eq!(chunk.kind, MessageKind::Delta);
            applier.feed(&chunk.data, &mut out).await.unwrap();
        }
        applier.finish().unwrap();
        assert_eq!(out, updated);
    }

    #[tokio::test]
    async fn test_send_delta_streams_through_shallow_queue() {
        let tmp = TempDir::new().unwrap();
        let base = vec![0u8; 8192];
        let updated: Vec<u8> = (0..3 * 1024 * 1024u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 11) as u8)
            .collect();
        let ctx = context(&tmp, "big.bin", &updated, 32 * 1024);

        let sig = compute_signature(Cursor::new(&base), 1024).unwrap();
        let (tx, rx) = chunk_queue(1, CancellationToken::new());
        let (outcome, chunks) = tokio::join!(send_delta(ctx, 0, sig, tx), drain(rx));
        assert!(matches!(
            outcome,
            JobOutcome::Sent { delta: true, literal } if literal == updated.len() as u64
        ));

        let mut applier = DeltaApplier::new(Cursor::new(base.clone()), base.len() as u64);
        let mut out = Vec::new();
        for chunk in &chunks {
            applier.feed(&chunk.data, &mut out).await.unwrap();
        }
        applier.finish().unwrap();
        assert_eq!(out, updated);
    }

    #[tokio::test]
    async fn test_send_delta_stops_when_cancelled() {
        let tmp = TempDir::new().unwrap();
        let updated = vec![9u8; 4 * 1024 * 1024];
        let ctx = context(&tmp, "big.bin", &updated, 4096);
        let sig = compute_signature(Cursor::new(vec![0u8; 4096]), 1024).unwrap();

        let cancel = CancellationToken::new();
        let (tx, mut rx) = chunk_queue(1, cancel.clone());
        let job = tokio::spawn(send_delta(ctx, 0, sig, tx));
        assert!(rx.recv().await.is_some());
        cancel.cancel();

        assert!(matches!(job.await.unwrap(), JobOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_missing_source_is_file_error() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp, "gone.txt", b"x", 4);
        fs::remove_file(&ctx.sources[0]).unwrap();
        let (tx, _rx) = chunk_queue(4, CancellationToken::new());

        match send_full(ctx, 0, tx).await {
            JobOutcome::Failed(err) => {
                assert_eq!(err.path, "gone.txt");
                assert_eq!(err.kind, FileErrorKind::Io);
            }
            _ => panic!("expected a per-file failure"),
        }
    }

    #[test]
    fn test_check_request_rules() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp, "a.txt", b"abc", 4);
        let mut requested = HashSet::new();

        let request = Frame::new(MessageKind::FileData, 0, bytes::Bytes::new());
        assert!(check_request(&ctx, &mut requested, &request, true).is_ok());
        assert!(matches!(
            check_request(&ctx, &mut requested, &request, true),
            Err(Error::Protocol(_))
        ));

        let out_of_range = Frame::new(MessageKind::FileData, 9, bytes::Bytes::new());
        assert!(matches!(
            check_request(&ctx, &mut requested, &out_of_range, true),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_signature_buffer_is_capped() {
        let mut partial = HashMap::new();
        let half = bytes::Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE as usize / 2]);
        let frame = Frame::new(MessageKind::Signature, 3, half);

        buffer_signature(&mut partial, &frame).unwrap();
        buffer_signature(&mut partial, &frame).unwrap();
        let overflow = Frame::new(MessageKind::Signature, 3, bytes::Bytes::from_static(b"x"));
        assert!(matches!(
            buffer_signature(&mut partial, &overflow),
            Err(Error::Protocol(_))
        ));

        // Other ids have their own budget
        let other = Frame::new(MessageKind::Signature, 4, bytes::Bytes::from_static(b"x"));
        assert!(buffer_signature(&mut partial, &other).is_ok());
    }
}
