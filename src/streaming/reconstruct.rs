//! Receiving side demultiplexer.
//!
//! Frames from the sender arrive in whatever order the workers produced
//! them. Each stream id gets a reconstruction context on its first frame: a
//! temp file beside the target, plus a delta applier reading the current
//! target when the stream is a delta. The context is finalized when the
//! id's terminator arrives and the temp file replaces the target.

use crate::delta::DeltaApplier;
use crate::error::{Error, FileError, FileErrorKind, Result};
use crate::streaming::manifest::FileInfo;
use crate::streaming::protocol::{read_frame, ErrorMessage, Frame, MessageKind};
use anyhow::Context;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;

/// Prefix of in-flight temp files in the target tree.
pub const TEMP_PREFIX: &str = ".funcsync.";

// =============================================================================
// Request table
// =============================================================================

/// Ids the receiver asked for, with the message kind the answer must carry.
///
/// Shared between the planner, which records a request before sending it,
/// and the demultiplexer, which rejects answers nobody asked for.
#[derive(Debug, Clone, Default)]
pub(crate) struct RequestTable(Arc<Mutex<HashMap<u32, MessageKind>>>);

impl RequestTable {
    pub fn record(&self, id: u32, kind: MessageKind) {
        self.lock().insert(id, kind);
    }

    pub fn expected(&self, id: u32) -> Option<MessageKind> {
        self.lock().get(&id).copied()
    }

    /// Requested ids in ascending order.
    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, MessageKind>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// =============================================================================
// Reconstruction contexts
// =============================================================================

enum Reconstruction {
    Active(Box<ActiveStream>),
    /// Failed; later frames for the id are dropped until its terminator.
    Poisoned,
}

struct ActiveStream {
    out: BufWriter<File>,
    temp: TempPath,
    applier: Option<DeltaApplier<File>>,
    written: u64,
}

/// What the demultiplexer produced.
#[derive(Debug, Default)]
pub(crate) struct DemuxOutcome {
    pub files_full: u64,
    pub files_delta: u64,
    pub bytes_literal: u64,
    pub errors: Vec<FileError>,
    /// Ids whose stream reached a terminator or was accounted as failed.
    pub settled: HashSet<u32>,
}

pub(crate) struct Demux {
    root: PathBuf,
    files: Arc<Vec<FileInfo>>,
    requests: RequestTable,
    open: HashMap<u32, Reconstruction>,
    outcome: DemuxOutcome,
}

impl Demux {
    pub fn new(root: PathBuf, files: Arc<Vec<FileInfo>>, requests: RequestTable) -> Self {
        Self {
            root,
            files,
            requests,
            open: HashMap::new(),
            outcome: DemuxOutcome::default(),
        }
    }

    /// Consume frames until the sender's end-of-exchange.
    ///
    /// Streams still open at that point are reported as incomplete and their
    /// temp files discarded.
    pub async fn run<R>(
        mut self,
        reader: &mut R,
        cancel: &CancellationToken,
    ) -> Result<DemuxOutcome>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                frame = read_frame(&mut *reader) => frame?,
            };

            match frame.kind {
                MessageKind::EndOfExchange => break,
                MessageKind::Error => {
                    let msg = ErrorMessage::decode(frame.payload)?;
                    return Err(Error::Remote(msg.into()));
                }
                MessageKind::Signature => {
                    return Err(Error::protocol(format!(
                        "signature frame sent to receiver (id {})",
                        frame.id
                    )));
                }
                MessageKind::Delta | MessageKind::FileData => self.route(frame).await?,
            }
        }

        let mut leftover: Vec<(u32, Reconstruction)> = self.open.drain().collect();
        leftover.sort_unstable_by_key(|(id, _)| *id);
        for (id, ctx) in leftover {
            if let Reconstruction::Active(_) = ctx {
                let path = self.files[id as usize].path.clone();
                self.outcome.errors.push(FileError::new(
                    path,
                    FileErrorKind::Incomplete,
                    "stream ended without a terminator",
                ));
            }
            self.outcome.settled.insert(id);
        }
        Ok(self.outcome)
    }

    async fn route(&mut self, frame: Frame) -> Result<()> {
        let id = frame.id;
        let info = self.files.get(id as usize).ok_or_else(|| {
            Error::protocol(format!(
                "stream id {} out of range ({} files)",
                id,
                self.files.len()
            ))
        })?;
        if !info.is_regular() {
            return Err(Error::protocol(format!(
                "content for non-regular entry {} (id {})",
                info.path, id
            )));
        }
        match self.requests.expected(id) {
            Some(kind) if kind == frame.kind => {}
            Some(kind) => {
                return Err(Error::protocol(format!(
                    "{:?} frame for {} (id {}), expected {:?}",
                    frame.kind, info.path, id, kind
                )));
            }
            None => {
                return Err(Error::protocol(format!(
                    "unrequested {:?} frame for {} (id {})",
                    frame.kind, info.path, id
                )));
            }
        }
        if self.outcome.settled.contains(&id) {
            return Err(Error::protocol(format!(
                "frame for finished stream {} (id {})",
                info.path, id
            )));
        }

        let info = info.clone();
        let target = self.root.join(&info.path);

        if !self.open.contains_key(&id) {
            let ctx = match open_stream(&target, frame.kind).await {
                Ok(stream) => Reconstruction::Active(Box::new(stream)),
                Err(err) => {
                    self.outcome.errors.push(err.into_file_error(&info.path));
                    Reconstruction::Poisoned
                }
            };
            self.open.insert(id, ctx);
        }

        if !frame.payload.is_empty() {
            if let Some(Reconstruction::Active(stream)) = self.open.get_mut(&id) {
                if let Err(err) = stream.feed(&frame.payload).await {
                    tracing::debug!(id, path = %info.path, "stream poisoned");
                    self.outcome.errors.push(err.into_file_error(&info.path));
                    self.open.insert(id, Reconstruction::Poisoned);
                }
            }
            return Ok(());
        }

        // Terminator
        self.outcome.settled.insert(id);
        if let Some(Reconstruction::Active(stream)) = self.open.remove(&id) {
            match stream.finalize(&target, &info).await {
                Ok(Finalized { delta, literal }) => {
                    tracing::debug!(id, path = %info.path, delta, "file reconstructed");
                    if delta {
                        self.outcome.files_delta += 1;
                    } else {
                        self.outcome.files_full += 1;
                    }
                    self.outcome.bytes_literal += literal;
                }
                Err(err) => self.outcome.errors.push(err.into_file_error(&info.path)),
            }
        }
        Ok(())
    }
}

/// A per-file failure before it is tied to a manifest path.
struct StreamError {
    kind: FileErrorKind,
    err: anyhow::Error,
}

impl StreamError {
    fn new(kind: FileErrorKind, err: anyhow::Error) -> Self {
        Self { kind, err }
    }

    fn into_file_error(self, path: &str) -> FileError {
        FileError::from_anyhow(path, self.kind, &self.err)
    }
}

struct Finalized {
    delta: bool,
    literal: u64,
}

async fn open_stream(
    target: &Path,
    kind: MessageKind,
) -> std::result::Result<ActiveStream, StreamError> {
    let applier = if kind == MessageKind::Delta {
        let base = File::open(target)
            .await
            .context("Cannot open base file")
            .map_err(|e| StreamError::new(FileErrorKind::MissingBase, e))?;
        let base_len = base
            .metadata()
            .await
            .context("Cannot stat base file")
            .map_err(|e| StreamError::new(FileErrorKind::MissingBase, e))?
            .len();
        Some(DeltaApplier::new(base, base_len))
    } else {
        None
    };

    let (file, temp) = create_temp_beside(target)
        .await
        .map_err(|e| StreamError::new(FileErrorKind::Io, e))?;

    Ok(ActiveStream {
        out: BufWriter::new(file),
        temp,
        applier,
        written: 0,
    })
}

/// Temp file in the target's directory so the final rename stays on one
/// filesystem. Removed on drop unless persisted.
async fn create_temp_beside(target: &Path) -> anyhow::Result<(File, TempPath)> {
    let dir = target
        .parent()
        .map(Path::to_path_buf)
        .context("Target has no parent directory")?;
    let named = tokio::task::spawn_blocking(move || {
        tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&dir)
            .with_context(|| format!("Cannot create temp file in {}", dir.display()))
    })
    .await
    .context("Temp file task failed")??;
    let (file, temp) = named.into_parts();
    Ok((File::from_std(file), temp))
}

impl ActiveStream {
    async fn feed(&mut self, data: &[u8]) -> std::result::Result<(), StreamError> {
        match self.applier.as_mut() {
            Some(applier) => applier
                .feed(data, &mut self.out)
                .await
                .map_err(|e| StreamError::new(FileErrorKind::DeltaMismatch, e)),
            None => {
                self.out
                    .write_all(data)
                    .await
                    .context("Failed to write temp file")
                    .map_err(|e| StreamError::new(FileErrorKind::Io, e))?;
                self.written += data.len() as u64;
                Ok(())
            }
        }
    }

    /// Flush, then move the temp file over `target` with the manifest's
    /// permission bits and mtime.
    async fn finalize(
        self,
        target: &Path,
        info: &FileInfo,
    ) -> std::result::Result<Finalized, StreamError> {
        let ActiveStream {
            mut out,
            temp,
            applier,
            written,
        } = self;

        let (delta, literal) = match applier {
            Some(applier) => {
                let literal = applier.literal_bytes();
                applier
                    .finish()
                    .map_err(|e| StreamError::new(FileErrorKind::DeltaMismatch, e))?;
                (true, literal)
            }
            None => (false, written),
        };

        let synced = async {
            out.flush().await?;
            let file = out.into_inner();
            file.sync_all().await
        };
        synced
            .await
            .context("Failed to flush temp file")
            .map_err(|e| StreamError::new(FileErrorKind::Io, e))?;

        let target = target.to_path_buf();
        let mode = info.mode;
        let mtime = info.mtime();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(mode.perm());
                if let Err(e) = std::fs::set_permissions(&temp, perms) {
                    tracing::warn!("Failed to set permissions on {}: {}", target.display(), e);
                }
            }
            #[cfg(not(unix))]
            let _ = mode;

            temp.persist(&target)
                .with_context(|| format!("Failed to rename into {}", target.display()))?;

            if let Err(e) = filetime::set_file_mtime(&target, mtime) {
                tracing::warn!("Failed to set mtime on {}: {}", target.display(), e);
            }
            Ok(())
        })
        .await
        .map_err(|e| StreamError::new(FileErrorKind::Io, e.into()))?
        .map_err(|e| StreamError::new(FileErrorKind::Io, e))?;

        Ok(Finalized { delta, literal })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{compute_delta, compute_signature, encode_ops};
    use crate::streaming::manifest::FileMode;
    use crate::streaming::protocol::write_frame;
    use bytes::Bytes;
    use std::fs;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn regular(path: &str, size: u64) -> FileInfo {
        FileInfo {
            path: path.to_string(),
            size,
            mode: FileMode::regular(0o640),
            mtime_secs: 1_700_000_000,
            mtime_nanos: 250,
            link: None,
        }
    }

    async fn wire(frames: &[Frame]) -> Vec<u8> {
        let mut buf = Vec::new();
        for frame in frames {
            write_frame(&mut buf, frame).await.unwrap();
        }
        buf
    }

    fn data(kind: MessageKind, id: u32, payload: &'static [u8]) -> Frame {
        Frame::new(kind, id, Bytes::from_static(payload))
    }

    async fn run_demux(
        root: &Path,
        files: Vec<FileInfo>,
        requests: RequestTable,
        frames: &[Frame],
    ) -> Result<DemuxOutcome> {
        let bytes = wire(frames).await;
        let demux = Demux::new(root.to_path_buf(), Arc::new(files), requests);
        demux.run(&mut &bytes[..], &CancellationToken::new()).await
    }

    #[tokio::test]
    async fn test_interleaved_full_streams() {
        let tmp = TempDir::new().unwrap();
        let requests = RequestTable::default();
        requests.record(0, MessageKind::FileData);
        requests.record(1, MessageKind::FileData);

        let outcome = run_demux(
            tmp.path(),
            vec![regular("a.txt", 6), regular("b.txt", 3)],
            requests,
            &[
                data(MessageKind::FileData, 0, b"abc"),
                data(MessageKind::FileData, 1, b"xyz"),
                data(MessageKind::FileData, 0, b"def"),
                Frame::new(MessageKind::FileData, 1, Bytes::new()),
                Frame::new(MessageKind::FileData, 0, Bytes::new()),
                Frame::end_of_exchange(),
            ],
        )
        .await
        .unwrap();

        assert_eq!(outcome.files_full, 2);
        assert_eq!(outcome.bytes_literal, 9);
        assert!(outcome.errors.is_empty());
        assert_eq!(fs::read(tmp.path().join("a.txt")).unwrap(), b"abcdef");
        assert_eq!(fs::read(tmp.path().join("b.txt")).unwrap(), b"xyz");

        let meta = fs::metadata(tmp.path().join("a.txt")).unwrap();
        let mtime = filetime::FileTime::from_last_modification_time(&meta);
        assert_eq!(mtime.unix_seconds(), 1_700_000_000);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(meta.permissions().mode() & 0o7777, 0o640);
        }
    }

    #[tokio::test]
    async fn test_delta_stream_rebuilds_over_base() {
        let tmp = TempDir::new().unwrap();
        let base = b"0123456789abcdefghij".repeat(20);
        let mut updated = base.clone();
        updated.splice(50..50, b"0000000000".iter().copied());
        fs::write(tmp.path().join("doc"), &base).unwrap();

        let sig = compute_signature(Cursor::new(&base), 16).unwrap();
        let ops = compute_delta(&sig, Cursor::new(&updated)).unwrap();
        let encoded = encode_ops(&ops);
        let (head, tail) = encoded.split_at(encoded.len() / 2);

        let requests = RequestTable::default();
        requests.record(0, MessageKind::Delta);
        let outcome = run_demux(
            tmp.path(),
            vec![regular("doc", updated.len() as u64)],
            requests,
            &[
                Frame::new(MessageKind::Delta, 0, Bytes::copy_from_slice(head)),
                Frame::new(MessageKind::Delta, 0, Bytes::copy_from_slice(tail)),
                Frame::new(MessageKind::Delta, 0, Bytes::new()),
                Frame::end_of_exchange(),
            ],
        )
        .await
        .unwrap();

        assert_eq!(outcome.files_delta, 1);
        assert!(outcome.bytes_literal < updated.len() as u64);
        assert_eq!(fs::read(tmp.path().join("doc")).unwrap(), updated);
    }

    #[tokio::test]
    async fn test_missing_base_keeps_session_going() {
        let tmp = TempDir::new().unwrap();
        let requests = RequestTable::default();
        requests.record(0, MessageKind::Delta);
        requests.record(1, MessageKind::FileData);

        let outcome = run_demux(
            tmp.path(),
            vec![regular("gone", 4), regular("ok", 2)],
            requests,
            &[
                data(MessageKind::Delta, 0, b"\x01\x00\x00\x00\x01z"),
                data(MessageKind::FileData, 1, b"ok"),
                Frame::new(MessageKind::Delta, 0, Bytes::new()),
                Frame::new(MessageKind::FileData, 1, Bytes::new()),
                Frame::end_of_exchange(),
            ],
        )
        .await
        .unwrap();

        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].kind, FileErrorKind::MissingBase);
        assert_eq!(outcome.files_full, 1);
        assert!(!tmp.path().join("gone").exists());
    }

    #[tokio::test]
    async fn test_bad_delta_leaves_target_untouched() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("f"), b"original").unwrap();
        let requests = RequestTable::default();
        requests.record(0, MessageKind::Delta);

        // Copy past the end of the 8-byte base
        let bad = encode_ops(&[crate::delta::DeltaOp::Copy { offset: 4, len: 100 }]);
        let outcome = run_demux(
            tmp.path(),
            vec![regular("f", 100)],
            requests,
            &[
                Frame::new(MessageKind::Delta, 0, bad),
                Frame::new(MessageKind::Delta, 0, Bytes::new()),
                Frame::end_of_exchange(),
            ],
        )
        .await
        .unwrap();

        assert_eq!(outcome.errors[0].kind, FileErrorKind::DeltaMismatch);
        assert_eq!(fs::read(tmp.path().join("f")).unwrap(), b"original");
        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(TEMP_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_unterminated_stream_is_incomplete() {
        let tmp = TempDir::new().unwrap();
        let requests = RequestTable::default();
        requests.record(0, MessageKind::FileData);

        let outcome = run_demux(
            tmp.path(),
            vec![regular("half", 10)],
            requests,
            &[
                data(MessageKind::FileData, 0, b"part"),
                Frame::end_of_exchange(),
            ],
        )
        .await
        .unwrap();

        assert_eq!(outcome.errors[0].kind, FileErrorKind::Incomplete);
        assert!(outcome.settled.contains(&0));
        assert!(!tmp.path().join("half").exists());
    }

    #[tokio::test]
    async fn test_protocol_violations() {
        let tmp = TempDir::new().unwrap();
        let files = vec![regular("a", 1)];

        let out_of_range = run_demux(
            tmp.path(),
            files.clone(),
            RequestTable::default(),
            &[data(MessageKind::FileData, 7, b"x")],
        )
        .await;
        assert!(matches!(out_of_range, Err(Error::Protocol(_))));

        let unrequested = run_demux(
            tmp.path(),
            files.clone(),
            RequestTable::default(),
            &[data(MessageKind::FileData, 0, b"x")],
        )
        .await;
        assert!(matches!(unrequested, Err(Error::Protocol(_))));

        let requests = RequestTable::default();
        requests.record(0, MessageKind::FileData);
        let signature = run_demux(
            tmp.path(),
            files.clone(),
            requests.clone(),
            &[data(MessageKind::Signature, 0, b"x")],
        )
        .await;
        assert!(matches!(signature, Err(Error::Protocol(_))));

        let wrong_kind = run_demux(
            tmp.path(),
            files.clone(),
            requests.clone(),
            &[data(MessageKind::Delta, 0, b"x")],
        )
        .await;
        assert!(matches!(wrong_kind, Err(Error::Protocol(_))));

        let after_finish = run_demux(
            tmp.path(),
            files,
            requests,
            &[
                data(MessageKind::FileData, 0, b"x"),
                Frame::new(MessageKind::FileData, 0, Bytes::new()),
                data(MessageKind::FileData, 0, b"y"),
            ],
        )
        .await;
        assert!(matches!(after_finish, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_remote_error_and_eof() {
        let tmp = TempDir::new().unwrap();
        let remote = run_demux(
            tmp.path(),
            Vec::new(),
            RequestTable::default(),
            &[Frame::error(crate::streaming::protocol::SESSION_STREAM_ID, 3, "boom")],
        )
        .await;
        match remote {
            Err(Error::Remote(err)) => {
                assert_eq!(err.code, 3);
                assert_eq!(err.message, "boom");
            }
            other => panic!("expected remote error, got {:?}", other.map(|_| ())),
        }

        let eof = run_demux(tmp.path(), Vec::new(), RequestTable::default(), &[]).await;
        assert!(matches!(eof, Err(Error::Transport(_))));
    }
}
