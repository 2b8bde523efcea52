//! Receiving side of a session.
//!
//! After the manifest arrives, three tasks run against one connection:
//!
//! - the planner walks the manifest in order, materializes directories,
//!   symlinks and empty files, and requests content for everything else
//!   (a signature when a usable local copy exists, a full transfer otherwise);
//! - the demultiplexer rebuilds files from the sender's answers;
//! - the writer drains the planner's requests onto the connection.

use crate::config::SessionConfig;
use crate::delta::compute_signature;
use crate::error::{Error, FileError, FileErrorKind, Result};
use crate::streaming::channel::{chunk_queue, Chunk, ChunkSender, SessionReport};
use crate::streaming::manifest::{read_manifest, FileInfo};
use crate::streaming::mux::{notify_peer, primary_error, run_writer, WorkerPool};
use crate::streaming::protocol::{negotiate_server, MessageKind};
use crate::streaming::reconstruct::{Demux, RequestTable};
use anyhow::Context;
use filetime::FileTime;
use std::collections::HashSet;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio_util::sync::CancellationToken;

// =============================================================================
// Path safety
// =============================================================================

/// Validate that a relative path is safe and doesn't escape the root.
/// Returns the full path if valid.
fn validate_path(root: &Path, relative: &str) -> anyhow::Result<PathBuf> {
    if relative.is_empty() {
        anyhow::bail!("Empty path not allowed");
    }

    let rel_path = Path::new(relative);
    if rel_path.is_absolute() {
        anyhow::bail!("Absolute paths not allowed: {}", relative);
    }

    for component in rel_path.components() {
        match component {
            Component::ParentDir => {
                anyhow::bail!("Path traversal not allowed: {}", relative);
            }
            Component::Prefix(_) | Component::RootDir => {
                anyhow::bail!("Rooted paths not allowed: {}", relative);
            }
            _ => {}
        }
    }

    let full = root.join(rel_path);
    if !normalize_path(&full).starts_with(normalize_path(root)) {
        anyhow::bail!("Path escapes root directory: {}", relative);
    }

    Ok(full)
}

/// Normalize a path without requiring it to exist (unlike canonicalize)
fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            c => normalized.push(c),
        }
    }
    normalized
}

/// Symlink targets must be relative and resolve inside the root.
fn validate_symlink_target(root: &Path, link_path: &Path, target: &str) -> anyhow::Result<()> {
    let target_path = Path::new(target);

    if target.is_empty() {
        anyhow::bail!("Empty symlink target: {}", link_path.display());
    }
    if target_path.is_absolute() || target_path.has_root() {
        anyhow::bail!(
            "Absolute symlink targets not allowed: {} -> {}",
            link_path.display(),
            target
        );
    }

    if let Some(link_parent) = link_path.parent() {
        let resolved = normalize_path(&link_parent.join(target_path));
        if !resolved.starts_with(normalize_path(root)) {
            anyhow::bail!(
                "Symlink target escapes root: {} -> {}",
                link_path.display(),
                target
            );
        }
    }

    Ok(())
}

/// Writing through a symlinked ancestor would land outside the tree the
/// manifest describes.
async fn check_no_symlink_ancestors(root: &Path, full: &Path) -> anyhow::Result<()> {
    let Ok(rel) = full.strip_prefix(root) else {
        anyhow::bail!("{} is not under {}", full.display(), root.display());
    };
    let mut current = root.to_path_buf();
    let mut components = rel.components().peekable();
    while let Some(component) = components.next() {
        if components.peek().is_none() {
            break;
        }
        current.push(component);
        match fs::symlink_metadata(&current).await {
            Ok(meta) if meta.file_type().is_symlink() => {
                anyhow::bail!("Parent {} is a symlink", current.display());
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => break,
            Err(e) => {
                return Err(e).with_context(|| format!("Cannot stat {}", current.display()));
            }
        }
    }
    Ok(())
}

// =============================================================================
// Session
// =============================================================================

/// Receive a tree into `root` over `conn`.
///
/// Per-file failures are collected in the returned report; only fatal
/// errors end the session early.
pub async fn receive_files<S>(
    mut conn: S,
    root: &Path,
    config: &SessionConfig,
) -> Result<SessionReport>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    config.validate().map_err(Error::local)?;

    let version = negotiate_server(&mut conn, config.max_version()).await?;
    let (rd, wr) = tokio::io::split(conn);
    let mut reader = BufReader::new(rd);
    let mut writer = BufWriter::new(wr);

    let prepared = async {
        let files = read_manifest(&mut reader).await?;
        tracing::info!(files = files.len(), version = %version, "manifest received");
        fs::create_dir_all(root)
            .await
            .with_context(|| format!("Cannot create target root {}", root.display()))
            .map_err(Error::local)?;
        Ok::<_, Error>(files)
    };
    let files = match prepared.await {
        Ok(files) => Arc::new(files),
        Err(err) => {
            notify_peer(&mut writer, &err).await;
            return Err(err);
        }
    };

    let mut report = SessionReport::new(version.get());

    if config.delete_extraneous {
        let (deleted, errors) = delete_extraneous(root, &files).await;
        report.files_deleted = deleted;
        for err in errors {
            report.record_error(err);
        }
    }

    let cancel = CancellationToken::new();
    let (chunks, rx) = chunk_queue(config.queue_depth, cancel.clone());
    let requests = RequestTable::default();
    let planner = Planner {
        root: root.to_path_buf(),
        files: files.clone(),
        block_len: config.block_len,
        chunk_size: config.chunk_size,
        requests: requests.clone(),
        outcome: PlanOutcome::default(),
    };
    let demux = Demux::new(root.to_path_buf(), files.clone(), requests.clone());

    let plan = async {
        let planned = planner.run(chunks, config.workers).await;
        if planned.is_err() {
            cancel.cancel();
        }
        planned
    };
    let rebuild = async {
        let rebuilt = demux.run(&mut reader, &cancel).await;
        if rebuilt.is_err() {
            cancel.cancel();
        }
        rebuilt
    };
    let write = async {
        let written = run_writer(rx, &mut writer, cancel.clone()).await;
        if written.is_err() {
            cancel.cancel();
        }
        written
    };
    let (planned, rebuilt, written) = tokio::join!(plan, rebuild, write);

    let (plan, rebuilt) = match (planned, rebuilt, written) {
        (Ok(plan), Ok(rebuilt), Ok(_)) => (plan, rebuilt),
        (planned, rebuilt, written) => {
            let err = primary_error(
                rebuilt
                    .err()
                    .into_iter()
                    .chain(planned.err())
                    .chain(written.err()),
            )
            .unwrap_or(Error::Cancelled);
            notify_peer(&mut writer, &err).await;
            return Err(err);
        }
    };

    report.files_metadata = plan.metadata;
    report.files_skipped = plan.skipped;
    report.files_full = rebuilt.files_full;
    report.files_delta = rebuilt.files_delta;
    report.bytes_literal = rebuilt.bytes_literal;
    for err in plan.errors.into_iter().chain(rebuilt.errors) {
        report.record_error(err);
    }
    for id in requests.ids() {
        if !rebuilt.settled.contains(&id) {
            report.record_error(FileError::new(
                files[id as usize].path.clone(),
                FileErrorKind::Incomplete,
                "sender did not deliver the requested content",
            ));
        }
    }

    apply_dir_metadata(&plan.dirs).await;

    tracing::info!(
        full = report.files_full,
        delta = report.files_delta,
        skipped = report.files_skipped,
        deleted = report.files_deleted,
        errors = report.errors.len(),
        "receive complete"
    );
    Ok(report)
}

// =============================================================================
// Planner
// =============================================================================

#[derive(Debug, Default)]
struct PlanOutcome {
    metadata: u64,
    skipped: u64,
    errors: Vec<FileError>,
    /// Directories to stamp once every transfer is done.
    dirs: Vec<(PathBuf, FileInfo)>,
}

struct Planner {
    root: PathBuf,
    files: Arc<Vec<FileInfo>>,
    block_len: u32,
    chunk_size: usize,
    requests: RequestTable,
    outcome: PlanOutcome,
}

/// What to do about one regular file.
enum Plan {
    Skip,
    WriteEmpty,
    RequestFull,
    RequestDelta,
}

impl Planner {
    /// Plan every entry, then wait for signature jobs. Dropping `chunks` at
    /// the end closes the request side of the exchange.
    async fn run(mut self, chunks: ChunkSender, workers: usize) -> Result<PlanOutcome> {
        let cancel = chunks.cancel_token().clone();
        let mut pool: WorkerPool<Result<()>> = WorkerPool::new(workers, cancel.clone());

        let files = self.files.clone();
        let planned = async {
            for (idx, info) in files.iter().enumerate() {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                self.plan_entry(idx as u32, info, &chunks, &mut pool).await?;
            }
            Ok(())
        };
        let planned: Result<()> = planned.await;
        if planned.is_err() {
            cancel.cancel();
        }

        let jobs = pool.join().await;
        drop(chunks);
        planned?;
        jobs.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(self.outcome)
    }

    fn fail(&mut self, info: &FileInfo, kind: FileErrorKind, err: anyhow::Error) {
        self.outcome
            .errors
            .push(FileError::from_anyhow(info.path.clone(), kind, &err));
    }

    async fn plan_entry(
        &mut self,
        id: u32,
        info: &FileInfo,
        chunks: &ChunkSender,
        pool: &mut WorkerPool<Result<()>>,
    ) -> Result<()> {
        let target = match validate_path(&self.root, &info.path) {
            Ok(target) => target,
            Err(e) => {
                self.fail(info, FileErrorKind::UnsafePath, e);
                return Ok(());
            }
        };
        if let Err(e) = check_no_symlink_ancestors(&self.root, &target).await {
            self.fail(info, FileErrorKind::UnsafePath, e);
            return Ok(());
        }

        if info.is_dir() {
            match ensure_dir(&target).await {
                Ok(()) => {
                    self.outcome.metadata += 1;
                    self.outcome.dirs.push((target, info.clone()));
                }
                Err(e) => self.fail(info, FileErrorKind::Io, e),
            }
            return Ok(());
        }

        if info.is_symlink() {
            let link = info.link.as_deref().unwrap_or_default();
            if let Err(e) = validate_symlink_target(&self.root, &target, link) {
                self.fail(info, FileErrorKind::UnsafePath, e);
                return Ok(());
            }
            match make_symlink(&target, link, info.mtime()).await {
                Ok(()) => self.outcome.metadata += 1,
                Err(e) => self.fail(info, FileErrorKind::Io, e),
            }
            return Ok(());
        }

        let plan = match plan_regular(&target, info).await {
            Ok(plan) => plan,
            Err(e) => {
                self.fail(info, FileErrorKind::Io, e);
                return Ok(());
            }
        };

        match plan {
            Plan::Skip => {
                tracing::debug!(path = %info.path, "up to date");
                self.outcome.skipped += 1;
            }
            Plan::WriteEmpty => match write_empty(&target, info).await {
                Ok(()) => self.outcome.metadata += 1,
                Err(e) => self.fail(info, FileErrorKind::Io, e),
            },
            Plan::RequestFull => {
                tracing::debug!(id, path = %info.path, "requesting full content");
                self.requests.record(id, MessageKind::FileData);
                chunks
                    .send(Chunk::terminator(MessageKind::FileData, id))
                    .await?;
            }
            Plan::RequestDelta => {
                tracing::debug!(id, path = %info.path, "requesting delta");
                self.requests.record(id, MessageKind::Delta);
                pool.spawn(send_signature(
                    target,
                    id,
                    self.block_len,
                    self.chunk_size,
                    chunks.clone(),
                    self.requests.clone(),
                ))
                .await?;
            }
        }
        Ok(())
    }
}

/// Decide how to bring a regular file up to date. Clears a local entry of
/// the wrong type and creates missing parent directories.
async fn plan_regular(target: &Path, info: &FileInfo) -> anyhow::Result<Plan> {
    let existing = match fs::symlink_metadata(target).await {
        Ok(meta) if meta.file_type().is_file() => Some(meta),
        Ok(meta) => {
            remove_entry(target, &meta).await?;
            None
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(e).context("Cannot stat target"),
    };

    let Some(meta) = existing else {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Cannot create parent directory")?;
        }
        return Ok(if info.size == 0 {
            Plan::WriteEmpty
        } else {
            Plan::RequestFull
        });
    };

    if meta.len() == info.size && FileTime::from_last_modification_time(&meta) == info.mtime() {
        fix_permissions(target, &meta, info).await;
        return Ok(Plan::Skip);
    }
    if info.size == 0 {
        return Ok(Plan::WriteEmpty);
    }
    if meta.len() == 0 {
        return Ok(Plan::RequestFull);
    }
    Ok(Plan::RequestDelta)
}

/// Sign the local copy and send the signature. Falls back to a full
/// request when the local copy cannot be read.
async fn send_signature(
    target: PathBuf,
    id: u32,
    block_len: u32,
    chunk_size: usize,
    chunks: ChunkSender,
    requests: RequestTable,
) -> Result<()> {
    let path = target.clone();
    let signed = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        let file = std::fs::File::open(&path).context("Cannot open base file")?;
        Ok(compute_signature(std::io::BufReader::new(file), block_len)?)
    })
    .await
    .context("Signature task failed")
    .and_then(|signed| signed);

    match signed {
        Ok(sig) => {
            let mut out = chunks.writer(MessageKind::Signature, id, chunk_size);
            out.write(&sig.encode()).await?;
            out.finish().await?;
        }
        Err(e) => {
            tracing::warn!(
                "Cannot sign {}, requesting full content: {:#}",
                target.display(),
                e
            );
            requests.record(id, MessageKind::FileData);
            chunks
                .send(Chunk::terminator(MessageKind::FileData, id))
                .await?;
        }
    }
    Ok(())
}

// =============================================================================
// Filesystem steps
// =============================================================================

async fn remove_entry(path: &Path, meta: &std::fs::Metadata) -> anyhow::Result<()> {
    let removed = if meta.is_dir() {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_file(path).await
    };
    removed.with_context(|| format!("Cannot remove {}", path.display()))
}

/// Directories stay owner-writable until [`apply_dir_metadata`] stamps the
/// manifest bits, so a read-only directory from an earlier push still
/// accepts new children.
async fn ensure_dir(target: &Path) -> anyhow::Result<()> {
    match fs::symlink_metadata(target).await {
        Ok(meta) if meta.is_dir() => return make_writable(target, &meta).await,
        Ok(meta) => remove_entry(target, &meta).await?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).context("Cannot stat target"),
    }
    fs::create_dir_all(target)
        .await
        .context("Cannot create directory")
}

async fn make_writable(dir: &Path, meta: &std::fs::Metadata) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = meta.permissions().mode() & 0o7777;
        if mode & 0o700 != 0o700 {
            let perms = std::fs::Permissions::from_mode(mode | 0o700);
            fs::set_permissions(dir, perms)
                .await
                .with_context(|| format!("Cannot make {} writable", dir.display()))?;
        }
    }
    #[cfg(not(unix))]
    let _ = (dir, meta);
    Ok(())
}

async fn make_symlink(target: &Path, link: &str, mtime: FileTime) -> anyhow::Result<()> {
    match fs::symlink_metadata(target).await {
        Ok(meta) => remove_entry(target, &meta).await?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).context("Cannot stat target"),
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .await
            .context("Cannot create parent directory")?;
    }

    #[cfg(unix)]
    fs::symlink(link, target)
        .await
        .context("Cannot create symlink")?;

    #[cfg(windows)]
    tokio::task::spawn_blocking({
        let link = link.to_string();
        let path = target.to_path_buf();
        move || std::os::windows::fs::symlink_file(&link, &path)
    })
    .await
    .context("Symlink task failed")?
    .context("Cannot create symlink")?;

    if let Err(e) = filetime::set_symlink_file_times(target, mtime, mtime) {
        tracing::warn!("Failed to set mtime on {}: {}", target.display(), e);
    }
    Ok(())
}

async fn write_empty(target: &Path, info: &FileInfo) -> anyhow::Result<()> {
    fs::File::create(target)
        .await
        .context("Cannot create empty file")?;
    set_permissions(target, info).await;
    if let Err(e) = filetime::set_file_mtime(target, info.mtime()) {
        tracing::warn!("Failed to set mtime on {}: {}", target.display(), e);
    }
    Ok(())
}

async fn set_permissions(path: &Path, info: &FileInfo) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(info.mode.perm());
        if let Err(e) = fs::set_permissions(path, perms).await {
            tracing::warn!("Failed to set permissions on {}: {}", path.display(), e);
        }
    }
    #[cfg(not(unix))]
    let _ = (path, info);
}

/// An up-to-date file may still carry stale permission bits.
async fn fix_permissions(path: &Path, meta: &std::fs::Metadata, info: &FileInfo) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o7777 != info.mode.perm() {
            set_permissions(path, info).await;
        }
    }
    #[cfg(not(unix))]
    let _ = (path, meta, info);
}

/// Deepest directories first so a read-only parent is stamped last.
async fn apply_dir_metadata(dirs: &[(PathBuf, FileInfo)]) {
    for (path, info) in dirs.iter().rev() {
        set_permissions(path, info).await;
        if let Err(e) = filetime::set_file_mtime(path, info.mtime()) {
            tracing::warn!("Failed to set mtime on {}: {}", path.display(), e);
        }
    }
}

// =============================================================================
// Extraneous deletion
// =============================================================================

/// Remove every entry under `root` that the manifest neither names nor
/// needs as an ancestor. Returns the number of entries removed.
async fn delete_extraneous(root: &Path, files: &Arc<Vec<FileInfo>>) -> (u64, Vec<FileError>) {
    let mut keep: HashSet<String> = HashSet::new();
    for info in files.iter() {
        let mut prefix = info.path.as_str();
        keep.insert(prefix.to_string());
        while let Some((parent, _)) = prefix.rsplit_once('/') {
            if !keep.insert(parent.to_string()) {
                break;
            }
            prefix = parent;
        }
    }

    let root = root.to_path_buf();
    let swept = tokio::task::spawn_blocking(move || {
        let mut sweep = Sweep {
            keep,
            deleted: 0,
            errors: Vec::new(),
        };
        sweep.visit(&root, "");
        (sweep.deleted, sweep.errors)
    })
    .await;

    match swept {
        Ok(result) => result,
        Err(e) => (
            0,
            vec![FileError::new(".", FileErrorKind::Io, format!("Deletion task failed: {}", e))],
        ),
    }
}

struct Sweep {
    keep: HashSet<String>,
    deleted: u64,
    errors: Vec<FileError>,
}

impl Sweep {
    fn visit(&mut self, dir: &Path, prefix: &str) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                let path = if prefix.is_empty() { "." } else { prefix };
                self.errors.push(FileError::new(path, FileErrorKind::Io, e));
                return;
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    self.errors
                        .push(FileError::new(prefix, FileErrorKind::Io, e));
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let relative = if prefix.is_empty() {
                name
            } else {
                format!("{}/{}", prefix, name)
            };
            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(e) => {
                    self.errors
                        .push(FileError::new(relative, FileErrorKind::Io, e));
                    continue;
                }
            };

            if self.keep.contains(&relative) {
                if file_type.is_dir() {
                    self.visit(&path, &relative);
                }
                continue;
            }

            let removed = if file_type.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match removed {
                Ok(()) => {
                    tracing::debug!(path = %relative, "removed extraneous entry");
                    self.deleted += 1;
                }
                Err(e) => self
                    .errors
                    .push(FileError::new(relative, FileErrorKind::Io, e)),
            }
        }
    }
}
