//! Local enumeration for the sending side.
//!
//! An enumerator reports every local entry once, with the path to read it
//! from and the path it should have on the receiver. The generator turns
//! those reports into the manifest; entries that cannot be described are
//! recorded as per-file errors and left out.

use crate::error::{FileError, FileErrorKind};
use crate::streaming::manifest::FileInfo;
use anyhow::{Context, Result};
use std::fs::Metadata;
use std::io;
use std::path::{Component, Path, PathBuf};

/// One entry reported by an enumerator.
#[derive(Debug)]
pub struct WalkEntry {
    /// Where to read the entry locally.
    pub source: PathBuf,
    /// Destination-relative path, forward-slash separated.
    pub relative: String,
    /// `symlink_metadata` of `source`, or the walk error for this entry.
    pub metadata: io::Result<Metadata>,
}

/// Source of the entries to send.
///
/// Implemented for closures taking the visitor, so callers can feed any
/// file list without a walker.
pub trait FileEnumerator {
    fn for_each(&mut self, visit: &mut dyn FnMut(WalkEntry)) -> Result<()>;
}

impl<F> FileEnumerator for F
where
    F: FnMut(&mut dyn FnMut(WalkEntry)) -> Result<()>,
{
    fn for_each(&mut self, visit: &mut dyn FnMut(WalkEntry)) -> Result<()> {
        self(visit)
    }
}

/// Walks a directory tree: hidden files included, ignore files not
/// consulted, symlinks reported rather than followed.
#[derive(Debug, Clone)]
pub struct DirEnumerator {
    root: PathBuf,
}

impl DirEnumerator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl FileEnumerator for DirEnumerator {
    fn for_each(&mut self, visit: &mut dyn FnMut(WalkEntry)) -> Result<()> {
        let meta = std::fs::metadata(&self.root)
            .with_context(|| format!("Cannot read source root {}", self.root.display()))?;
        if !meta.is_dir() {
            anyhow::bail!("Source root {} is not a directory", self.root.display());
        }

        let walker = ignore::WalkBuilder::new(&self.root)
            .standard_filters(false)
            .follow_links(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .build();

        for result in walker {
            match result {
                Ok(entry) => {
                    if entry.depth() == 0 {
                        continue;
                    }
                    let source = entry.path().to_path_buf();
                    let (relative, metadata) = match relative_slash_path(&self.root, &source) {
                        Some(relative) => (relative, entry.metadata().map_err(io::Error::other)),
                        None => (
                            source.to_string_lossy().into_owned(),
                            Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "path is not valid UTF-8",
                            )),
                        ),
                    };
                    visit(WalkEntry {
                        source,
                        relative,
                        metadata,
                    });
                }
                Err(err) => match walk_error_path(&err) {
                    Some(path) => {
                        let source = path.to_path_buf();
                        let relative = relative_slash_path(&self.root, &source)
                            .unwrap_or_else(|| source.to_string_lossy().into_owned());
                        visit(WalkEntry {
                            source,
                            relative,
                            metadata: Err(io::Error::other(err.to_string())),
                        });
                    }
                    None => tracing::warn!("Walk error under {}: {}", self.root.display(), err),
                },
            }
        }
        Ok(())
    }
}

/// `path` relative to `root`, joined with '/'. `None` when not under root
/// or not valid UTF-8.
fn relative_slash_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts = rel
        .components()
        .map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}

fn walk_error_path(err: &ignore::Error) -> Option<&Path> {
    match err {
        ignore::Error::WithPath { path, .. } => Some(path),
        ignore::Error::WithDepth { err, .. } | ignore::Error::WithLineNumber { err, .. } => {
            walk_error_path(err)
        }
        ignore::Error::Loop { child, .. } => Some(child),
        _ => None,
    }
}

// =============================================================================
// Manifest generation
// =============================================================================

/// The manifest plus what the sender needs to serve requests for it.
#[derive(Debug, Default)]
pub struct LocalManifest {
    /// Records in stream-id order.
    pub files: Vec<FileInfo>,
    /// Local source of each record, same order.
    pub sources: Vec<PathBuf>,
    /// Entries left out of the manifest.
    pub errors: Vec<FileError>,
}

impl LocalManifest {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Run the enumerator to completion and describe every entry.
///
/// Blocking: call from `spawn_blocking`.
pub fn generate_manifest<E>(enumerator: &mut E) -> Result<LocalManifest>
where
    E: FileEnumerator + ?Sized,
{
    let mut manifest = LocalManifest::default();
    enumerator.for_each(&mut |entry| describe(entry, &mut manifest))?;
    Ok(manifest)
}

fn describe(entry: WalkEntry, manifest: &mut LocalManifest) {
    let WalkEntry {
        source,
        relative,
        metadata,
    } = entry;

    if relative.is_empty() {
        return;
    }

    let meta = match metadata {
        Ok(meta) => meta,
        Err(e) => {
            manifest
                .errors
                .push(FileError::new(relative, FileErrorKind::Walk, e));
            return;
        }
    };

    let link = if meta.file_type().is_symlink() {
        match read_link_utf8(&source) {
            Ok(target) => Some(target),
            Err(e) => {
                manifest
                    .errors
                    .push(FileError::from_anyhow(relative, FileErrorKind::Io, &e));
                return;
            }
        }
    } else {
        None
    };

    match FileInfo::from_metadata(relative.clone(), &meta, link) {
        Some(info) => {
            manifest.files.push(info);
            manifest.sources.push(source);
        }
        None => manifest.errors.push(FileError::new(
            relative,
            FileErrorKind::Unsupported,
            format!("unsupported file type {:?}", meta.file_type()),
        )),
    }
}

fn read_link_utf8(path: &Path) -> Result<String> {
    let target = std::fs::read_link(path).context("Cannot read link")?;
    target
        .into_os_string()
        .into_string()
        .map_err(|t| anyhow::anyhow!("Link target {:?} is not valid UTF-8", t))
}
