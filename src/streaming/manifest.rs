//! File list exchanged before any payload.
//!
//! Record (all integers big-endian):
//!
//! ```text
//! path_len:u32 | path | size:u64 | mode:u32 | mtime_secs:i64 | mtime_nanos:u32
//!   [ link_len:u32 | link ]   -- only when mode has the symlink bit
//! ```
//!
//! The list ends with a zero `path_len`, which is why empty paths are
//! rejected on both sides.

use crate::error::{Error, Result};
use bytes::{BufMut, BytesMut};
use filetime::FileTime;
use std::fmt;
use std::fs::Metadata;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest path or link target carried by a record (64KB).
pub const MAX_STRING_LEN: usize = 64 * 1024;

/// Permission bits of a mode (rwx for ugo plus setuid/setgid/sticky).
pub const PERM_MASK: u32 = 0o7777;

const NANOS_PER_SEC: u32 = 1_000_000_000;

/// Records are written in batches of this size to reduce syscalls.
const MANIFEST_BATCH_SIZE: usize = 64 * 1024;

// =============================================================================
// File Mode
// =============================================================================

bitflags::bitflags! {
    /// Type bits of a packed mode. Neither bit set means a regular file.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ModeType: u32 {
        const DIR = 1 << 16;
        const SYMLINK = 1 << 17;
    }
}

/// Packed type + permission bits, version 1 layout.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileMode(u32);

impl FileMode {
    pub fn regular(perm: u32) -> Self {
        Self(perm & PERM_MASK)
    }

    pub fn dir(perm: u32) -> Self {
        Self(ModeType::DIR.bits() | (perm & PERM_MASK))
    }

    pub fn symlink(perm: u32) -> Self {
        Self(ModeType::SYMLINK.bits() | (perm & PERM_MASK))
    }

    /// Validate a mode read off the wire.
    pub fn from_bits(bits: u32) -> Result<Self> {
        let kind = ModeType::from_bits(bits & !PERM_MASK)
            .ok_or_else(|| Error::manifest(format!("unknown mode bits {:#010x}", bits)))?;
        if kind.contains(ModeType::DIR | ModeType::SYMLINK) {
            return Err(Error::manifest(format!(
                "mode {:#010x} is both directory and symlink",
                bits
            )));
        }
        Ok(Self(bits))
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn perm(self) -> u32 {
        self.0 & PERM_MASK
    }

    pub fn kind(self) -> ModeType {
        ModeType::from_bits_truncate(self.0)
    }

    pub fn is_dir(self) -> bool {
        self.kind().contains(ModeType::DIR)
    }

    pub fn is_symlink(self) -> bool {
        self.kind().contains(ModeType::SYMLINK)
    }

    pub fn is_regular(self) -> bool {
        self.kind().is_empty()
    }
}

impl fmt::Debug for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_dir() {
            "dir"
        } else if self.is_symlink() {
            "symlink"
        } else {
            "file"
        };
        write!(f, "FileMode({} {:04o})", kind, self.perm())
    }
}

// =============================================================================
// File Info
// =============================================================================

/// One manifest record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Relative, forward-slash separated, non-empty.
    pub path: String,
    /// Byte count; 0 for directories and symlinks.
    pub size: u64,
    pub mode: FileMode,
    pub mtime_secs: i64,
    pub mtime_nanos: u32,
    /// Symlink target, present iff `mode` is a symlink.
    pub link: Option<String>,
}

impl FileInfo {
    /// Describe a local entry from its `symlink_metadata`.
    ///
    /// Returns `None` for types the protocol does not carry (devices,
    /// sockets, fifos).
    pub fn from_metadata(path: String, meta: &Metadata, link: Option<String>) -> Option<Self> {
        let mtime = FileTime::from_last_modification_time(meta);
        let perm = permission_bits(meta);
        let file_type = meta.file_type();

        let (mode, size, link) = if file_type.is_symlink() {
            (FileMode::symlink(perm), 0, Some(link.unwrap_or_default()))
        } else if file_type.is_dir() {
            (FileMode::dir(perm), 0, None)
        } else if file_type.is_file() {
            (FileMode::regular(perm), meta.len(), None)
        } else {
            return None;
        };

        Some(Self {
            path,
            size,
            mode,
            mtime_secs: mtime.unix_seconds(),
            mtime_nanos: mtime.nanoseconds(),
            link,
        })
    }

    pub fn is_dir(&self) -> bool {
        self.mode.is_dir()
    }

    pub fn is_symlink(&self) -> bool {
        self.mode.is_symlink()
    }

    pub fn is_regular(&self) -> bool {
        self.mode.is_regular()
    }

    pub fn mtime(&self) -> FileTime {
        FileTime::from_unix_time(self.mtime_secs, self.mtime_nanos)
    }

    fn validate(&self) -> Result<()> {
        if self.path.is_empty() {
            return Err(Error::manifest("empty path"));
        }
        if self.path.len() > MAX_STRING_LEN {
            return Err(Error::manifest(format!(
                "path of {} bytes exceeds {}",
                self.path.len(),
                MAX_STRING_LEN
            )));
        }
        if self.mtime_nanos >= NANOS_PER_SEC {
            return Err(Error::manifest(format!(
                "{}: nanoseconds {} out of range",
                self.path, self.mtime_nanos
            )));
        }
        match (&self.link, self.is_symlink()) {
            (Some(link), true) if link.len() > MAX_STRING_LEN => Err(Error::manifest(format!(
                "{}: link target of {} bytes exceeds {}",
                self.path,
                link.len(),
                MAX_STRING_LEN
            ))),
            (Some(_), true) | (None, false) => Ok(()),
            (None, true) => Err(Error::manifest(format!(
                "{}: symlink without target",
                self.path
            ))),
            (Some(_), false) => Err(Error::manifest(format!(
                "{}: link target on a non-symlink",
                self.path
            ))),
        }
    }

    /// Append the encoded record to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        self.validate()?;
        buf.put_u32(self.path.len() as u32);
        buf.put_slice(self.path.as_bytes());
        buf.put_u64(self.size);
        buf.put_u32(self.mode.bits());
        buf.put_i64(self.mtime_secs);
        buf.put_u32(self.mtime_nanos);
        if let Some(link) = &self.link {
            buf.put_u32(link.len() as u32);
            buf.put_slice(link.as_bytes());
        }
        Ok(())
    }
}

#[cfg(unix)]
fn permission_bits(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & PERM_MASK
}

#[cfg(not(unix))]
fn permission_bits(meta: &Metadata) -> u32 {
    match (meta.is_dir(), meta.permissions().readonly()) {
        (true, _) => 0o755,
        (false, true) => 0o444,
        (false, false) => 0o644,
    }
}

// =============================================================================
// Manifest reading/writing
// =============================================================================

/// Write every record followed by the sentinel, then flush.
pub async fn write_manifest<W>(w: &mut W, files: &[FileInfo]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = BytesMut::with_capacity(MANIFEST_BATCH_SIZE);
    for info in files {
        info.encode_into(&mut batch)?;
        if batch.len() >= MANIFEST_BATCH_SIZE {
            w.write_all(&batch.split()).await?;
        }
    }
    batch.put_u32(0);
    w.write_all(&batch).await?;
    w.flush().await?;
    Ok(())
}

/// Read one record, or `None` at the sentinel.
pub async fn read_entry<R>(r: &mut R) -> Result<Option<FileInfo>>
where
    R: AsyncRead + Unpin,
{
    let path_len = r.read_u32().await? as usize;
    if path_len == 0 {
        return Ok(None);
    }
    let path = read_string(r, path_len, "path").await?;

    let size = r.read_u64().await?;
    let mode = FileMode::from_bits(r.read_u32().await?)?;
    let mtime_secs = r.read_i64().await?;
    let mtime_nanos = r.read_u32().await?;
    if mtime_nanos >= NANOS_PER_SEC {
        return Err(Error::manifest(format!(
            "{}: nanoseconds {} out of range",
            path, mtime_nanos
        )));
    }

    let link = if mode.is_symlink() {
        let len = r.read_u32().await? as usize;
        Some(read_string(r, len, "link target").await?)
    } else {
        None
    };

    Ok(Some(FileInfo {
        path,
        size,
        mode,
        mtime_secs,
        mtime_nanos,
        link,
    }))
}

/// Read records up to and including the sentinel.
pub async fn read_manifest<R>(r: &mut R) -> Result<Vec<FileInfo>>
where
    R: AsyncRead + Unpin,
{
    let mut files = Vec::new();
    while let Some(info) = read_entry(r).await? {
        files.push(info);
    }
    Ok(files)
}

async fn read_string<R>(r: &mut R, len: usize, what: &str) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    if len > MAX_STRING_LEN {
        return Err(Error::manifest(format!(
            "{} length {} exceeds {}",
            what, len, MAX_STRING_LEN
        )));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| Error::manifest(format!("invalid UTF-8 in {}", what)))
}
