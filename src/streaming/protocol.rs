//! Wire format for sync sessions.
//!
//! All multi-byte integers are big-endian.
//!
//! Preamble (both directions): `FUNCSYNC` | version:u16
//! Frame: type:u8 | id:u32 | len:u32 | payload
//! End of exchange: type:u8 only

use crate::error::{Error, RemoteError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Session preamble magic.
pub const MAGIC: &[u8; 8] = b"FUNCSYNC";

/// Maximum frame payload (64MB) - prevents OOM from malicious/corrupted frames
pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Stream id of errors that concern the whole session.
pub const SESSION_STREAM_ID: u32 = u32::MAX;

const PREAMBLE_LEN: usize = 8 + 2;
const HEADER_LEN: usize = 1 + 4 + 4;

// =============================================================================
// Protocol Version
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion(u16);

impl ProtocolVersion {
    pub const V1: Self = Self(1);

    /// Oldest version this build can speak.
    pub const MIN: Self = Self::V1;
    /// Newest version this build can speak.
    pub const MAX: Self = Self::V1;
    /// Version proposed by default.
    pub const CURRENT: Self = Self::MAX;

    pub const fn new(v: u16) -> Self {
        Self(v)
    }

    pub const fn get(self) -> u16 {
        self.0
    }

    pub fn is_supported(self) -> bool {
        self >= Self::MIN && self <= Self::MAX
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Message Kinds
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Signature = 0xF1,
    Delta = 0xF2,
    FileData = 0xF3,
    Error = 0xF4,
    EndOfExchange = 0xFE,
}

impl MessageKind {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0xF1 => Some(Self::Signature),
            0xF2 => Some(Self::Delta),
            0xF3 => Some(Self::FileData),
            0xF4 => Some(Self::Error),
            0xFE => Some(Self::EndOfExchange),
            _ => None,
        }
    }
}

// =============================================================================
// Frames
// =============================================================================

/// One framed message. `EndOfExchange` frames carry id 0 and no payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageKind,
    pub id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: MessageKind, id: u32, payload: Bytes) -> Self {
        Self { kind, id, payload }
    }

    pub fn end_of_exchange() -> Self {
        Self::new(MessageKind::EndOfExchange, 0, Bytes::new())
    }

    pub fn error(id: u32, code: u16, message: impl Into<String>) -> Self {
        let msg = ErrorMessage {
            code,
            message: message.into(),
        };
        Self::new(MessageKind::Error, id, msg.encode())
    }

    /// An empty payload ends the stream for `id`.
    pub fn is_terminator(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Read a single frame from the stream.
///
/// EOF anywhere is a transport error: a session always ends with an
/// explicit end-of-exchange or error frame.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame> {
    let tag = r.read_u8().await?;
    let kind = MessageKind::from_u8(tag)
        .ok_or_else(|| Error::protocol(format!("unknown message type {:#04x}", tag)))?;

    if kind == MessageKind::EndOfExchange {
        return Ok(Frame::end_of_exchange());
    }

    let id = r.read_u32().await?;
    let len = r.read_u32().await?;

    // Validate frame size before allocation
    if len > MAX_PAYLOAD_SIZE {
        return Err(Error::protocol(format!(
            "frame payload {} exceeds maximum allowed size {}",
            len, MAX_PAYLOAD_SIZE
        )));
    }

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;

    Ok(Frame::new(kind, id, Bytes::from(payload)))
}

/// Write one frame. The caller owns flushing.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Frame) -> Result<()> {
    if frame.payload.len() > MAX_PAYLOAD_SIZE as usize {
        return Err(Error::protocol(format!(
            "refusing to send {} byte payload (max {})",
            frame.payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }
    if frame.kind == MessageKind::EndOfExchange {
        w.write_u8(MessageKind::EndOfExchange as u8).await?;
        return Ok(());
    }

    let mut header = [0u8; HEADER_LEN];
    header[0] = frame.kind as u8;
    header[1..5].copy_from_slice(&frame.id.to_be_bytes());
    header[5..9].copy_from_slice(&(frame.payload.len() as u32).to_be_bytes());
    w.write_all(&header).await?;
    w.write_all(&frame.payload).await?;
    Ok(())
}

// =============================================================================
// ERROR (0xF4)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    pub code: u16,
    pub message: String,
}

impl ErrorMessage {
    pub fn encode(&self) -> Bytes {
        let msg_bytes = self.message.as_bytes();
        let mut buf = BytesMut::with_capacity(2 + 4 + msg_bytes.len());
        buf.put_u16(self.code);
        buf.put_u32(msg_bytes.len() as u32);
        buf.put_slice(msg_bytes);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 6 {
            return Err(Error::protocol("error payload too short"));
        }
        let code = payload.get_u16();
        let msg_len = payload.get_u32() as usize;
        if payload.remaining() != msg_len {
            return Err(Error::protocol(format!(
                "error message length {} does not match payload ({} bytes)",
                msg_len,
                payload.remaining()
            )));
        }
        let message = String::from_utf8(payload.to_vec())
            .map_err(|_| Error::protocol("invalid UTF-8 in error message"))?;
        Ok(Self { code, message })
    }
}

impl From<ErrorMessage> for RemoteError {
    fn from(msg: ErrorMessage) -> Self {
        RemoteError {
            code: msg.code,
            message: msg.message,
        }
    }
}

// =============================================================================
// Version Negotiation
// =============================================================================

async fn write_preamble<W: AsyncWrite + Unpin>(
    w: &mut W,
    version: ProtocolVersion,
) -> Result<()> {
    let mut buf = [0u8; PREAMBLE_LEN];
    buf[..8].copy_from_slice(MAGIC);
    buf[8..].copy_from_slice(&version.get().to_be_bytes());
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

async fn read_preamble<R: AsyncRead + Unpin>(r: &mut R) -> Result<ProtocolVersion> {
    let mut buf = [0u8; PREAMBLE_LEN];
    match r.read_exact(&mut buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(Error::handshake("connection closed during handshake"));
        }
        Err(e) => return Err(e.into()),
    }
    if &buf[..8] != MAGIC {
        return Err(Error::handshake(format!(
            "bad magic {:?}",
            String::from_utf8_lossy(&buf[..8])
        )));
    }
    Ok(ProtocolVersion::new(u16::from_be_bytes([buf[8], buf[9]])))
}

/// Client side: propose `max`, adopt whatever the server echoes.
pub async fn negotiate_client<S>(conn: &mut S, max: ProtocolVersion) -> Result<ProtocolVersion>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_preamble(conn, max).await?;
    let echoed = read_preamble(conn).await?;

    if echoed > max {
        return Err(Error::handshake(format!(
            "server answered version {} above proposed {}",
            echoed, max
        )));
    }
    if !echoed.is_supported() {
        return Err(Error::handshake(format!(
            "version {} not supported (supported {}..={})",
            echoed,
            ProtocolVersion::MIN,
            ProtocolVersion::MAX
        )));
    }

    tracing::debug!(version = %echoed, "handshake complete");
    Ok(echoed)
}

/// Server side: clamp the proposal to `max` and echo it back.
///
/// A bad magic is answered with silence; an unsupported clamped version is
/// still echoed so the client fails too.
pub async fn negotiate_server<S>(conn: &mut S, max: ProtocolVersion) -> Result<ProtocolVersion>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let proposed = read_preamble(conn).await?;
    let adopted = proposed.min(max);
    write_preamble(conn, adopted).await?;

    if !adopted.is_supported() {
        return Err(Error::handshake(format!(
            "client proposed {}, clamped to {}, which is not supported",
            proposed, adopted
        )));
    }

    tracing::debug!(proposed = %proposed, version = %adopted, "handshake complete");
    Ok(adopted)
}

// =============================================================================
// Tests
// =============================================================================
