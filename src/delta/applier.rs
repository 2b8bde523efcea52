//! Incremental delta application.
//!
//! Delta chunks arrive in arbitrary slices of the op stream, so an op may
//! straddle two chunks. The applier buffers the unparsed remainder and
//! replays every complete op as soon as it is available.

use super::generator::DeltaOp;
use super::{MAX_COPY_LEN, MAX_LITERAL_LEN, OP_COPY, OP_LITERAL};
use anyhow::{Context, Result};
use bytes::{Buf, BytesMut};
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt, SeekFrom,
};

/// Copies are read from the base in pieces of this size.
const COPY_BUF_SIZE: usize = 64 * 1024;

const COPY_OP_LEN: usize = 1 + 8 + 4;
const LITERAL_HEADER_LEN: usize = 1 + 4;

pub struct DeltaApplier<B> {
    base: B,
    base_len: u64,
    pending: BytesMut,
    copy_buf: Vec<u8>,
    written: u64,
    literal: u64,
}

impl<B> DeltaApplier<B>
where
    B: AsyncRead + AsyncSeek + Unpin,
{
    /// `base_len` bounds every copy op; it must be the base's length when
    /// its signature was computed.
    pub fn new(base: B, base_len: u64) -> Self {
        Self {
            base,
            base_len,
            pending: BytesMut::new(),
            copy_buf: Vec::new(),
            written: 0,
            literal: 0,
        }
    }

    /// Append a slice of the op stream and write out every op it completes.
    pub async fn feed<W>(&mut self, data: &[u8], out: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.pending.extend_from_slice(data);

        while let Some(op) = self.next_op()? {
            match op {
                DeltaOp::Copy { offset, len } => self.copy(offset, len, out).await?,
                DeltaOp::Literal(bytes) => {
                    out.write_all(&bytes).await?;
                    self.written += bytes.len() as u64;
                    self.literal += bytes.len() as u64;
                }
            }
        }
        Ok(())
    }

    /// Bytes produced from literal ops so far.
    pub fn literal_bytes(&self) -> u64 {
        self.literal
    }

    /// End of the op stream. Returns the number of bytes produced.
    pub fn finish(self) -> Result<u64> {
        if !self.pending.is_empty() {
            anyhow::bail!(
                "Delta stream ended inside an op ({} bytes pending)",
                self.pending.len()
            );
        }
        Ok(self.written)
    }

    /// Split one complete op off the front of `pending`, if there is one.
    fn next_op(&mut self) -> Result<Option<DeltaOp>> {
        let Some(&tag) = self.pending.first() else {
            return Ok(None);
        };

        match tag {
            OP_COPY => {
                if self.pending.len() < COPY_OP_LEN {
                    return Ok(None);
                }
                let mut op = self.pending.split_to(COPY_OP_LEN);
                op.advance(1);
                let offset = op.get_u64();
                let len = op.get_u32();
                Ok(Some(DeltaOp::Copy { offset, len }))
            }
            OP_LITERAL => {
                if self.pending.len() < LITERAL_HEADER_LEN {
                    return Ok(None);
                }
                let len = u32::from_be_bytes([
                    self.pending[1],
                    self.pending[2],
                    self.pending[3],
                    self.pending[4],
                ]) as usize;
                // Checked before the body arrives so a bogus length fails fast
                if len > MAX_LITERAL_LEN {
                    anyhow::bail!(
                        "Delta literal size {} exceeds max {}",
                        len,
                        MAX_LITERAL_LEN
                    );
                }
                if self.pending.len() < LITERAL_HEADER_LEN + len {
                    return Ok(None);
                }
                self.pending.advance(LITERAL_HEADER_LEN);
                Ok(Some(DeltaOp::Literal(self.pending.split_to(len).freeze())))
            }
            other => anyhow::bail!("Unknown delta op type: {:#04x}", other),
        }
    }

    async fn copy<W>(&mut self, offset: u64, len: u32, out: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if len > MAX_COPY_LEN {
            anyhow::bail!("Delta copy size {} exceeds max {}", len, MAX_COPY_LEN);
        }
        let end = offset
            .checked_add(len as u64)
            .context("Delta copy range overflows")?;
        if end > self.base_len {
            anyhow::bail!(
                "Delta copy range {}..{} exceeds base size {}",
                offset,
                end,
                self.base_len
            );
        }

        self.base
            .seek(SeekFrom::Start(offset))
            .await
            .context("Failed to seek base file")?;

        let mut remaining = len as usize;
        while remaining > 0 {
            let n = remaining.min(COPY_BUF_SIZE);
            self.copy_buf.resize(n, 0);
            self.base
                .read_exact(&mut self.copy_buf)
                .await
                .context("Base file shorter than its signature")?;
            out.write_all(&self.copy_buf).await?;
            remaining -= n;
        }
        self.written += len as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::encode_ops;
    use bytes::Bytes;
    use std::io::Cursor;

    fn over(base: &'static [u8]) -> DeltaApplier<Cursor<&'static [u8]>> {
        DeltaApplier::new(Cursor::new(base), base.len() as u64)
    }

    #[tokio::test]
    async fn test_apply_copy_and_literal() {
        let ops = vec![
            DeltaOp::Copy { offset: 6, len: 5 },
            DeltaOp::Literal(Bytes::from_static(b", hello")),
        ];
        let mut applier = over(b"hello world");
        let mut out = Vec::new();
        applier.feed(&encode_ops(&ops), &mut out).await.unwrap();
        assert_eq!(applier.literal_bytes(), 7);
        assert_eq!(applier.finish().unwrap(), 12);
        assert_eq!(out, b"world, hello");
    }

    #[tokio::test]
    async fn test_op_split_across_feeds() {
        let wire = encode_ops(&[DeltaOp::Copy { offset: 0, len: 4 }]);
        let mut applier = over(b"abcdef");
        let mut out = Vec::new();
        applier.feed(&wire[..5], &mut out).await.unwrap();
        assert!(out.is_empty());
        applier.feed(&wire[5..], &mut out).await.unwrap();
        assert_eq!(out, b"abcd");
    }

    #[tokio::test]
    async fn test_copy_beyond_base_rejected() {
        let wire = encode_ops(&[DeltaOp::Copy { offset: 4, len: 10 }]);
        let mut applier = over(b"abcdef");
        let err = applier.feed(&wire, &mut Vec::new()).await.unwrap_err();
        assert!(err.to_string().contains("exceeds base size"));
    }

    #[tokio::test]
    async fn test_oversized_literal_rejected_from_header() {
        let mut header = vec![OP_LITERAL];
        header.extend_from_slice(&((MAX_LITERAL_LEN as u32) + 1).to_be_bytes());
        let mut applier = over(b"");
        assert!(applier.feed(&header, &mut Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_op_and_truncated_stream() {
        let mut applier = over(b"abc");
        assert!(applier.feed(&[0x7F], &mut Vec::new()).await.is_err());

        let mut applier = over(b"abc");
        applier.feed(&[OP_COPY, 0, 0], &mut Vec::new()).await.unwrap();
        assert!(applier.finish().is_err());
    }
}
