//! Rolling and strong block checksums, and file signatures.

use super::{MAX_COPY_LEN, STRONG_LEN};
use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{self, Read};

/// Added to every byte so runs of zeros still move the checksum.
const CHAR_OFFSET: u32 = 31;

/// Fixed part of an encoded signature: block_len + strong_len + file_len + count.
const HEADER_LEN: usize = 4 + 4 + 8 + 4;

/// Adler-style weak checksum that can slide one byte at a time.
#[derive(Debug, Clone, Copy)]
pub struct RollingChecksum {
    a: u32,
    b: u32,
    len: u32,
}

impl RollingChecksum {
    pub fn new(window: &[u8]) -> Self {
        let mut a = 0u32;
        let mut b = 0u32;
        for &byte in window {
            a = a.wrapping_add(byte as u32 + CHAR_OFFSET);
            b = b.wrapping_add(a);
        }
        Self {
            a,
            b,
            len: window.len() as u32,
        }
    }

    /// Slide the window forward: drop `out`, append `incoming`.
    pub fn roll(&mut self, out: u8, incoming: u8) {
        let out = out as u32 + CHAR_OFFSET;
        let incoming = incoming as u32 + CHAR_OFFSET;
        self.a = self.a.wrapping_sub(out).wrapping_add(incoming);
        self.b = self
            .b
            .wrapping_sub(self.len.wrapping_mul(out))
            .wrapping_add(self.a);
    }

    pub fn digest(&self) -> u32 {
        (self.a & 0xFFFF) | (self.b << 16)
    }
}

/// Weak checksum of a whole block.
pub fn weak_checksum(block: &[u8]) -> u32 {
    RollingChecksum::new(block).digest()
}

/// Truncated BLAKE3 of a block.
pub fn strong_checksum(block: &[u8]) -> [u8; STRONG_LEN] {
    let hash = blake3::hash(block);
    let mut out = [0u8; STRONG_LEN];
    out.copy_from_slice(&hash.as_bytes()[..STRONG_LEN]);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSignature {
    pub weak: u32,
    pub strong: [u8; STRONG_LEN],
}

/// Per-block checksums of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub block_len: u32,
    pub file_len: u64,
    pub blocks: Vec<BlockSignature>,
}

impl Signature {
    /// Length of block `index`; only the last block may be short.
    pub fn block_size(&self, index: usize) -> u32 {
        let start = index as u64 * self.block_len as u64;
        (self.file_len - start).min(self.block_len as u64) as u32
    }

    pub fn encode(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(HEADER_LEN + self.blocks.len() * (4 + STRONG_LEN));
        buf.put_u32(self.block_len);
        buf.put_u32(STRONG_LEN as u32);
        buf.put_u64(self.file_len);
        buf.put_u32(self.blocks.len() as u32);
        for block in &self.blocks {
            buf.put_u32(block.weak);
            buf.put_slice(&block.strong);
        }
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < HEADER_LEN {
            anyhow::bail!("Signature header truncated");
        }
        let block_len = payload.get_u32();
        let strong_len = payload.get_u32() as usize;
        let file_len = payload.get_u64();
        let count = payload.get_u32() as usize;

        if block_len == 0 || block_len > MAX_COPY_LEN {
            anyhow::bail!("Signature block length {} out of range", block_len);
        }
        if strong_len != STRONG_LEN {
            anyhow::bail!(
                "Signature strong hash length {} (expected {})",
                strong_len,
                STRONG_LEN
            );
        }
        let expected = file_len.div_ceil(block_len as u64);
        if count as u64 != expected {
            anyhow::bail!(
                "Signature has {} blocks, file length {} needs {}",
                count,
                file_len,
                expected
            );
        }
        let required = count
            .checked_mul(4 + STRONG_LEN)
            .context("Signature block count overflow")?;
        if payload.remaining() != required {
            anyhow::bail!(
                "Signature blocks truncated: expected {} bytes, got {}",
                required,
                payload.remaining()
            );
        }

        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            let weak = payload.get_u32();
            let mut strong = [0u8; STRONG_LEN];
            payload.copy_to_slice(&mut strong);
            blocks.push(BlockSignature { weak, strong });
        }

        Ok(Self {
            block_len,
            file_len,
            blocks,
        })
    }
}

/// Read `reader` to the end and checksum it block by block.
pub fn compute_signature<R: Read>(mut reader: R, block_len: u32) -> io::Result<Signature> {
    if block_len == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "block length must be non-zero",
        ));
    }
    let mut buf = vec![0u8; block_len as usize];
    let mut blocks = Vec::new();
    let mut file_len = 0u64;

    loop {
        let n = read_full(&mut reader, &mut buf)?;
        if n == 0 {
            break;
        }
        let block = &buf[..n];
        blocks.push(BlockSignature {
            weak: weak_checksum(block),
            strong: strong_checksum(block),
        });
        file_len += n as u64;
        if n < buf.len() {
            break;
        }
    }

    Ok(Signature {
        block_len,
        file_len,
        blocks,
    })
}

/// Fill `buf` unless EOF comes first. Returns the bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_rolling_matches_fresh_checksum() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let window = 8;
        let mut rolling = RollingChecksum::new(&data[..window]);
        for start in 1..=data.len() - window {
            rolling.roll(data[start - 1], data[start + window - 1]);
            assert_eq!(
                rolling.digest(),
                weak_checksum(&data[start..start + window]),
                "mismatch at offset {}",
                start
            );
        }
    }

    #[test]
    fn test_signature_block_layout() {
        let data = vec![7u8; 10_000];
        let sig = compute_signature(Cursor::new(&data), 4096).unwrap();
        assert_eq!(sig.file_len, 10_000);
        assert_eq!(sig.blocks.len(), 3);
        assert_eq!(sig.block_size(0), 4096);
        assert_eq!(sig.block_size(2), 10_000 - 8192);
        // Identical full blocks hash identically
        assert_eq!(sig.blocks[0], sig.blocks[1]);
        assert_ne!(sig.blocks[1], sig.blocks[2]);
    }

    #[test]
    fn test_signature_encode_decode() {
        let sig = compute_signature(Cursor::new(b"hello signature world"), 4).unwrap();
        let decoded = Signature::decode(sig.encode()).unwrap();
        assert_eq!(decoded, sig);
    }

    #[test]
    fn test_signature_decode_rejects_inconsistent_count() {
        let sig = compute_signature(Cursor::new(b"0123456789"), 4).unwrap();
        let mut encoded = BytesMut::from(&sig.encode()[..]);
        // Claim a longer file than the blocks describe
        encoded[8..16].copy_from_slice(&100u64.to_be_bytes());
        assert!(Signature::decode(encoded.freeze()).is_err());
    }

    #[test]
    fn test_empty_file_signature() {
        let sig = compute_signature(Cursor::new(b""), 2048).unwrap();
        assert!(sig.blocks.is_empty());
        assert_eq!(Signature::decode(sig.encode()).unwrap(), sig);
    }

    #[test]
    fn test_signature_decode_rejects_oversized_blocks() {
        for block_len in [MAX_COPY_LEN + 1, u32::MAX] {
            let mut encoded = BytesMut::new();
            encoded.put_u32(block_len);
            encoded.put_u32(STRONG_LEN as u32);
            encoded.put_u64(1);
            encoded.put_u32(1);
            encoded.put_u32(0);
            encoded.put_slice(&[0u8; STRONG_LEN]);
            assert!(Signature::decode(encoded.freeze()).is_err());
        }
    }
}
