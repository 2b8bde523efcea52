//! Delta generation against a remote signature.

use super::checksum::{strong_checksum, RollingChecksum, Signature};
use super::{MAX_COPY_LEN, MAX_LITERAL_LEN, OP_COPY, OP_LITERAL};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::io::{self, Read};

/// Bytes pulled from the source per read.
const READ_SIZE: usize = 64 * 1024;

/// One step of a delta script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaOp {
    /// Copy `len` bytes starting at `offset` of the receiver's old copy.
    Copy { offset: u64, len: u32 },
    /// Insert bytes the receiver does not have.
    Literal(Bytes),
}

impl DeltaOp {
    pub fn encoded_len(&self) -> usize {
        match self {
            DeltaOp::Copy { .. } => 1 + 8 + 4,
            DeltaOp::Literal(data) => 1 + 4 + data.len(),
        }
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            DeltaOp::Copy { offset, len } => {
                buf.put_u8(OP_COPY);
                buf.put_u64(*offset);
                buf.put_u32(*len);
            }
            DeltaOp::Literal(data) => {
                buf.put_u8(OP_LITERAL);
                buf.put_u32(data.len() as u32);
                buf.put_slice(data);
            }
        }
    }
}

/// Serialize a whole op list.
pub fn encode_ops(ops: &[DeltaOp]) -> Bytes {
    let mut buf = BytesMut::with_capacity(ops.iter().map(DeltaOp::encoded_len).sum());
    for op in ops {
        op.encode_into(&mut buf);
    }
    buf.freeze()
}

/// Weak checksum -> candidate block indices. Only full-length blocks
/// participate in rolling matches; a short tail block is matched
/// separately at end of input.
struct BlockIndex<'a> {
    sig: &'a Signature,
    by_weak: HashMap<u32, Vec<usize>>,
}

impl<'a> BlockIndex<'a> {
    fn new(sig: &'a Signature) -> Self {
        let mut by_weak: HashMap<u32, Vec<usize>> = HashMap::new();
        for (i, block) in sig.blocks.iter().enumerate() {
            if sig.block_size(i) == sig.block_len {
                by_weak.entry(block.weak).or_default().push(i);
            }
        }
        Self { sig, by_weak }
    }

    /// Find a block with the same content as `window`, preferring
    /// `prefer` so consecutive matches collapse into one copy.
    fn find(&self, weak: u32, window: &[u8], prefer: Option<usize>) -> Option<usize> {
        let candidates = self.by_weak.get(&weak)?;
        let strong = strong_checksum(window);
        if let Some(p) = prefer {
            if candidates.contains(&p) && self.sig.blocks[p].strong == strong {
                return Some(p);
            }
        }
        candidates
            .iter()
            .copied()
            .find(|&i| self.sig.blocks[i].strong == strong)
    }

    /// Match the last block against the end of `rest`.
    /// Returns the block index and its length.
    fn find_tail(&self, rest: &[u8]) -> Option<(usize, usize)> {
        let last = self.sig.blocks.len().checked_sub(1)?;
        let len = self.sig.block_size(last) as usize;
        if len == 0 || len > rest.len() {
            return None;
        }
        let suffix = &rest[rest.len() - len..];
        let block = &self.sig.blocks[last];
        if block.weak == RollingChecksum::new(suffix).digest()
            && block.strong == strong_checksum(suffix)
        {
            Some((last, len))
        } else {
            None
        }
    }
}

/// Hands ops to the consumer, holding back one copy so adjacent copies
/// merge.
struct OpSink<F> {
    emit: F,
    pending: Option<(u64, u32)>,
}

impl<F> OpSink<F>
where
    F: FnMut(DeltaOp) -> io::Result<()>,
{
    fn copy(&mut self, offset: u64, len: u32) -> io::Result<()> {
        if let Some((last_offset, last_len)) = self.pending.as_mut() {
            if *last_offset + *last_len as u64 == offset && *last_len + len <= MAX_COPY_LEN {
                *last_len += len;
                return Ok(());
            }
        }
        self.flush()?;
        self.pending = Some((offset, len));
        Ok(())
    }

    fn literal(&mut self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.flush()?;
        for piece in data.chunks(MAX_LITERAL_LEN) {
            (self.emit)(DeltaOp::Literal(Bytes::copy_from_slice(piece)))?;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.pending.take() {
            Some((offset, len)) => (self.emit)(DeltaOp::Copy { offset, len }),
            None => Ok(()),
        }
    }
}

/// Compute the ops that turn the signed file into the content of `reader`.
pub fn compute_delta<R: Read>(sig: &Signature, reader: R) -> io::Result<Vec<DeltaOp>> {
    let mut ops = Vec::new();
    compute_delta_with(sig, reader, |op| {
        ops.push(op);
        Ok(())
    })?;
    Ok(ops)
}

/// Streaming form of [`compute_delta`]: each op goes to `emit` as soon as
/// it is final. Memory stays bounded by one block plus the pending literal
/// run, which is flushed every `MAX_LITERAL_LEN` bytes. An error from
/// `emit` stops the scan.
pub fn compute_delta_with<R, F>(sig: &Signature, mut reader: R, emit: F) -> io::Result<()>
where
    R: Read,
    F: FnMut(DeltaOp) -> io::Result<()>,
{
    let block = sig.block_len as usize;
    let index = BlockIndex::new(sig);
    let mut sink = OpSink {
        emit,
        pending: None,
    };

    let mut buf: Vec<u8> = Vec::with_capacity(block + READ_SIZE);
    let mut pos = 0usize; // window start
    let mut lit_start = 0usize; // first byte of the pending literal
    let mut eof = false;
    let mut rolling: Option<RollingChecksum> = None;
    let mut next_block: Option<usize> = None;

    loop {
        // Rolling needs one byte past the window
        if !eof && buf.len() - pos <= block {
            if lit_start > 0 {
                buf.drain(..lit_start);
                pos -= lit_start;
                lit_start = 0;
            }
            eof = fill(&mut reader, &mut buf)?;
            continue;
        }
        if buf.len() - pos < block || index.by_weak.is_empty() {
            break;
        }

        let window = &buf[pos..pos + block];
        let sum = *rolling.get_or_insert_with(|| RollingChecksum::new(window));

        if let Some(i) = index.find(sum.digest(), window, next_block) {
            sink.literal(&buf[lit_start..pos])?;
            sink.copy(i as u64 * sig.block_len as u64, sig.block_len)?;
            pos += block;
            lit_start = pos;
            rolling = None;
            next_block = Some(i + 1);
            continue;
        }

        if pos + block >= buf.len() {
            // At EOF with exactly one window left and no match
            break;
        }
        if let Some(r) = rolling.as_mut() {
            r.roll(buf[pos], buf[pos + block]);
        }
        pos += 1;
        next_block = None;
        if pos - lit_start >= MAX_LITERAL_LEN {
            sink.literal(&buf[lit_start..pos])?;
            lit_start = pos;
        }
    }

    // No full blocks to match: stream the rest out as literals, keeping
    // one block back for the tail comparison.
    while !eof {
        eof = fill(&mut reader, &mut buf)?;
        let keep_from = buf.len().saturating_sub(block);
        if keep_from > lit_start && keep_from - lit_start >= MAX_LITERAL_LEN {
            sink.literal(&buf[lit_start..keep_from])?;
            buf.drain(..keep_from);
            pos = 0;
            lit_start = 0;
        }
    }

    match index.find_tail(&buf[pos..]) {
        Some((i, len)) => {
            let tail_at = buf.len() - len;
            sink.literal(&buf[lit_start..tail_at])?;
            sink.copy(i as u64 * sig.block_len as u64, len as u32)?;
        }
        None => sink.literal(&buf[lit_start..])?,
    }
    sink.flush()
}

/// Append up to `READ_SIZE` bytes. Returns true at EOF.
fn fill<R: Read>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<bool> {
    let old = buf.len();
    buf.resize(old + READ_SIZE, 0);
    loop {
        match reader.read(&mut buf[old..]) {
            Ok(n) => {
                buf.truncate(old + n);
                return Ok(n == 0);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                buf.truncate(old);
                return Err(e);
            }
        }
    }
}
