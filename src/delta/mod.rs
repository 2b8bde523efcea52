//! Block-matching delta engine.
//!
//! The receiver describes its copy of a file as a [`Signature`]: one weak
//! rolling checksum and one truncated BLAKE3 hash per block. The sender
//! slides a window over its own copy and emits [`DeltaOp`]s that either
//! copy a block the receiver already has or insert literal bytes. The
//! receiver replays those ops against its old copy with [`DeltaApplier`].

pub mod applier;
pub mod checksum;
pub mod generator;

pub use applier::DeltaApplier;
pub use checksum::{compute_signature, BlockSignature, RollingChecksum, Signature};
pub use generator::{compute_delta, compute_delta_with, encode_ops, DeltaOp};

/// Block length used for signatures (protocol constant).
pub const BLOCK_LEN: u32 = 2048;

/// Strong hash length in bytes (protocol constant).
pub const STRONG_LEN: usize = 16;

/// Largest literal run carried by a single op.
pub const MAX_LITERAL_LEN: usize = 1024 * 1024;

/// Largest copy length carried by a single op (16MB).
pub const MAX_COPY_LEN: u32 = 16 * 1024 * 1024;

/// Op tags on the wire.
pub(crate) const OP_COPY: u8 = 0x00;
pub(crate) const OP_LITERAL: u8 = 0x01;

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    /// Deterministic bytes without short periods.
    fn noise(len: usize, mut seed: u64) -> Vec<u8> {
        (0..len)
            .map(|_| {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                (seed >> 24) as u8
            })
            .collect()
    }

    fn reconstruct(base: &[u8], updated: &[u8], block_len: u32) -> Vec<u8> {
        let sig = compute_signature(Cursor::new(base), block_len).unwrap();
        let ops = compute_delta(&sig, Cursor::new(updated)).unwrap();
        let wire = encode_ops(&ops);

        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        rt.block_on(async {
            let mut applier = DeltaApplier::new(Cursor::new(base.to_vec()), base.len() as u64);
            let mut out = Vec::new();
            // Feed in uneven slices so ops straddle chunk boundaries
            for piece in wire.chunks(7) {
                applier.feed(piece, &mut out).await.unwrap();
            }
            applier.finish().unwrap();
            out
        })
    }

    #[test]
    fn test_inserted_run_reconstructs_exactly() {
        let base = noise(64 * 1024, 0x9e37_79b9);
        let mut updated = base.clone();
        let at = 20_000;
        updated.splice(at..at, *b"0123456789");

        let out = reconstruct(&base, &updated, BLOCK_LEN);
        assert_eq!(out, updated);
    }

    #[test]
    fn test_inserted_run_reuses_most_blocks() {
        let base = noise(64 * 1024, 42);
        let mut updated = base.clone();
        updated.splice(1000..1000, *b"0123456789");

        let sig = compute_signature(Cursor::new(&base), BLOCK_LEN).unwrap();
        let ops = compute_delta(&sig, Cursor::new(&updated)).unwrap();
        let literal: usize = ops
            .iter()
            .map(|op| match op {
                DeltaOp::Literal(data) => data.len(),
                DeltaOp::Copy { .. } => 0,
            })
            .sum();
        // Only the block containing the insertion is resent
        assert!(literal <= BLOCK_LEN as usize + 10, "literal bytes: {}", literal);
    }

    #[test]
    fn test_empty_base_and_empty_update() {
        assert_eq!(reconstruct(b"", b"fresh content", 16), b"fresh content");
        assert_eq!(reconstruct(b"old content", b"", 16), b"");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_delta_reconstructs_update(
            base in proptest::collection::vec(any::<u8>(), 0..4096),
            edits in proptest::collection::vec((any::<u16>(), proptest::collection::vec(any::<u8>(), 0..40)), 0..4),
            block_len in 1u32..128,
        ) {
            let mut updated = base.clone();
            for (at, run) in edits {
                let at = at as usize % (updated.len() + 1);
                updated.splice(at..at, run);
            }
            prop_assert_eq!(reconstruct(&base, &updated, block_len), updated);
        }
    }
}
