//! Block and fragment metadata shared across the queue, dedup index, and
//! writer.

use bitflags::bitflags;

bitflags! {
    /// Per-block processing hints, set by the caller at submission time
    /// and consulted by the worker and writer.
    #[derive(Default)]
    pub struct BlockFlags: u16 {
        /// This block is a fragment (tail bytes shorter than the block size).
        /// Never set in this implementation: fragments are packed into a
        /// fragment block by [`crate::fragment::FragmentAccumulator`]
        /// before a [`Block`] is ever constructed for them, so only
        /// `IS_FRAGMENT_BLOCK` appears on the wire. Kept for parity with
        /// the reference flag set.
        const IS_FRAGMENT        = 0x0001;
        /// This block is itself a sealed, shared fragment block.
        const IS_FRAGMENT_BLOCK  = 0x0002;
        /// Skip compression entirely; commit the raw bytes.
        const DONT_COMPRESS      = 0x0004;
        /// Do not accumulate this block's tail into a fragment.
        const DONT_FRAGMENT      = 0x0008;
        /// Do not consult or populate the dedup index for this block.
        const DONT_DEDUPLICATE   = 0x0010;
        /// Pad the block's start offset to the device block size.
        const ALIGN              = 0x0020;
        /// The size word's high bit is set: data is stored uncompressed.
        const SIZE_IS_COMPRESSED = 0x0040;
        /// All bytes are zero; no payload is written at all.
        const IS_SPARSE          = 0x0080;
        /// Last block belonging to its file.
        const LAST_BLOCK         = 0x0100;
        /// First block belonging to its file.
        const FIRST_BLOCK        = 0x0200;
    }
}

/// A packed `(uncompressed_size, checksum)` dedup key, following the same
/// `size << 32 | checksum` layout the reference block processor uses for
/// its block signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockSignature(u64);

impl BlockSignature {
    pub fn new(uncompressed_size: u32, checksum: u32) -> Self {
        Self((uncompressed_size as u64) << 32 | checksum as u64)
    }

    pub fn uncompressed_size(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn checksum(self) -> u32 {
        self.0 as u32
    }
}

/// A single block submitted to the processor: a file's full-size data
/// block, its short tail block, or a sealed shared fragment block.
///
/// `data` always holds the *uncompressed* payload, untouched by the
/// worker, so the block index's byte-compare-on-hit policy (§4.6) always
/// has the original bytes to compare against. The worker fills in
/// `compressed` only when compression actually shrinks the block; the
/// writer commits `compressed` if present, else `data`.
pub struct Block {
    pub seq_id: u64,
    pub file_id: u64,
    pub index_in_file: u32,
    pub uncompressed_size: u32,
    pub checksum: u32,
    pub data: Vec<u8>,
    pub compressed: Option<Vec<u8>>,
    pub flags: BlockFlags,
}

impl Block {
    pub fn new(
        seq_id: u64,
        file_id: u64,
        index_in_file: u32,
        data: Vec<u8>,
        flags: BlockFlags,
    ) -> Self {
        let uncompressed_size = data.len() as u32;
        let checksum = crc32fast::hash(&data);
        Self {
            seq_id,
            file_id,
            index_in_file,
            uncompressed_size,
            checksum,
            data,
            compressed: None,
            flags,
        }
    }

    pub fn is_fragment_block(&self) -> bool {
        self.flags.contains(BlockFlags::IS_FRAGMENT_BLOCK)
    }

    pub fn is_sparse(&self) -> bool {
        self.flags.contains(BlockFlags::IS_SPARSE)
    }

    pub fn signature(&self) -> BlockSignature {
        BlockSignature::new(self.uncompressed_size, self.checksum)
    }

    /// The bytes that will actually be written to the output file.
    pub fn on_disk_bytes(&self) -> &[u8] {
        self.compressed.as_deref().unwrap_or(&self.data)
    }
}

/// Result of compressing and committing a single block: the encoded
/// size-word layout used by the (external) inode/fragment table writer.
///
/// Low 24 bits: on-disk size. High bit (bit 24 as seen from the metadata
/// table's perspective, here bit 31 of the backing `u32`, matching the
/// original size-word bit position): stored-uncompressed flag. All-zero:
/// sparse hole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeWord(u32);

const SIZE_MASK: u32 = 0x00ff_ffff;
const UNCOMPRESSED_BIT: u32 = 1 << 24;

impl SizeWord {
    pub fn sparse() -> Self {
        Self(0)
    }

    pub fn new(on_disk_size: u32, stored_uncompressed: bool) -> Self {
        debug_assert!(on_disk_size <= SIZE_MASK, "size word overflow");
        let mut word = on_disk_size & SIZE_MASK;
        if stored_uncompressed {
            word |= UNCOMPRESSED_BIT;
        }
        Self(word)
    }

    pub fn is_sparse(self) -> bool {
        self.0 == 0
    }

    pub fn is_stored_uncompressed(self) -> bool {
        self.0 & UNCOMPRESSED_BIT != 0
    }

    pub fn on_disk_size(self) -> u32 {
        self.0 & SIZE_MASK
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trips_size_and_checksum() {
        let sig = BlockSignature::new(131_072, 0xdead_beef);
        assert_eq!(sig.uncompressed_size(), 131_072);
        assert_eq!(sig.checksum(), 0xdead_beef);
    }

    #[test]
    fn size_word_encodes_uncompressed_flag() {
        let w = SizeWord::new(4096, true);
        assert!(w.is_stored_uncompressed());
        assert_eq!(w.on_disk_size(), 4096);
        assert!(!w.is_sparse());
    }

    #[test]
    fn size_word_sparse_is_all_zero() {
        assert!(SizeWord::sparse().is_sparse());
        assert_eq!(SizeWord::sparse().raw(), 0);
    }
}
