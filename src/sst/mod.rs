//! Sorted-table (SST) file format and the builder stack.
//!
//! File layout:
//! ```text
//! [data block 0]
//! [data block 1]
//! ...
//! [filter block]        (optional)
//! [counter block]
//! [metaindex block]     maps "filter.<policy>" / "counters.sst1" -> handle
//! [index block]         maps shortened_last_key -> handle, one per data block
//! [footer]              48 bytes: two handles, padding, magic
//! ```
//!
//! Every block is stored as:
//! ```text
//! [payload][type u8][fixed32_le masked_crc32c(payload || type)]
//! ```
//!
//! Block payloads use the restart-array format (see [`block`]); compression
//! type 0 is raw, 1 is snappy. The CRC mask is the engine's standard
//! rotate-and-add so an all-zero trailer never validates.

use crate::coding;

pub mod block;
pub mod file;
pub mod filter;
pub mod pipeline;
pub mod reader;
pub mod retire;
pub mod writer;

pub use pipeline::TableBuilder;
pub use reader::TableReader;
pub use retire::KeyRetirement;
pub use writer::TableWriter;

/// `payload || type || crc` trailer bytes appended to every block.
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// Two max-length handles padded to 40 bytes, then the 8-byte magic.
pub const FOOTER_SIZE: usize = 2 * BlockHandle::MAX_ENCODED + 8;

pub const TABLE_MAGIC: u64 = 0xdb47_7524_8b80_fb57;

/// Metaindex key of the encoded per-table counter block.
pub const COUNTER_BLOCK_NAME: &str = "counters.sst1";

const CRC_MASK_DELTA: u32 = 0xa282_ead8;

/// Mask a CRC32C so that a CRC of bytes that themselves contain a CRC does
/// not collide trivially.
pub fn mask_crc(crc: u32) -> u32 {
    ((crc >> 15) | (crc << 17)).wrapping_add(CRC_MASK_DELTA)
}

pub fn unmask_crc(masked: u32) -> u32 {
    let rot = masked.wrapping_sub(CRC_MASK_DELTA);
    (rot >> 17) | (rot << 15)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Compression {
    None = 0,
    Snappy = 1,
}

impl Compression {
    pub fn from_u8(value: u8) -> Result<Self, TableError> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Snappy),
            _ => Err(TableError::Corruption("unknown compression type")),
        }
    }
}

/// Errors are `Clone` so the first failure can latch in the serial writer
/// and replay to every subsequent caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TableError {
    #[error("io error: {0}")]
    Io(String),

    #[error("corruption: {0}")]
    Corruption(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("not supported: {0}")]
    NotSupported(&'static str),
}

impl From<std::io::Error> for TableError {
    fn from(err: std::io::Error) -> Self {
        TableError::Io(err.to_string())
    }
}

/// `(offset, size)` pair locating a block in the file. `size` excludes the
/// 5-byte trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    /// Two maximal varint64s.
    pub const MAX_ENCODED: usize = 10 + 10;

    pub fn encode_into(&self, dst: &mut Vec<u8>) {
        coding::put_varint64(dst, self.offset);
        coding::put_varint64(dst, self.size);
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::MAX_ENCODED);
        self.encode_into(&mut buf);
        buf
    }

    pub fn decode_from(input: &[u8]) -> Result<(Self, usize), TableError> {
        let (offset, used_off) =
            coding::get_varint64(input).ok_or(TableError::Corruption("bad block handle"))?;
        let (size, used_size) = coding::get_varint64(&input[used_off..])
            .ok_or(TableError::Corruption("bad block handle"))?;
        Ok((Self { offset, size }, used_off + used_size))
    }
}

/// Fixed trailing region of the file: metaindex handle, index handle,
/// zero padding, magic.
#[derive(Debug, Clone, Copy)]
pub struct Footer {
    pub metaindex: BlockHandle,
    pub index: BlockHandle,
}

impl Footer {
    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FOOTER_SIZE);
        self.metaindex.encode_into(&mut buf);
        self.index.encode_into(&mut buf);
        buf.resize(2 * BlockHandle::MAX_ENCODED, 0);
        coding::put_fixed64(&mut buf, TABLE_MAGIC);
        debug_assert_eq!(buf.len(), FOOTER_SIZE);
        buf
    }

    pub fn decode_from(input: &[u8]) -> Result<Self, TableError> {
        if input.len() != FOOTER_SIZE {
            return Err(TableError::Corruption("bad footer size"));
        }
        let magic = coding::decode_fixed64(&input[FOOTER_SIZE - 8..]);
        if magic != TABLE_MAGIC {
            return Err(TableError::Corruption("bad table magic"));
        }
        let (metaindex, used) = BlockHandle::decode_from(input)?;
        let (index, _) = BlockHandle::decode_from(&input[used..])?;
        Ok(Self { metaindex, index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_mask_roundtrip() {
        let crc = crc32c::crc32c(b"payload");
        let masked = mask_crc(crc);
        assert_ne!(masked, crc);
        assert_eq!(unmask_crc(masked), crc);
    }

    #[test]
    fn handle_roundtrip() {
        let handle = BlockHandle {
            offset: 1 << 33,
            size: 4096,
        };
        let enc = handle.encode_to_vec();
        let (dec, used) = BlockHandle::decode_from(&enc).unwrap();
        assert_eq!(used, enc.len());
        assert_eq!(dec, handle);
    }

    #[test]
    fn footer_roundtrip() {
        let footer = Footer {
            metaindex: BlockHandle {
                offset: 100,
                size: 20,
            },
            index: BlockHandle {
                offset: 125,
                size: 333,
            },
        };
        let enc = footer.encode_to_vec();
        assert_eq!(enc.len(), FOOTER_SIZE);
        let dec = Footer::decode_from(&enc).unwrap();
        assert_eq!(dec.metaindex, footer.metaindex);
        assert_eq!(dec.index, footer.index);
    }

    #[test]
    fn footer_rejects_bad_magic() {
        let footer = Footer {
            metaindex: BlockHandle { offset: 0, size: 0 },
            index: BlockHandle { offset: 0, size: 0 },
        };
        let mut enc = footer.encode_to_vec();
        let last = enc.len() - 1;
        enc[last] ^= 0xff;
        assert!(Footer::decode_from(&enc).is_err());
    }
}
