//! Restart-prefix-compressed blocks.
//!
//! Entry layout inside a block payload:
//! ```text
//! [varint32 shared][varint32 non_shared][varint32 value_len]
//! [key delta bytes][value bytes]
//! ```
//!
//! Once every `restart_interval` entries the full key is stored
//! (`shared == 0`) and its offset is recorded in the restart array appended
//! at the end of the payload:
//! ```text
//! [fixed32 restart_offset] * num_restarts
//! [fixed32 num_restarts]
//! ```

use bytes::Bytes;

use crate::coding;
use crate::sst::TableError;

/// Appends key/value records into a restart-compressed buffer.
///
/// The caller guarantees keys arrive in increasing order; the builder only
/// performs prefix compression and never consults a comparator.
pub struct BlockBuilder {
    restart_interval: usize,
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    counter: usize,
    entries: usize,
    finished: bool,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> Self {
        assert!(restart_interval >= 1);
        Self {
            restart_interval,
            buffer: Vec::new(),
            restarts: vec![0],
            counter: 0,
            entries: 0,
            finished: false,
            last_key: Vec::new(),
        }
    }

    /// Reset the contents as if the builder was just constructed, keeping
    /// allocations.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.entries = 0;
        self.finished = false;
        self.last_key.clear();
    }

    /// True iff no entries have been added since the last reset.
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn num_entries(&self) -> usize {
        self.entries
    }

    /// Upper bound of the serialized size if `finish` were called now.
    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    /// REQUIRES: `finish` has not been called since the last `reset`, and
    /// `key` is larger than any previously added key.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(!self.finished);
        debug_assert!(self.counter <= self.restart_interval);

        let mut shared = 0usize;
        if self.counter < self.restart_interval {
            let min_len = self.last_key.len().min(key.len());
            while shared < min_len && self.last_key[shared] == key[shared] {
                shared += 1;
            }
        } else {
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
        }
        let non_shared = key.len() - shared;

        coding::put_varint32(&mut self.buffer, shared as u32);
        coding::put_varint32(&mut self.buffer, non_shared as u32);
        coding::put_varint32(&mut self.buffer, value.len() as u32);
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.truncate(shared);
        self.last_key.extend_from_slice(&key[shared..]);
        debug_assert_eq!(self.last_key, key);

        self.counter += 1;
        self.entries += 1;
    }

    /// Finalize the restart array and return the payload. Idempotent until
    /// `reset`.
    pub fn finish(&mut self) -> &[u8] {
        if !self.finished {
            for &restart in &self.restarts {
                coding::put_fixed32(&mut self.buffer, restart);
            }
            coding::put_fixed32(&mut self.buffer, self.restarts.len() as u32);
            self.finished = true;
        }
        &self.buffer
    }

    /// Replace the finished payload with an externally computed form
    /// (typically its compressed version).
    pub fn overwrite(&mut self, payload: Vec<u8>) {
        debug_assert!(self.finished);
        self.buffer = payload;
    }

    /// Current payload bytes, finished or not.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }
}

/// A decoded block payload, iterable in storage order.
#[derive(Debug)]
pub struct Block {
    data: Vec<u8>,
    restart_offset: usize,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Result<Self, TableError> {
        if data.len() < 4 {
            return Err(TableError::Corruption("block too small"));
        }
        let num_restarts = coding::decode_fixed32(&data[data.len() - 4..]) as usize;
        let trailer = num_restarts
            .checked_mul(4)
            .and_then(|n| n.checked_add(4))
            .ok_or(TableError::Corruption("restart array too large"))?;
        if trailer > data.len() {
            return Err(TableError::Corruption("restart array out of bounds"));
        }
        let restart_offset = data.len() - trailer;
        Ok(Self {
            data,
            restart_offset,
        })
    }

    pub fn iter(&self) -> BlockIter<'_> {
        BlockIter {
            block: self,
            pos: 0,
            key: Vec::new(),
            corrupt: false,
        }
    }
}

/// Sequential cursor over a block's entries.
pub struct BlockIter<'a> {
    block: &'a Block,
    pos: usize,
    key: Vec<u8>,
    corrupt: bool,
}

impl BlockIter<'_> {
    fn parse_next(&mut self) -> Result<Option<(Bytes, Bytes)>, TableError> {
        if self.pos >= self.block.restart_offset {
            return Ok(None);
        }
        let data = &self.block.data[..self.block.restart_offset];

        let (shared, used) =
            coding::get_varint32(&data[self.pos..]).ok_or(TableError::Corruption("bad entry"))?;
        self.pos += used;
        let (non_shared, used) =
            coding::get_varint32(&data[self.pos..]).ok_or(TableError::Corruption("bad entry"))?;
        self.pos += used;
        let (value_len, used) =
            coding::get_varint32(&data[self.pos..]).ok_or(TableError::Corruption("bad entry"))?;
        self.pos += used;

        let shared = shared as usize;
        let non_shared = non_shared as usize;
        let value_len = value_len as usize;
        if shared > self.key.len() {
            return Err(TableError::Corruption("corrupted shared prefix"));
        }
        if self.pos + non_shared + value_len > data.len() {
            return Err(TableError::Corruption("truncated entry"));
        }

        self.key.truncate(shared);
        self.key.extend_from_slice(&data[self.pos..self.pos + non_shared]);
        self.pos += non_shared;
        let value = Bytes::copy_from_slice(&data[self.pos..self.pos + value_len]);
        self.pos += value_len;

        Ok(Some((Bytes::copy_from_slice(&self.key), value)))
    }
}

impl Iterator for BlockIter<'_> {
    type Item = Result<(Bytes, Bytes), TableError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.corrupt {
            return None;
        }
        match self.parse_next() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(err) => {
                self.corrupt = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_and_decode(interval: usize, entries: &[(&[u8], &[u8])]) -> Vec<(Bytes, Bytes)> {
        let mut builder = BlockBuilder::new(interval);
        for (k, v) in entries {
            builder.add(k, v);
        }
        let payload = builder.finish().to_vec();
        let block = Block::new(payload).unwrap();
        block.iter().collect::<Result<Vec<_>, _>>().unwrap()
    }

    #[test]
    fn empty_block_finishes() {
        let mut builder = BlockBuilder::new(16);
        assert!(builder.is_empty());
        let payload = builder.finish().to_vec();
        // One restart entry plus the count.
        assert_eq!(payload.len(), 8);
        let block = Block::new(payload).unwrap();
        assert_eq!(block.iter().count(), 0);
    }

    #[test]
    fn finish_is_idempotent_until_reset() {
        let mut builder = BlockBuilder::new(16);
        builder.add(b"a", b"1");
        let first = builder.finish().to_vec();
        let second = builder.finish().to_vec();
        assert_eq!(first, second);

        builder.reset();
        assert!(builder.is_empty());
        builder.add(b"b", b"2");
        assert_ne!(builder.finish(), first.as_slice());
    }

    #[test]
    fn prefix_compression_roundtrip() {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..100)
            .map(|i| {
                (
                    format!("user_key_{i:04}").into_bytes(),
                    format!("value_{i}").into_bytes(),
                )
            })
            .collect();
        let borrowed: Vec<(&[u8], &[u8])> = entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();

        for interval in [1usize, 4, 16] {
            let decoded = build_and_decode(interval, &borrowed);
            assert_eq!(decoded.len(), entries.len());
            for ((k, v), (dk, dv)) in entries.iter().zip(decoded.iter()) {
                assert_eq!(dk.as_ref(), k.as_slice());
                assert_eq!(dv.as_ref(), v.as_slice());
            }
        }
    }

    #[test]
    fn size_estimate_is_upper_bound() {
        let mut builder = BlockBuilder::new(4);
        for i in 0..32 {
            let key = format!("key{i:03}");
            builder.add(key.as_bytes(), b"v");
            assert!(builder.current_size_estimate() >= builder.buffer().len());
        }
        let estimate = builder.current_size_estimate();
        assert_eq!(builder.finish().len(), estimate);
    }

    #[test]
    fn overwrite_replaces_payload() {
        let mut builder = BlockBuilder::new(16);
        builder.add(b"k", b"v");
        builder.finish();
        builder.overwrite(vec![1, 2, 3]);
        assert_eq!(builder.buffer(), &[1, 2, 3]);
    }

    #[test]
    fn corrupt_restart_count_rejected() {
        let err = Block::new(vec![0xff, 0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, TableError::Corruption(_)));
    }
}
