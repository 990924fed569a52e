//! The writable table file.
//!
//! `reserve(n)` atomically allocates `n` bytes at the logical end of the
//! file and hands back a [`ReservedRegion`]; the region's bytes may be
//! committed later, concurrently with other regions, as long as regions
//! never overlap — which the allocator guarantees. This is what lets the
//! pipeline release the serial write position before the block payload has
//! actually been copied.
//!
//! The physical file grows in `write_buffer_size`-sized steps ahead of the
//! reservations and is trimmed to the exact reserved length at finalize.

use std::fs;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::sst::TableError;

const MIN_GROW_CHUNK: u64 = 64 * 1024;

struct Inner {
    file: fs::File,
    alloc: Mutex<AllocState>,
}

struct AllocState {
    /// Next free logical byte; every byte below it belongs to some region.
    reserved: u64,
    /// Physical file length (`set_len` watermark).
    allocated: u64,
    chunk: u64,
}

pub struct TableFile {
    inner: Arc<Inner>,
}

impl TableFile {
    pub fn create(path: &Path, write_buffer_size: usize) -> Result<Self, TableError> {
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        Ok(Self {
            inner: Arc::new(Inner {
                file,
                alloc: Mutex::new(AllocState {
                    reserved: 0,
                    allocated: 0,
                    chunk: (write_buffer_size as u64).max(MIN_GROW_CHUNK),
                }),
            }),
        })
    }

    /// Allocate `len` bytes at the current logical end. Only the serial
    /// write path calls this, so reservations are handed out in file order.
    pub fn reserve(&self, len: u64) -> Result<ReservedRegion, TableError> {
        let mut alloc = self.inner.alloc.lock();
        let offset = alloc.reserved;
        alloc.reserved += len;
        if alloc.reserved > alloc.allocated {
            let grow = alloc.chunk.max(alloc.reserved - alloc.allocated);
            let new_len = alloc.allocated + grow;
            self.inner.file.set_len(new_len)?;
            alloc.allocated = new_len;
        }
        Ok(ReservedRegion {
            inner: self.inner.clone(),
            offset,
            len,
            written: 0,
        })
    }

    pub fn reserved_len(&self) -> u64 {
        self.inner.alloc.lock().reserved
    }

    /// Trim the preallocation down to the reserved length.
    pub fn finalize(&self) -> Result<(), TableError> {
        let mut alloc = self.inner.alloc.lock();
        if alloc.allocated != alloc.reserved {
            self.inner.file.set_len(alloc.reserved)?;
            alloc.allocated = alloc.reserved;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<(), TableError> {
        self.inner.file.sync_data()?;
        Ok(())
    }
}

/// A writable window into the file. Appends are positional writes, so
/// regions can be committed out of order and concurrently.
pub struct ReservedRegion {
    inner: Arc<Inner>,
    offset: u64,
    len: u64,
    written: u64,
}

impl ReservedRegion {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn remaining(&self) -> u64 {
        self.len - self.written
    }

    pub fn append(&mut self, data: &[u8]) -> Result<(), TableError> {
        if data.len() as u64 > self.remaining() {
            return Err(TableError::InvalidArgument("write past reserved region"));
        }
        self.inner
            .file
            .write_all_at(data, self.offset + self.written)?;
        self.written += data.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn regions_commit_out_of_order() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("t.sst");
        let file = TableFile::create(&path, 0)?;

        let mut first = file.reserve(4)?;
        let mut second = file.reserve(4)?;
        assert_eq!(first.offset(), 0);
        assert_eq!(second.offset(), 4);

        second.append(b"cddd")?;
        first.append(b"aa")?;
        first.append(b"bb")?;
        file.finalize()?;
        file.sync()?;

        let mut contents = Vec::new();
        fs::File::open(&path)?.read_to_end(&mut contents)?;
        assert_eq!(contents, b"aabbcddd");
        Ok(())
    }

    #[test]
    fn append_past_region_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let file = TableFile::create(&dir.path().join("t.sst"), 0)?;
        let mut region = file.reserve(2)?;
        assert!(region.append(b"abc").is_err());
        region.append(b"ab")?;
        assert_eq!(region.remaining(), 0);
        Ok(())
    }

    #[test]
    fn finalize_trims_preallocation() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("t.sst");
        let file = TableFile::create(&path, 1 << 20)?;
        let mut region = file.reserve(3)?;
        region.append(b"xyz")?;
        assert!(fs::metadata(&path)?.len() >= 1 << 20);
        file.finalize()?;
        assert_eq!(fs::metadata(&path)?.len(), 3);
        Ok(())
    }
}
