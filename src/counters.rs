//! Performance counters.
//!
//! Two counter blocks exist:
//!
//! - [`SstCounters`]: per-table statistics accumulated while a table is
//!   built. A subset is encoded into the table's metaindex so readers can
//!   inspect a table without scanning it. Encoding:
//!
//!   ```text
//!   [varint32 version][varint32 count][count x varint64 value]
//!   ```
//!
//!   Readers accept older blocks with fewer counters.
//!
//! - [`PerfCounters`]: the process-wide block with stable ordinal names.
//!   Optionally backed by a shared-memory segment so sibling processes
//!   observe the same counters; falls back to a process-local array when the
//!   segment is unavailable. Updates are atomic adds; readers tolerate torn
//!   snapshots.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use crate::coding;
use crate::sst::TableError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum SstCounter {
    /// Keys stored in the table.
    Keys = 0,
    /// Data blocks written.
    Blocks = 1,
    /// Blocks that attempted compression and stored the raw form instead.
    CompressAborted = 2,
    /// Byte count of all keys.
    KeySize = 3,
    /// Byte count of all values.
    ValueSize = 4,
    /// Byte count of all blocks before compression.
    BlockSize = 5,
    /// Post-compression byte count (equals BlockSize when uncompressed).
    BlockWriteSize = 6,
    /// Entries in the index block.
    IndexKeys = 7,
    KeyLargest = 8,
    KeySmallest = 9,
    ValueLargest = 10,
    ValueSmallest = 11,
}

pub const SST_COUNTER_COUNT: usize = 12;
pub const SST_COUNTER_VERSION: u32 = 1;

/// Fixed array of monotone per-table counters. Increments are atomic so the
/// producer and the pipeline workers can update without the ring lock.
#[derive(Debug)]
pub struct SstCounters {
    values: [AtomicU64; SST_COUNTER_COUNT],
}

impl Default for SstCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl SstCounters {
    pub fn new() -> Self {
        let counters = Self {
            values: std::array::from_fn(|_| AtomicU64::new(0)),
        };
        // Minimum trackers start saturated so `fetch_min` works even when
        // the true minimum is zero (empty values are routine).
        counters.values[SstCounter::KeySmallest as usize].store(u64::MAX, Ordering::Relaxed);
        counters.values[SstCounter::ValueSmallest as usize].store(u64::MAX, Ordering::Relaxed);
        counters
    }

    pub fn inc(&self, counter: SstCounter) -> u64 {
        self.add(counter, 1)
    }

    pub fn add(&self, counter: SstCounter, amount: u64) -> u64 {
        self.values[counter as usize].fetch_add(amount, Ordering::Relaxed) + amount
    }

    pub fn set(&self, counter: SstCounter, value: u64) {
        self.values[counter as usize].store(value, Ordering::Relaxed);
    }

    pub fn value(&self, counter: SstCounter) -> u64 {
        self.values[counter as usize].load(Ordering::Relaxed)
    }

    /// Raise the counter to `value` if larger.
    pub fn observe_max(&self, counter: SstCounter, value: u64) {
        self.values[counter as usize].fetch_max(value, Ordering::Relaxed);
    }

    /// Lower the counter to `value` if smaller. Minimum trackers are
    /// initialized to `u64::MAX` by `new`.
    pub fn observe_min(&self, counter: SstCounter, value: u64) {
        self.values[counter as usize].fetch_min(value, Ordering::Relaxed);
    }

    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        coding::put_varint32(dst, SST_COUNTER_VERSION);
        coding::put_varint32(dst, SST_COUNTER_COUNT as u32);
        for cell in &self.values {
            coding::put_varint64(dst, cell.load(Ordering::Relaxed));
        }
    }
}

/// A decoded counter block. Counters absent from an older, shorter block
/// read as zero.
#[derive(Debug, Clone)]
pub struct SstCounterSnapshot {
    pub version: u32,
    values: Vec<u64>,
}

impl SstCounterSnapshot {
    pub fn decode_from(input: &[u8]) -> Result<Self, TableError> {
        let (version, mut pos) = coding::get_varint32(input)
            .ok_or(TableError::Corruption("counter block version"))?;
        let (count, used) = coding::get_varint32(&input[pos..])
            .ok_or(TableError::Corruption("counter block count"))?;
        pos += used;

        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (value, used) = coding::get_varint64(&input[pos..])
                .ok_or(TableError::Corruption("counter block value"))?;
            pos += used;
            values.push(value);
        }
        Ok(Self { version, values })
    }

    pub fn value(&self, counter: SstCounter) -> u64 {
        self.values.get(counter as usize).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum PerfCounter {
    ApiOpen = 0,
    ApiGet = 1,
    ApiWrite = 2,
    BGCompactLevel0 = 3,
    BGCompactNormal = 4,
    BlockRead = 5,
    BlockFiltered = 6,
    BlockCached = 7,
    TableOpened = 8,
    TableCached = 9,
    WriteStall = 10,
    CompressionAborted = 11,
}

pub const PERF_COUNTER_COUNT: usize = 12;
const PERF_SEGMENT_VERSION: u32 = 1;
const PERF_HEADER_SIZE: usize = 8;

impl PerfCounter {
    /// Stable ordinal name for external consumers.
    pub fn name(self) -> &'static str {
        match self {
            PerfCounter::ApiOpen => "ApiOpen",
            PerfCounter::ApiGet => "ApiGet",
            PerfCounter::ApiWrite => "ApiWrite",
            PerfCounter::BGCompactLevel0 => "BGCompactLevel0",
            PerfCounter::BGCompactNormal => "BGCompactNormal",
            PerfCounter::BlockRead => "BlockRead",
            PerfCounter::BlockFiltered => "BlockFiltered",
            PerfCounter::BlockCached => "BlockCached",
            PerfCounter::TableOpened => "TableOpened",
            PerfCounter::TableCached => "TableCached",
            PerfCounter::WriteStall => "WriteStall",
            PerfCounter::CompressionAborted => "CompressionAborted",
        }
    }
}

enum PerfBackend {
    Local(Box<[AtomicU64; PERF_COUNTER_COUNT]>),
    Shared(memmap2::MmapMut),
}

/// Process-wide counter block.
pub struct PerfCounters {
    backend: PerfBackend,
}

impl PerfCounters {
    pub fn local() -> Self {
        Self {
            backend: PerfBackend::Local(Box::new(std::array::from_fn(|_| AtomicU64::new(0)))),
        }
    }

    /// Map a shared counter segment at `path`, initializing the header if
    /// the segment is new or carries a different layout.
    pub fn open_shared(path: &Path) -> Result<Self, std::io::Error> {
        let segment_len = PERF_HEADER_SIZE + PERF_COUNTER_COUNT * 8;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len(segment_len as u64)?;
        let mut map = unsafe { memmap2::MmapMut::map_mut(&file)? };

        let size = coding::decode_fixed32(&map[0..4]);
        let version = coding::decode_fixed32(&map[4..8]);
        if size as usize != segment_len || version != PERF_SEGMENT_VERSION {
            map[..].fill(0);
            map[0..4].copy_from_slice(&(segment_len as u32).to_le_bytes());
            map[4..8].copy_from_slice(&PERF_SEGMENT_VERSION.to_le_bytes());
        }

        Ok(Self {
            backend: PerfBackend::Shared(map),
        })
    }

    fn cell(&self, index: usize) -> &AtomicU64 {
        match &self.backend {
            PerfBackend::Local(values) => &values[index],
            PerfBackend::Shared(map) => {
                // The mapped cells are 8-aligned (page base + 8-byte header)
                // and only ever accessed through atomic ops.
                let base = map.as_ptr() as usize + PERF_HEADER_SIZE + index * 8;
                unsafe { &*(base as *const AtomicU64) }
            }
        }
    }

    pub fn inc(&self, counter: PerfCounter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: PerfCounter, amount: u64) {
        self.cell(counter as usize).fetch_add(amount, Ordering::Relaxed);
    }

    pub fn value(&self, counter: PerfCounter) -> u64 {
        self.cell(counter as usize).load(Ordering::Relaxed)
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.backend, PerfBackend::Shared(_))
    }
}

static GLOBAL_PERF: OnceLock<PerfCounters> = OnceLock::new();

/// The process-wide counter block, created on first use.
pub fn perf() -> &'static PerfCounters {
    GLOBAL_PERF.get_or_init(PerfCounters::local)
}

/// Install a shared-memory backed block before first use. Falls back to the
/// process-local block when the segment cannot be mapped. Returns false if
/// the global block was already initialized.
pub fn install_shared_perf(path: &Path) -> bool {
    let counters = match PerfCounters::open_shared(path) {
        Ok(counters) => counters,
        Err(err) => {
            log::warn!(
                "shared perf counter segment {:?} unavailable, using process-local counters: {err}",
                path
            );
            PerfCounters::local()
        }
    };
    GLOBAL_PERF.set(counters).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sst_counters_encode_decode() {
        let counters = SstCounters::new();
        counters.inc(SstCounter::Keys);
        counters.add(SstCounter::KeySize, 12);
        counters.observe_max(SstCounter::KeyLargest, 9);
        counters.observe_max(SstCounter::KeyLargest, 4);
        counters.observe_min(SstCounter::KeySmallest, 7);
        counters.observe_min(SstCounter::KeySmallest, 3);
        counters.observe_min(SstCounter::KeySmallest, 5);

        let mut buf = Vec::new();
        counters.encode_to(&mut buf);
        let snapshot = SstCounterSnapshot::decode_from(&buf).unwrap();
        assert_eq!(snapshot.version, SST_COUNTER_VERSION);
        assert_eq!(snapshot.len(), SST_COUNTER_COUNT);
        assert_eq!(snapshot.value(SstCounter::Keys), 1);
        assert_eq!(snapshot.value(SstCounter::KeySize), 12);
        assert_eq!(snapshot.value(SstCounter::KeyLargest), 9);
        assert_eq!(snapshot.value(SstCounter::KeySmallest), 3);
    }

    #[test]
    fn zero_is_a_valid_minimum() {
        let counters = SstCounters::new();
        counters.observe_min(SstCounter::ValueSmallest, 0);
        counters.observe_min(SstCounter::ValueSmallest, 5);
        assert_eq!(counters.value(SstCounter::ValueSmallest), 0);
    }

    #[test]
    fn snapshot_accepts_shorter_older_block() {
        let mut buf = Vec::new();
        coding::put_varint32(&mut buf, SST_COUNTER_VERSION);
        coding::put_varint32(&mut buf, 3);
        for v in [10u64, 20, 30] {
            coding::put_varint64(&mut buf, v);
        }
        let snapshot = SstCounterSnapshot::decode_from(&buf).unwrap();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.value(SstCounter::CompressAborted), 30);
        assert_eq!(snapshot.value(SstCounter::IndexKeys), 0);
    }

    #[test]
    fn local_perf_counters_add() {
        let perf = PerfCounters::local();
        perf.inc(PerfCounter::BlockRead);
        perf.add(PerfCounter::BlockRead, 2);
        assert_eq!(perf.value(PerfCounter::BlockRead), 3);
        assert!(!perf.is_shared());
    }

    #[test]
    fn shared_perf_counters_survive_remap() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("perf.shm");
        {
            let perf = PerfCounters::open_shared(&path).unwrap();
            assert!(perf.is_shared());
            perf.add(PerfCounter::ApiWrite, 5);
        }
        let perf = PerfCounters::open_shared(&path).unwrap();
        assert_eq!(perf.value(PerfCounter::ApiWrite), 5);
    }
}
