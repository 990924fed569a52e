//! The parallel block pipeline.
//!
//! Block compression and checksumming are CPU-bound while the file append
//! is I/O-bound; a serial builder stalls the producer at every block
//! boundary. This builder overlaps three phases across a ring of block
//! slots:
//!
//! - *loading*: the producer appends records into the in-progress block,
//! - *compressing*: workers serialize, compress, and checksum full blocks
//!   in any order,
//! - *writing*: exactly one worker at a time reserves file space, appends
//!   the index entry, and anchors the filter group — strictly FIFO in
//!   producer order — then copies the payload concurrently with the next
//!   block's serial section.
//!
//! Slot life cycle:
//! ```text
//!         producer.add (first key of a block)
//! Empty ─────────────────────────────────────> Loading
//! Loading ── producer.flush or size cap ─────> Full
//! Full ──────────── worker picks up ─────────> Compressing
//! Compressing ── separator already known ────> Ready
//! Compressing ── still awaiting next key ────> KeyWait
//! KeyWait ── producer shortens last_key ─────> Ready
//! Ready ── slot == write_idx, worker picks ──> Writing
//! Writing ── space reserved, index updated ──> Copying
//! Copying ── payload copied, trailer written > Empty
//! ```
//!
//! A single mutex and condition variable guard every state transition. The
//! in-progress block's buffers are owned by the producer between flushes
//! and parked in the slot while queued, so the bulk data never crosses the
//! lock; slot metadata (`state`, `last_key`, `key_shortened`, `crc`,
//! `comp_type`) always does. A block's index key is shortened exactly once:
//! by the producer against the next block's first key, or — for the final
//! block — by the worker that sees the finish flag and no successor.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::comparator::{Comparator, InternalKeyComparator};
use crate::counters::{SstCounter, SstCounters};
use crate::internal_key::InternalKey;
use crate::options::Options;
use crate::sst::block::BlockBuilder;
use crate::sst::file::TableFile;
use crate::sst::writer::{block_crc, compress_block, TableWriter};
use crate::sst::{mask_crc, Compression, TableError, BLOCK_TRAILER_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Empty,
    Loading,
    Full,
    Compressing,
    KeyWait,
    Ready,
    Writing,
    Copying,
}

/// The bulky per-block buffers. Owned by exactly one thread at a time: the
/// producer while loading, the ring while queued, a worker while
/// compressing or writing.
struct BlockWork {
    block: BlockBuilder,
    last_key: Vec<u8>,
    filter_keys: Vec<u8>,
    filter_lengths: Vec<usize>,
}

impl BlockWork {
    fn new(restart_interval: usize) -> Self {
        Self {
            block: BlockBuilder::new(restart_interval),
            last_key: Vec::new(),
            filter_keys: Vec::new(),
            filter_lengths: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.block.reset();
        self.last_key.clear();
        self.filter_keys.clear();
        self.filter_lengths.clear();
    }
}

struct Slot {
    state: SlotState,
    /// Last key added to the block; becomes the index key once shortened.
    last_key: Vec<u8>,
    key_shortened: bool,
    comp_type: Compression,
    /// CRC32C of `payload || type`, computed by the compress phase.
    crc: u32,
    /// Parked buffers; `None` while a thread has the block claimed.
    work: Option<BlockWork>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: SlotState::Empty,
            last_key: Vec::new(),
            key_shortened: false,
            comp_type: Compression::None,
            crc: 0,
            work: None,
        }
    }

    fn reset_meta(&mut self) {
        self.state = SlotState::Empty;
        self.last_key.clear();
        self.key_shortened = false;
        self.comp_type = Compression::None;
        self.crc = 0;
    }
}

struct Ring {
    slots: Vec<Slot>,
    /// Slot the producer loads next; changed only by the producer.
    add_idx: usize,
    /// Slot that owns the serial write position.
    write_idx: usize,
    finish: bool,
    abort: bool,
}

struct Shared {
    ring: Mutex<Ring>,
    cv: Condvar,
    writer: Mutex<TableWriter>,
    counters: Arc<SstCounters>,
    icmp: InternalKeyComparator,
    compression: Compression,
}

/// Builds one table from a sorted record stream, overlapping load,
/// compression, and write across worker threads.
pub struct TableBuilder {
    shared: Arc<Shared>,
    workers: Vec<thread::JoinHandle<()>>,
    failed: Arc<AtomicBool>,

    // Producer-local state; touched without any lock.
    current: BlockWork,
    in_block: bool,
    key_scratch: Vec<u8>,
    block_size: usize,
    restart_interval: usize,
    has_filter: bool,
    stall_micros: u64,
    closed: bool,
}

impl TableBuilder {
    pub fn new(
        options: &Options,
        icmp: InternalKeyComparator,
        file: TableFile,
    ) -> Result<Self, TableError> {
        // The finish path hands the last block its successor only when the
        // slot after it is empty, so the ring needs at least two slots.
        let ring_size = options.ring_size.max(2);
        let worker_count = options.worker_count.max(1);

        let counters = Arc::new(SstCounters::new());
        let writer = TableWriter::new(file, options, counters.clone());
        let failed = writer.failed_flag();

        let shared = Arc::new(Shared {
            ring: Mutex::new(Ring {
                slots: (0..ring_size).map(|_| Slot::new()).collect(),
                add_idx: 0,
                write_idx: 0,
                finish: false,
                abort: false,
            }),
            cv: Condvar::new(),
            writer: Mutex::new(writer),
            counters,
            icmp,
            compression: options.compression,
        });

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let worker_shared = shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("sst-worker-{worker_id}"))
                .spawn(move || worker_main(&worker_shared));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    {
                        let mut ring = shared.ring.lock();
                        ring.finish = true;
                        ring.abort = true;
                    }
                    shared.cv.notify_all();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(TableError::Io(format!("spawn table worker: {err}")));
                }
            }
        }

        log::debug!(
            "table builder started: ring={ring_size} workers={worker_count} priority={}",
            options.priority_level
        );

        Ok(Self {
            shared,
            workers,
            failed,
            current: BlockWork::new(options.restart_interval),
            in_block: false,
            key_scratch: Vec::new(),
            block_size: options.block_size,
            restart_interval: options.restart_interval,
            has_filter: options.filter_policy.is_some(),
            stall_micros: 0,
            closed: false,
        })
    }

    /// Append one record. Keys must arrive in increasing order under the
    /// internal comparator.
    pub fn add(&mut self, key: &InternalKey, value: &[u8]) -> Result<(), TableError> {
        if self.closed {
            debug_assert!(!self.closed, "add on closed table builder");
            return Err(TableError::InvalidArgument("add on closed table builder"));
        }
        if self.failed.load(Ordering::Acquire) {
            return self.shared.writer.lock().status();
        }

        let mut encoded = mem::take(&mut self.key_scratch);
        encoded.clear();
        key.encode_into(&mut encoded);

        if self.in_block {
            debug_assert_eq!(
                self.shared.icmp.compare(&self.current.last_key, &encoded),
                std::cmp::Ordering::Less
            );
        } else {
            self.open_slot(&encoded);
        }

        // Everything below runs without a lock: the producer owns the
        // loading block exclusively.
        if self.has_filter {
            self.current.filter_lengths.push(encoded.len());
            self.current.filter_keys.extend_from_slice(&encoded);
        }
        self.current.last_key.clear();
        self.current.last_key.extend_from_slice(&encoded);
        self.current.block.add(&encoded, value);

        let counters = &self.shared.counters;
        counters.inc(SstCounter::Keys);
        counters.add(SstCounter::KeySize, encoded.len() as u64);
        counters.add(SstCounter::ValueSize, value.len() as u64);
        counters.observe_max(SstCounter::KeyLargest, encoded.len() as u64);
        counters.observe_min(SstCounter::KeySmallest, encoded.len() as u64);
        counters.observe_max(SstCounter::ValueLargest, value.len() as u64);
        counters.observe_min(SstCounter::ValueSmallest, value.len() as u64);

        self.key_scratch = encoded;

        if self.current.block.current_size_estimate() >= self.block_size {
            self.flush();
        }
        Ok(())
    }

    /// Claim the slot at `add_idx` for a new block and shorten the previous
    /// block's index key now that its upper bound is known.
    fn open_slot(&mut self, first_key: &[u8]) {
        let mut ring = self.shared.ring.lock();
        if ring.slots[ring.add_idx].state != SlotState::Empty {
            let stalled = Instant::now();
            while ring.slots[ring.add_idx].state != SlotState::Empty {
                self.shared.cv.wait(&mut ring);
            }
            self.stall_micros += stalled.elapsed().as_micros() as u64;
        }

        let n = ring.slots.len();
        let add_idx = ring.add_idx;
        debug_assert!(self.current.block.is_empty());
        ring.slots[add_idx].state = SlotState::Loading;
        if let Some(recycled) = ring.slots[add_idx].work.take() {
            self.current = recycled;
        }

        let prev = (add_idx + n - 1) % n;
        if ring.slots[prev].state != SlotState::Empty {
            debug_assert!(!ring.slots[prev].key_shortened);
            let mut last_key = mem::take(&mut ring.slots[prev].last_key);
            self.shared.icmp.find_shortest_separator(&mut last_key, first_key);
            let slot = &mut ring.slots[prev];
            slot.last_key = last_key;
            slot.key_shortened = true;
            if slot.state == SlotState::KeyWait {
                slot.state = SlotState::Ready;
                self.shared.cv.notify_all();
            }
        }
        drop(ring);
        self.in_block = true;
    }

    /// Hand the in-progress block to the workers. A no-op when no records
    /// were added since the last flush.
    pub fn flush(&mut self) {
        if self.closed || !self.in_block {
            return;
        }
        let mut ring = self.shared.ring.lock();
        let add_idx = ring.add_idx;
        debug_assert_eq!(ring.slots[add_idx].state, SlotState::Loading);

        let work = mem::replace(&mut self.current, BlockWork::new(self.restart_interval));
        let slot = &mut ring.slots[add_idx];
        slot.last_key.clear();
        slot.last_key.extend_from_slice(&work.last_key);
        slot.work = Some(work);
        slot.state = SlotState::Full;
        ring.add_idx = (add_idx + 1) % ring.slots.len();
        self.shared.cv.notify_all();
        drop(ring);
        self.in_block = false;
    }

    /// Drain the pipeline and write the table's meta blocks and footer.
    pub fn finish(&mut self) -> Result<(), TableError> {
        if self.closed {
            return Err(TableError::InvalidArgument("finish on closed table builder"));
        }
        self.flush();
        {
            let mut ring = self.shared.ring.lock();
            ring.finish = true;
        }
        self.shared.cv.notify_all();
        self.join_workers();
        self.closed = true;

        log::debug!(
            "table builder finished: {} keys, {} blocks, producer stalled {}us",
            self.shared.counters.value(SstCounter::Keys),
            self.shared.counters.value(SstCounter::Blocks),
            self.stall_micros
        );

        self.shared.writer.lock().finish()
    }

    /// Stop without writing a footer; the caller unlinks the file.
    pub fn abandon(&mut self) {
        if self.closed {
            return;
        }
        {
            let mut ring = self.shared.ring.lock();
            ring.finish = true;
            ring.abort = true;
        }
        self.shared.cv.notify_all();
        self.join_workers();
        self.closed = true;
        self.shared.writer.lock().abandon();
        log::debug!("table builder abandoned after {} keys", self.num_entries());
    }

    fn join_workers(&mut self) {
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                self.shared
                    .writer
                    .lock()
                    .latch(TableError::Corruption("table worker thread panicked"));
            }
        }
    }

    pub fn status(&self) -> Result<(), TableError> {
        self.shared.writer.lock().status()
    }

    pub fn num_entries(&self) -> u64 {
        self.shared.counters.value(SstCounter::Keys)
    }

    pub fn file_size(&self) -> u64 {
        self.shared.writer.lock().file_size()
    }

    /// Microseconds the producer spent blocked waiting for a free slot.
    pub fn stall_micros(&self) -> u64 {
        self.stall_micros
    }

    pub fn sync(&self) -> Result<(), TableError> {
        self.shared.writer.lock().sync()
    }
}

impl Drop for TableBuilder {
    fn drop(&mut self) {
        if !self.closed {
            self.abandon();
        }
    }
}

enum Claim {
    Compress(BlockWork),
    Write {
        work: BlockWork,
        last_key: Vec<u8>,
        comp_type: Compression,
        crc: u32,
    },
}

fn worker_main(shared: &Arc<Shared>) {
    loop {
        let (idx, claim) = {
            let mut ring = shared.ring.lock();
            loop {
                if ring.abort {
                    return;
                }
                let all_empty = ring
                    .slots
                    .iter()
                    .all(|slot| slot.state == SlotState::Empty);
                if ring.finish && all_empty {
                    return;
                }

                if let Some((idx, is_write)) = scan_for_work(shared, &mut ring) {
                    let slot = &mut ring.slots[idx];
                    let work = slot.work.take().expect("claimed slot holds parked work");
                    let claim = if is_write {
                        Claim::Write {
                            work,
                            last_key: mem::take(&mut slot.last_key),
                            comp_type: slot.comp_type,
                            crc: slot.crc,
                        }
                    } else {
                        Claim::Compress(work)
                    };
                    break (idx, claim);
                }
                shared.cv.wait(&mut ring);
            }
        };

        match claim {
            Claim::Compress(work) => compress_phase(shared, idx, work),
            Claim::Write {
                work,
                last_key,
                comp_type,
                crc,
            } => write_phase(shared, idx, work, last_key, comp_type, crc),
        }
    }
}

/// Scan slots starting at `write_idx`, claiming in priority order: the
/// write-ready slot at `write_idx`, any full slot, or — when finishing —
/// the final block still waiting for its index key.
fn scan_for_work(shared: &Arc<Shared>, ring: &mut Ring) -> Option<(usize, bool)> {
    let n = ring.slots.len();
    for i in 0..n {
        let idx = (ring.write_idx + i) % n;
        let state = ring.slots[idx].state;

        if idx == ring.write_idx && state == SlotState::Ready {
            ring.slots[idx].state = SlotState::Writing;
            return Some((idx, true));
        }
        if state == SlotState::Full {
            ring.slots[idx].state = SlotState::Compressing;
            return Some((idx, false));
        }
        if ring.finish
            && idx == ring.write_idx
            && state == SlotState::KeyWait
            && ring.slots[(idx + 1) % n].state == SlotState::Empty
        {
            // No successor block will ever supply a separator: this is the
            // last block. Close its index key with the short successor.
            debug_assert!(!ring.slots[idx].key_shortened);
            let mut last_key = mem::take(&mut ring.slots[idx].last_key);
            shared.icmp.find_short_successor(&mut last_key);
            let slot = &mut ring.slots[idx];
            slot.last_key = last_key;
            slot.key_shortened = true;
            slot.state = SlotState::Writing;
            return Some((idx, true));
        }
    }
    None
}

/// Serialize, compress, and checksum a full block; order-independent across
/// slots.
fn compress_phase(shared: &Arc<Shared>, idx: usize, mut work: BlockWork) {
    let counters = &shared.counters;
    work.block.finish();
    counters.inc(SstCounter::Blocks);
    counters.add(SstCounter::BlockSize, work.block.buffer().len() as u64);

    let (replacement, comp_type) = compress_block(work.block.buffer(), shared.compression, counters);
    if let Some(compressed) = replacement {
        work.block.overwrite(compressed);
    }
    counters.add(SstCounter::BlockWriteSize, work.block.buffer().len() as u64);
    let crc = block_crc(work.block.buffer(), comp_type);

    let mut ring = shared.ring.lock();
    {
        let slot = &mut ring.slots[idx];
        slot.comp_type = comp_type;
        slot.crc = crc;
    }
    if ring.slots[idx].key_shortened {
        if idx == ring.write_idx {
            // Head of the write queue: keep the block claimed and go
            // straight to the write phase.
            ring.slots[idx].state = SlotState::Writing;
            let last_key = mem::take(&mut ring.slots[idx].last_key);
            drop(ring);
            write_phase(shared, idx, work, last_key, comp_type, crc);
            return;
        }
        ring.slots[idx].state = SlotState::Ready;
    } else {
        ring.slots[idx].state = SlotState::KeyWait;
    }
    ring.slots[idx].work = Some(work);
    drop(ring);
    shared.cv.notify_all();
}

/// Commit one block. Only the short serial section (space reservation,
/// filter anchor, index entry) holds the write position; the payload copy
/// overlaps the next block's serial section.
fn write_phase(
    shared: &Arc<Shared>,
    idx: usize,
    mut work: BlockWork,
    last_key: Vec<u8>,
    comp_type: Compression,
    crc: u32,
) {
    let region = {
        let mut writer = shared.writer.lock();
        if writer.ok() {
            match writer.begin_block(work.block.buffer().len()) {
                Ok((region, handle)) => {
                    writer.apply_filter(&work.filter_lengths, &work.filter_keys);
                    writer.append_index(&last_key, &handle);
                    Some(region)
                }
                // begin_block latched the error; keep draining the ring so
                // the producer and finish() unblock.
                Err(_) => None,
            }
        } else {
            None
        }
    };

    // Release the serial write position before copying the payload.
    {
        let mut ring = shared.ring.lock();
        ring.slots[idx].state = SlotState::Copying;
        ring.write_idx = (idx + 1) % ring.slots.len();
    }
    shared.cv.notify_all();

    if let Some(mut region) = region {
        let result = region.append(work.block.buffer()).and_then(|()| {
            let mut trailer = [0u8; BLOCK_TRAILER_SIZE];
            trailer[0] = comp_type as u8;
            trailer[1..].copy_from_slice(&mask_crc(crc).to_le_bytes());
            region.append(&trailer)
        });
        if let Err(err) = result {
            shared.writer.lock().latch(err);
        }
    }

    // Return the cleared buffers to the ring for the producer to reuse.
    work.reset();
    {
        let mut ring = shared.ring.lock();
        let slot = &mut ring.slots[idx];
        slot.work = Some(work);
        slot.reset_meta();
    }
    shared.cv.notify_all();
}
