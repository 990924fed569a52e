//! The table construction driver.
//!
//! [`build_table`] consumes a sorted record stream and produces one
//! self-contained table file, used both when flushing the write buffer to
//! level 0 and when merging tables during compaction. The driver owns the
//! surrounding concerns — file naming, the retirement filter, syncing,
//! post-build verification through the table cache, and deleting the file
//! on failure or empty input — while the builder owns the bytes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use crate::comparator::{Comparator, InternalKeyComparator};
use crate::internal_key::InternalKey;
use crate::options::Options;
use crate::sst::file::TableFile;
use crate::sst::pipeline::TableBuilder;
use crate::sst::reader::TableReader;
use crate::sst::retire::KeyRetirement;
use crate::sst::TableError;

/// Metadata for one table file. `number` and `level` are assigned by the
/// caller; the rest is filled in by [`build_table`].
#[derive(Debug, Clone, Default)]
pub struct FileMetaData {
    pub number: u64,
    pub level: u8,
    pub file_size: u64,
    pub num_entries: u64,
    pub smallest: Option<InternalKey>,
    pub largest: Option<InternalKey>,
}

impl FileMetaData {
    pub fn new(number: u64, level: u8) -> Self {
        Self {
            number,
            level,
            ..Self::default()
        }
    }
}

/// Tables live in per-level subdirectories of the database directory.
pub fn table_filename(dbname: &Path, number: u64, level: u8) -> PathBuf {
    dbname
        .join(format!("sst_{level}"))
        .join(format!("{number:06}.sst"))
}

/// The engine's table cache, seen through the one operation the driver
/// needs: proving a finished table is readable.
pub trait TableCache {
    fn verify(&self, path: &Path, file_size: u64) -> Result<(), TableError>;
}

/// Cache stand-in that opens the table with a fresh reader and walks every
/// block.
pub struct ReaderTableCache {
    options: Options,
}

impl ReaderTableCache {
    pub fn new(options: Options) -> Self {
        Self { options }
    }
}

impl TableCache for ReaderTableCache {
    fn verify(&self, path: &Path, _file_size: u64) -> Result<(), TableError> {
        TableReader::open(path, &self.options)?.verify()?;
        Ok(())
    }
}

/// Build the table file for `meta` from a sorted record stream.
///
/// Records the retirement filter drops never reach the builder, so they
/// influence neither index keys nor filter bits. Iterator errors are
/// surfaced after the builder is finished or abandoned. On any failure, or
/// when the input is empty, no file is left on disk.
#[allow(clippy::too_many_arguments)]
pub fn build_table<I>(
    dbname: &Path,
    options: &Options,
    user_comparator: Arc<dyn Comparator>,
    table_cache: &dyn TableCache,
    source: I,
    meta: &mut FileMetaData,
    smallest_snapshot: u64,
    drop_tombstones: bool,
) -> Result<(), TableError>
where
    I: IntoIterator<Item = Result<(InternalKey, Bytes), TableError>>,
{
    meta.file_size = 0;
    meta.num_entries = 0;
    meta.smallest = None;
    meta.largest = None;

    let mut source = source.into_iter().peekable();
    if source.peek().is_none() {
        return Ok(());
    }

    let fname = table_filename(dbname, meta.number, meta.level);
    if let Some(parent) = fname.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut retire = KeyRetirement::new(user_comparator.clone(), smallest_snapshot, drop_tombstones);
    let icmp = InternalKeyComparator::new(user_comparator);

    let result = build_and_verify(
        &fname,
        options,
        icmp,
        table_cache,
        &mut source,
        &mut retire,
        meta,
    );
    if result.is_err() || meta.file_size == 0 {
        let _ = std::fs::remove_file(&fname);
    }
    result
}

fn build_and_verify<I>(
    fname: &Path,
    options: &Options,
    icmp: InternalKeyComparator,
    table_cache: &dyn TableCache,
    source: &mut std::iter::Peekable<I>,
    retire: &mut KeyRetirement,
    meta: &mut FileMetaData,
) -> Result<(), TableError>
where
    I: Iterator<Item = Result<(InternalKey, Bytes), TableError>>,
{
    let file = TableFile::create(fname, options.write_buffer_size)?;
    let mut options = options.clone();
    options.priority_level = meta.level;
    let mut builder = TableBuilder::new(&options, icmp, file)?;
    fill_table(&mut builder, source, retire, meta)?;
    table_cache.verify(fname, meta.file_size)
}

fn fill_table<I>(
    builder: &mut TableBuilder,
    source: &mut std::iter::Peekable<I>,
    retire: &mut KeyRetirement,
    meta: &mut FileMetaData,
) -> Result<(), TableError>
where
    I: Iterator<Item = Result<(InternalKey, Bytes), TableError>>,
{
    let mut source_status: Result<(), TableError> = Ok(());

    for item in source {
        let (key, value) = match item {
            Ok(record) => record,
            Err(err) => {
                source_status = Err(err);
                break;
            }
        };
        if meta.smallest.is_none() {
            meta.smallest = Some(key.clone());
        }
        if retire.retire(&key) {
            continue;
        }
        builder.add(&key, &value)?;
        meta.largest = Some(key);
        meta.num_entries += 1;
    }

    if source_status.is_err() {
        builder.abandon();
        return source_status;
    }

    builder.finish()?;
    let timer = Instant::now();
    builder.sync()?;
    log::debug!(
        "table {} sync micros: {}",
        meta.number,
        timer.elapsed().as_micros()
    );
    meta.file_size = builder.file_size();
    debug_assert!(meta.file_size > 0);

    if retire.dropped() > 0 {
        log::debug!(
            "table {} retired {} shadowed records",
            meta.number,
            retire.dropped()
        );
    }
    Ok(())
}
