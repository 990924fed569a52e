//! `sstpipe` builds the sorted-table (SST) files of a log-structured
//! merge-tree storage engine.
//!
//! The centerpiece is a pipelined builder that overlaps record loading,
//! block compression, and file writing across a ring of block slots driven
//! by worker threads, while still emitting a byte-exact sequential file:
//! block offsets, index entries, and filter groups are assigned strictly in
//! producer order. See [`sst::pipeline`] for the design.
//!
//! The crate is used through [`build_table`], which consumes a sorted
//! record stream, applies the key-retirement filter, drives the pipeline,
//! and verifies the finished file through the engine's table cache.

pub mod build;
pub mod coding;
pub mod comparator;
pub mod counters;
pub mod internal_key;
pub mod options;
pub mod sst;

pub use build::{build_table, table_filename, FileMetaData, ReaderTableCache, TableCache};
pub use comparator::{BytewiseComparator, Comparator, InternalKeyComparator};
pub use internal_key::{InternalKey, KeyKind};
pub use options::Options;
pub use sst::filter::{BloomFilterPolicy, FilterPolicy};
pub use sst::{Compression, TableBuilder, TableError, TableReader};
