use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use proptest::prelude::*;

use sstpipe::sst::BLOCK_TRAILER_SIZE;
use sstpipe::{
    build_table, table_filename, BytewiseComparator, Comparator, Compression, FileMetaData,
    InternalKey, InternalKeyComparator, KeyKind, Options, ReaderTableCache, TableError,
    TableReader,
};
use tempfile::TempDir;

#[derive(Debug, Clone)]
struct BuildCase {
    records: Vec<(InternalKey, Bytes)>,
    block_size: usize,
    ring_size: usize,
    worker_count: usize,
    compression: Compression,
    smallest_snapshot: u64,
    drop_tombstones: bool,
}

fn case_strategy() -> impl Strategy<Value = BuildCase> {
    let keyed_seqnos = prop::collection::btree_map(
        "[a-p]{1,10}",
        prop::collection::btree_set(1u64..100, 1..4),
        1..60,
    );
    (
        keyed_seqnos,
        64usize..2048,
        2usize..5,
        1usize..4,
        prop::bool::ANY,
        0u64..120,
        prop::bool::ANY,
    )
        .prop_map(
            |(keyed, block_size, ring_size, worker_count, snappy, floor, drop_tombstones)| {
                let mut records = Vec::new();
                for (user, seqnos) in keyed {
                    // Stream order is (user_key ASC, seqno DESC).
                    for &seqno in seqnos.iter().rev() {
                        let kind = if seqno % 3 == 0 {
                            KeyKind::Del
                        } else {
                            KeyKind::Put
                        };
                        let value = match kind {
                            KeyKind::Del => Bytes::new(),
                            KeyKind::Put => {
                                Bytes::from(format!("value:{user}:{seqno}").into_bytes())
                            }
                        };
                        records.push((
                            InternalKey::new(
                                Bytes::copy_from_slice(user.as_bytes()),
                                seqno,
                                kind,
                            ),
                            value,
                        ));
                    }
                }
                BuildCase {
                    records,
                    block_size,
                    ring_size,
                    worker_count,
                    compression: if snappy {
                        Compression::Snappy
                    } else {
                        Compression::None
                    },
                    smallest_snapshot: floor,
                    drop_tombstones,
                }
            },
        )
}

/// Reference model of the retirement filter.
fn expected_survivors(case: &BuildCase) -> Vec<(InternalKey, Bytes)> {
    let mut kept = Vec::new();
    let mut per_key: BTreeMap<&[u8], u64> = BTreeMap::new();
    for (key, value) in &case.records {
        let last_seqno = per_key
            .get(key.user_key.as_ref())
            .copied()
            .unwrap_or(u64::MAX);
        let drop = if last_seqno <= case.smallest_snapshot {
            true
        } else {
            key.kind == KeyKind::Del
                && key.seqno <= case.smallest_snapshot
                && case.drop_tombstones
        };
        per_key.insert(key.user_key.as_ref(), key.seqno);
        if !drop {
            kept.push((key.clone(), value.clone()));
        }
    }
    kept
}

fn run_case(case: &BuildCase) -> anyhow::Result<(FileMetaData, Option<TempDir>)> {
    let dir = TempDir::new()?;
    let options = Options {
        block_size: case.block_size,
        ring_size: case.ring_size,
        worker_count: case.worker_count,
        compression: case.compression,
        ..Options::default()
    };
    let mut meta = FileMetaData::new(1, 0);
    build_table(
        dir.path(),
        &options,
        Arc::new(BytewiseComparator),
        &ReaderTableCache::new(options.clone()),
        case.records.clone().into_iter().map(Ok),
        &mut meta,
        case.smallest_snapshot,
        case.drop_tombstones,
    )?;
    Ok((meta, Some(dir)))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// §8 properties 1-5 and 7 over randomized inputs and pipeline shapes.
    #[test]
    fn pipeline_output_is_correct(case in case_strategy()) {
        let (meta, dir) = run_case(&case).expect("build table");
        let dir = dir.expect("table dir");
        let options = Options {
            block_size: case.block_size,
            compression: case.compression,
            ..Options::default()
        };
        let path = table_filename(dir.path(), meta.number, meta.level);
        let reader = TableReader::open(&path, &options).expect("open table");

        // Round-trip: exactly the records the retirement filter kept, in
        // order. Block CRCs are verified on every read.
        let expected = expected_survivors(&case);
        let decoded: Vec<(InternalKey, Bytes)> = reader
            .iter()
            .collect::<Result<_, _>>()
            .expect("iterate table");
        prop_assert_eq!(&decoded, &expected);
        prop_assert_eq!(meta.num_entries, expected.len() as u64);

        // Offset monotonicity: blocks tile the data section exactly.
        let index = reader.index_entries().expect("index");
        prop_assert_eq!(index.is_empty(), expected.is_empty());
        for pair in index.windows(2) {
            prop_assert_eq!(
                pair[1].1.offset,
                pair[0].1.offset + pair[0].1.size + BLOCK_TRAILER_SIZE as u64
            );
        }

        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));

        // Index keys are strictly increasing.
        for pair in index.windows(2) {
            prop_assert_eq!(
                icmp.compare(&pair[0].0, &pair[1].0),
                std::cmp::Ordering::Less
            );
        }

        // Each index key bounds its block: >= the block's last key and
        // < the next block's first key.
        let mut block_bounds = Vec::new();
        for (_, handle) in &index {
            let block = reader.read_block(*handle).expect("read block");
            let keys: Vec<Vec<u8>> = block
                .iter()
                .map(|entry| entry.map(|(k, _)| k.to_vec()))
                .collect::<Result<_, TableError>>()
                .expect("block entries");
            prop_assert!(!keys.is_empty());
            block_bounds.push((keys[0].clone(), keys[keys.len() - 1].clone()));
        }
        for (i, (index_key, _)) in index.iter().enumerate() {
            let (_, last_in_block) = &block_bounds[i];
            prop_assert_ne!(
                icmp.compare(index_key, last_in_block),
                std::cmp::Ordering::Less
            );
            if i + 1 < block_bounds.len() {
                let (first_in_next, _) = &block_bounds[i + 1];
                prop_assert_eq!(
                    icmp.compare(index_key, first_in_next),
                    std::cmp::Ordering::Less
                );
            }
        }

        // Final-block shortening: the last index key is the short successor
        // of that block's last key; earlier index keys are the separator
        // with the next block's first key.
        if let Some((last_index_key, _)) = index.last() {
            let (_, last_in_block) = &block_bounds[block_bounds.len() - 1];
            let mut expected_key = last_in_block.clone();
            icmp.find_short_successor(&mut expected_key);
            prop_assert_eq!(last_index_key, &expected_key);
        }
        for i in 0..index.len().saturating_sub(1) {
            let (_, last_in_block) = &block_bounds[i];
            let (first_in_next, _) = &block_bounds[i + 1];
            let mut expected_key = last_in_block.clone();
            icmp.find_shortest_separator(&mut expected_key, first_in_next);
            prop_assert_eq!(&index[i].0, &expected_key);
        }
    }

    /// §8 property 5: for fixed input and options the output is
    /// byte-identical, for any worker count.
    #[test]
    fn pipeline_output_is_deterministic(case in case_strategy()) {
        let build_bytes = |worker_count: usize| -> anyhow::Result<Vec<u8>> {
            let dir = TempDir::new()?;
            let options = Options {
                block_size: case.block_size,
                ring_size: case.ring_size,
                worker_count,
                compression: case.compression,
                ..Options::default()
            };
            let mut meta = FileMetaData::new(1, 0);
            build_table(
                dir.path(),
                &options,
                Arc::new(BytewiseComparator),
                &ReaderTableCache::new(options.clone()),
                case.records.clone().into_iter().map(Ok),
                &mut meta,
                case.smallest_snapshot,
                case.drop_tombstones,
            )?;
            Ok(std::fs::read(table_filename(dir.path(), 1, 0))?)
        };

        let serial = build_bytes(1).expect("serial build");
        let serial_again = build_bytes(1).expect("serial rebuild");
        let parallel = build_bytes(3).expect("parallel build");
        prop_assert_eq!(&serial, &serial_again);
        prop_assert_eq!(&serial, &parallel);
    }
}
