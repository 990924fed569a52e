//! Key retirement.
//!
//! A stateful predicate over the sorted record stream that drops records no
//! live reader can observe, before they reach the table builder. Retired
//! keys therefore never influence block index keys or filter bits.

use std::cmp::Ordering;
use std::sync::Arc;

use bytes::Bytes;

use crate::comparator::Comparator;
use crate::internal_key::{InternalKey, MAX_SEQNO};

pub struct KeyRetirement {
    user_cmp: Arc<dyn Comparator>,
    smallest_snapshot: u64,
    /// Whether tombstones at or below the snapshot floor may be dropped.
    /// The builder cannot know if deeper levels still hold the key, so the
    /// caller decides.
    drop_tombstones: bool,
    current_user_key: Option<Bytes>,
    last_seqno_for_key: u64,
    dropped: u64,
}

impl KeyRetirement {
    pub fn new(user_cmp: Arc<dyn Comparator>, smallest_snapshot: u64, drop_tombstones: bool) -> Self {
        Self {
            user_cmp,
            smallest_snapshot,
            drop_tombstones,
            current_user_key: None,
            last_seqno_for_key: MAX_SEQNO,
            dropped: 0,
        }
    }

    /// True if `key` should be skipped. Must be called exactly once per
    /// record, in stream order.
    pub fn retire(&mut self, key: &InternalKey) -> bool {
        let same_key = self.current_user_key.as_ref().is_some_and(|prev| {
            self.user_cmp.compare(prev, &key.user_key) == Ordering::Equal
        });
        if !same_key {
            self.current_user_key = Some(key.user_key.clone());
            self.last_seqno_for_key = MAX_SEQNO;
        }

        let drop = if self.last_seqno_for_key <= self.smallest_snapshot {
            // Shadowed by the record already retained for this user key.
            true
        } else {
            key.kind.is_tombstone() && key.seqno <= self.smallest_snapshot && self.drop_tombstones
        };

        self.last_seqno_for_key = key.seqno;
        if drop {
            self.dropped += 1;
        }
        drop
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
