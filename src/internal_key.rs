//! Internal key format and ordering.
//!
//! Records are ordered by the tuple `(user_key ASC, seqno DESC, kind DESC)`.
//! On disk an internal key is the user key followed by a packed 8-byte tag:
//!
//! ```text
//! [user_key bytes][fixed64_le(seqno << 8 | kind)]
//! ```
//!
//! The tag layout is what the table reader expects, so it must not change.

use bytes::Bytes;
use std::cmp::Ordering;

use crate::coding;

/// Sequence numbers occupy 56 bits of the packed tag.
pub const MAX_SEQNO: u64 = (1 << 56) - 1;

/// Tag appended by the comparator shortening hooks. Sorts before every real
/// entry for the same user key.
pub const MAX_TAG: u64 = (MAX_SEQNO << 8) | (KeyKind::Put as u64);

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated input")]
    Truncated,

    #[error("unknown key kind: {0}")]
    UnknownKind(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyKind {
    /// A tombstone for a point key.
    Del = 0,
    /// A point key/value.
    Put = 1,
}

impl KeyKind {
    pub fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(Self::Del),
            1 => Ok(Self::Put),
            other => Err(DecodeError::UnknownKind(other)),
        }
    }

    pub fn is_tombstone(self) -> bool {
        matches!(self, Self::Del)
    }
}

/// Internal key `(user_key, seqno, kind)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InternalKey {
    pub user_key: Bytes,
    pub seqno: u64,
    pub kind: KeyKind,
}

impl InternalKey {
    pub fn new(user_key: Bytes, seqno: u64, kind: KeyKind) -> Self {
        Self {
            user_key,
            seqno,
            kind,
        }
    }

    pub fn tag(&self) -> u64 {
        pack_tag(self.seqno, self.kind)
    }

    pub fn encoded_len(&self) -> usize {
        self.user_key.len() + 8
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.user_key.as_ref());
        coding::put_fixed64(buf, self.tag());
    }

    /// Decode a full encoded internal key (the slice is exactly one key).
    pub fn decode(input: &[u8]) -> Result<Self, DecodeError> {
        if input.len() < 8 {
            return Err(DecodeError::Truncated);
        }
        let split = input.len() - 8;
        let tag = coding::decode_fixed64(&input[split..]);
        let (seqno, kind) = unpack_tag(tag)?;
        Ok(Self {
            user_key: Bytes::copy_from_slice(&input[..split]),
            seqno,
            kind,
        })
    }
}

pub fn pack_tag(seqno: u64, kind: KeyKind) -> u64 {
    debug_assert!(seqno <= MAX_SEQNO);
    (seqno << 8) | (kind as u64)
}

pub fn unpack_tag(tag: u64) -> Result<(u64, KeyKind), DecodeError> {
    let kind = KeyKind::from_u8((tag & 0xff) as u8)?;
    Ok((tag >> 8, kind))
}

/// The user-key prefix of an encoded internal key.
pub fn user_key(encoded: &[u8]) -> &[u8] {
    debug_assert!(encoded.len() >= 8);
    &encoded[..encoded.len() - 8]
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.user_key.cmp(&other.user_key) {
            Ordering::Equal => match other.seqno.cmp(&self.seqno) {
                Ordering::Equal => (other.kind as u8).cmp(&(self.kind as u8)),
                other => other,
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_key_ordering() {
        let k1 = InternalKey::new(Bytes::from_static(b"a"), 10, KeyKind::Put);
        let k2 = InternalKey::new(Bytes::from_static(b"a"), 9, KeyKind::Put);
        let k3 = InternalKey::new(Bytes::from_static(b"b"), 10, KeyKind::Put);

        assert!(k1 < k2);
        assert!(k2 < k3);
    }

    #[test]
    fn encode_roundtrip() {
        let key = InternalKey::new(Bytes::from_static(b"hello"), 42, KeyKind::Del);
        let enc = key.encode_to_vec();
        assert_eq!(enc.len(), key.encoded_len());
        let dec = InternalKey::decode(&enc).unwrap();
        assert_eq!(dec, key);
    }

    #[test]
    fn tag_packing() {
        let tag = pack_tag(MAX_SEQNO, KeyKind::Put);
        assert_eq!(tag, MAX_TAG);
        let (seqno, kind) = unpack_tag(tag).unwrap();
        assert_eq!(seqno, MAX_SEQNO);
        assert_eq!(kind, KeyKind::Put);
    }

    #[test]
    fn decode_rejects_short_input() {
        assert!(matches!(
            InternalKey::decode(b"short"),
            Err(DecodeError::Truncated)
        ));
    }
}
