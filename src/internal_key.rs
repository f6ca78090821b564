//! Internal key encoding and ordering.
//!
//! An internal key is `(user_key, seqno, kind)`. Keys order by
//! `(user_key ASC, seqno DESC, kind DESC)` so that for a single user key the
//! newest entry sorts first. Range operations carry an *exclusive sentinel*
//! as their upper bound: a key with the maximum sequence number and a range
//! kind, which sorts after every non-sentinel key with the same user key
//! when comparing table bounds.

use std::cmp::Ordering;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Largest assignable sequence number. Reserved for exclusive sentinels;
/// the commit pipeline never allocates it.
pub const SEQNO_MAX: u64 = (1 << 56) - 1;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("internal key truncated")]
    Truncated,
    #[error("unknown key kind: {0}")]
    UnknownKind(u8),
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum KeyKind {
    /// Reserved for corruption detection; never written by a well-formed
    /// producer.
    Invalid = 0,
    Delete = 1,
    Set = 2,
    RangeDelete = 3,
    RangeKeySet = 4,
}

impl KeyKind {
    pub fn from_u8(raw: u8) -> Result<Self, DecodeError> {
        match raw {
            0 => Ok(KeyKind::Invalid),
            1 => Ok(KeyKind::Delete),
            2 => Ok(KeyKind::Set),
            3 => Ok(KeyKind::RangeDelete),
            4 => Ok(KeyKind::RangeKeySet),
            other => Err(DecodeError::UnknownKind(other)),
        }
    }

    pub fn is_range(self) -> bool {
        matches!(self, KeyKind::RangeDelete | KeyKind::RangeKeySet)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InternalKey {
    pub user_key: Bytes,
    pub seqno: u64,
    pub kind: KeyKind,
}

impl InternalKey {
    pub fn new(user_key: impl Into<Bytes>, seqno: u64, kind: KeyKind) -> Self {
        Self {
            user_key: user_key.into(),
            seqno,
            kind,
        }
    }

    /// Exclusive upper bound for a range operation ending at `user_key`.
    pub fn range_end_sentinel(user_key: impl Into<Bytes>, kind: KeyKind) -> Self {
        debug_assert!(kind.is_range());
        Self::new(user_key, SEQNO_MAX, kind)
    }

    /// Smallest possible internal key for `user_key`; everything stored
    /// under that user key sorts at or after it.
    pub fn search_bound(user_key: impl Into<Bytes>) -> Self {
        Self::new(user_key, SEQNO_MAX, KeyKind::RangeKeySet)
    }

    pub fn is_exclusive_sentinel(&self) -> bool {
        self.seqno == SEQNO_MAX && self.kind.is_range()
    }

    /// Same user key and kind at a different sequence number.
    pub fn with_seqno(&self, seqno: u64) -> Self {
        Self::new(self.user_key.clone(), seqno, self.kind)
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let klen: u32 = self.user_key.len().try_into().expect("user key fits u32");
        buf.extend_from_slice(&klen.to_le_bytes());
        buf.extend_from_slice(&self.user_key);
        buf.extend_from_slice(&self.seqno.to_le_bytes());
        buf.push(self.kind as u8);
    }

    /// Decodes one key from the front of `data`, returning the remainder.
    pub fn decode(data: &[u8]) -> Result<(Self, &[u8]), DecodeError> {
        if data.len() < 4 {
            return Err(DecodeError::Truncated);
        }
        let klen = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
        let rest = &data[4..];
        if rest.len() < klen + 8 + 1 {
            return Err(DecodeError::Truncated);
        }
        let user_key = Bytes::copy_from_slice(&rest[..klen]);
        let seqno = u64::from_le_bytes(rest[klen..klen + 8].try_into().unwrap());
        let kind = KeyKind::from_u8(rest[klen + 8])?;
        Ok((Self::new(user_key, seqno, kind), &rest[klen + 9..]))
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.user_key
            .cmp(&other.user_key)
            .then_with(|| other.seqno.cmp(&self.seqno))
            .then_with(|| other.kind.cmp(&self.kind))
    }
}

/// Bounds comparison between table keys: user key first, ties broken only by
/// the exclusive-sentinel marker. A non-sentinel compares less than a
/// sentinel with the same user key; two keys with the same user key and the
/// same sentinel-ness are equal for bounds purposes.
pub fn table_key_cmp(a: &InternalKey, b: &InternalKey) -> Ordering {
    let c = a.user_key.cmp(&b.user_key);
    if c != Ordering::Equal {
        return c;
    }
    match (a.is_exclusive_sentinel(), b.is_exclusive_sentinel()) {
        (false, true) => Ordering::Less,
        (true, false) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

/// A range span: `[start.user_key, end)` with `end` exclusive. Spans are
/// pre-fragmented and non-overlapping within a single producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: InternalKey,
    pub end: Bytes,
}

impl Span {
    pub fn new(start: InternalKey, end: impl Into<Bytes>) -> Self {
        Self {
            start,
            end: end.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start.user_key.as_ref() >= self.end.as_ref()
    }

    pub fn contains(&self, user_key: &[u8]) -> bool {
        self.start.user_key.as_ref() <= user_key && user_key < self.end.as_ref()
    }

    /// Exclusive upper bound of this span as an internal key.
    pub fn end_sentinel(&self) -> InternalKey {
        InternalKey::range_end_sentinel(self.end.clone(), self.start.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_user_key_then_seqno_desc() {
        let a = InternalKey::new(Bytes::from("a"), 5, KeyKind::Set);
        let a_newer = InternalKey::new(Bytes::from("a"), 9, KeyKind::Set);
        let b = InternalKey::new(Bytes::from("b"), 1, KeyKind::Set);
        assert!(a_newer < a);
        assert!(a < b);
        assert!(a_newer < b);
    }

    #[test]
    fn sentinel_compares_greater_for_bounds() {
        let point = InternalKey::new(Bytes::from("k"), 7, KeyKind::Set);
        let sentinel = InternalKey::range_end_sentinel(Bytes::from("k"), KeyKind::RangeDelete);
        assert_eq!(table_key_cmp(&point, &sentinel), Ordering::Less);
        assert_eq!(table_key_cmp(&sentinel, &point), Ordering::Greater);
        assert_eq!(table_key_cmp(&point, &point), Ordering::Equal);
        assert_eq!(table_key_cmp(&sentinel, &sentinel), Ordering::Equal);
    }

    #[test]
    fn sentinel_requires_range_kind_and_max_seqno() {
        let sentinel = InternalKey::range_end_sentinel(Bytes::from("x"), KeyKind::RangeKeySet);
        assert!(sentinel.is_exclusive_sentinel());
        let not_max = InternalKey::new(Bytes::from("x"), 3, KeyKind::RangeDelete);
        assert!(!not_max.is_exclusive_sentinel());
        let not_range = InternalKey::new(Bytes::from("x"), SEQNO_MAX, KeyKind::Set);
        assert!(!not_range.is_exclusive_sentinel());
    }

    #[test]
    fn encode_decode_roundtrip() {
        let key = InternalKey::new(Bytes::from("hello"), 42, KeyKind::Delete);
        let mut buf = Vec::new();
        key.encode_into(&mut buf);
        buf.extend_from_slice(b"tail");
        let (decoded, rest) = InternalKey::decode(&buf).expect("decode");
        assert_eq!(decoded, key);
        assert_eq!(rest, b"tail");
    }

    #[test]
    fn search_bound_sorts_before_stored_keys() {
        let bound = InternalKey::search_bound(Bytes::from("m"));
        let stored = InternalKey::new(Bytes::from("m"), 100, KeyKind::Set);
        assert!(bound < stored);
    }
}
