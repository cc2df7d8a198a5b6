//! Internal key format.
//!
//! Every record in the memtable and in table files carries an *internal*
//! key: the user key followed by a little-endian u64 packing the commit
//! sequence and the record kind:
//!
//! ```text
//! +----------+------------------------------+
//! | user key | (sequence << 8) | kind  (LE) |
//! +----------+------------------------------+
//! | variable |            8 bytes           |
//! +----------+------------------------------+
//! ```
//!
//! Internal keys order ascending by user key (user comparator) and, within
//! one user key, descending by sequence, so the newest version of a key is
//! encountered first.

use std::cmp::Ordering;

use byteorder::{ByteOrder, LittleEndian};

use crate::config::Comparator;
use crate::error::{Error, Result};

/// Monotone commit counter. Only the low 56 bits are usable; the top byte
/// of the packed tag holds the record kind.
pub type SeqNo = u64;

pub const MAX_SEQUENCE: SeqNo = (1 << 56) - 1;

const TAG_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueKind {
    Deletion = 0,
    Value = 1,
}

/// Kind used when building seek targets. `Value` packs above `Deletion`
/// for equal sequences, so seeking with it lands on the first record with
/// `seq <= snapshot`.
pub const KIND_FOR_SEEK: ValueKind = ValueKind::Value;

impl ValueKind {
    pub fn from_u8(v: u8) -> Result<ValueKind> {
        match v {
            0 => Ok(ValueKind::Deletion),
            1 => Ok(ValueKind::Value),
            other => Err(Error::Corruption(format!("unknown record kind: {other}"))),
        }
    }
}

pub fn pack_tag(seq: SeqNo, kind: ValueKind) -> u64 {
    debug_assert!(seq <= MAX_SEQUENCE);
    (seq << 8) | kind as u64
}

pub fn unpack_tag(tag: u64) -> Result<(SeqNo, ValueKind)> {
    let kind = ValueKind::from_u8((tag & 0xff) as u8)?;
    Ok((tag >> 8, kind))
}

/// Appends `user_key ‖ tag` to `dst`.
pub fn append_internal_key(dst: &mut Vec<u8>, user_key: &[u8], seq: SeqNo, kind: ValueKind) {
    dst.extend_from_slice(user_key);
    let mut tag = [0u8; TAG_LEN];
    LittleEndian::write_u64(&mut tag, pack_tag(seq, kind));
    dst.extend_from_slice(&tag);
}

pub fn make_internal_key(user_key: &[u8], seq: SeqNo, kind: ValueKind) -> Vec<u8> {
    let mut ikey = Vec::with_capacity(user_key.len() + TAG_LEN);
    append_internal_key(&mut ikey, user_key, seq, kind);
    ikey
}

/// The user-key portion of an internal key.
pub fn user_key(ikey: &[u8]) -> &[u8] {
    debug_assert!(ikey.len() >= TAG_LEN);
    &ikey[..ikey.len() - TAG_LEN]
}

/// The packed tag of an internal key.
pub fn tag(ikey: &[u8]) -> u64 {
    debug_assert!(ikey.len() >= TAG_LEN);
    LittleEndian::read_u64(&ikey[ikey.len() - TAG_LEN..])
}

/// Splits an internal key into its parts, validating the kind byte.
pub fn split_internal_key(ikey: &[u8]) -> Result<(&[u8], SeqNo, ValueKind)> {
    if ikey.len() < TAG_LEN {
        return Err(Error::corruption("internal key too short"));
    }
    let (seq, kind) = unpack_tag(tag(ikey))?;
    Ok((user_key(ikey), seq, kind))
}

/// Total order over internal keys: user key ascending per the comparator,
/// then packed tag descending so newer records sort first.
pub fn compare_internal(cmp: &dyn Comparator, a: &[u8], b: &[u8]) -> Ordering {
    match cmp.compare(user_key(a), user_key(b)) {
        Ordering::Equal => tag(b).cmp(&tag(a)),
        ord => ord,
    }
}

/// A seek target for point lookups: positioned at the newest record of
/// `user_key` visible at `seq`.
pub struct LookupKey {
    ikey: Vec<u8>,
}

impl LookupKey {
    pub fn new(user_key: &[u8], seq: SeqNo) -> Self {
        Self {
            ikey: make_internal_key(user_key, seq, KIND_FOR_SEEK),
        }
    }

    pub fn internal_key(&self) -> &[u8] {
        &self.ikey
    }

    pub fn user_key(&self) -> &[u8] {
        user_key(&self.ikey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BytewiseComparator;

    #[test]
    fn test_pack_roundtrip() {
        for seq in [0u64, 1, 99, MAX_SEQUENCE] {
            for kind in [ValueKind::Value, ValueKind::Deletion] {
                let (got_seq, got_kind) = unpack_tag(pack_tag(seq, kind)).unwrap();
                assert_eq!(got_seq, seq);
                assert_eq!(got_kind, kind);
            }
        }
    }

    #[test]
    fn test_split_internal_key() {
        let ikey = make_internal_key(b"foo", 7, ValueKind::Value);
        let (ukey, seq, kind) = split_internal_key(&ikey).unwrap();
        assert_eq!(ukey, b"foo");
        assert_eq!(seq, 7);
        assert_eq!(kind, ValueKind::Value);
    }

    #[test]
    fn test_short_key_is_corruption() {
        assert!(split_internal_key(b"abc").is_err());
    }

    #[test]
    fn test_ordering_user_key_ascending() {
        let cmp = BytewiseComparator;
        let a = make_internal_key(b"a", 5, ValueKind::Value);
        let b = make_internal_key(b"b", 5, ValueKind::Value);
        assert_eq!(compare_internal(&cmp, &a, &b), Ordering::Less);
    }

    #[test]
    fn test_ordering_sequence_descending() {
        let cmp = BytewiseComparator;
        let newer = make_internal_key(b"k", 9, ValueKind::Value);
        let older = make_internal_key(b"k", 3, ValueKind::Value);
        assert_eq!(compare_internal(&cmp, &newer, &older), Ordering::Less);
    }

    #[test]
    fn test_deletion_sorts_after_value_at_same_seq() {
        // pack(seq, Value) > pack(seq, Deletion), and larger tags sort
        // first, so a lookup key built with KIND_FOR_SEEK sees the value.
        let cmp = BytewiseComparator;
        let value = make_internal_key(b"k", 5, ValueKind::Value);
        let deletion = make_internal_key(b"k", 5, ValueKind::Deletion);
        assert_eq!(compare_internal(&cmp, &value, &deletion), Ordering::Less);
    }

    #[test]
    fn test_lookup_key_positions_at_newest_visible() {
        let cmp = BytewiseComparator;
        let lookup = LookupKey::new(b"k", 5);
        let at_5 = make_internal_key(b"k", 5, ValueKind::Value);
        let at_6 = make_internal_key(b"k", 6, ValueKind::Value);
        // Seeking >= lookup must land on seq 5, not seq 6.
        assert!(compare_internal(&cmp, lookup.internal_key(), &at_5) != Ordering::Greater);
        assert_eq!(
            compare_internal(&cmp, lookup.internal_key(), &at_6),
            Ordering::Greater
        );
    }
}
