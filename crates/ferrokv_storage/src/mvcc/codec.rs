//! Memcomparable key encoding with a descending timestamp suffix.
//!
//! Raw keys are split into 8-byte groups, each followed by a marker byte:
//! `0xFF` for a full group that continues, `0xFF - pad` for the final group
//! padded with `pad` zero bytes. Encoded keys keep raw-key order and no
//! encoded key is a prefix of another, so a timestamp can be appended
//! without disturbing the order between different user keys.
//!
//! ```text
//!   raw "abc"   -> 61 62 63 00 00 00 00 00 | FA
//!   versioned   -> <encoded> | !ts (big-endian u64)
//! ```
//!
//! The timestamp is stored inverted so newer versions sort first.

use std::fmt;

use ferrokv_common::error::MvccError;
use ferrokv_common::keys;
use ferrokv_common::Timestamp;

const ENC_GROUP_SIZE: usize = 8;
const ENC_MARKER: u8 = 0xFF;
const ENC_PAD: u8 = 0x00;
pub const TS_LEN: usize = 8;

pub fn encode_bytes(raw: &[u8]) -> Vec<u8> {
    let groups = raw.len() / ENC_GROUP_SIZE + 1;
    let mut out = Vec::with_capacity(groups * (ENC_GROUP_SIZE + 1));
    let mut chunks = raw.chunks_exact(ENC_GROUP_SIZE);
    for chunk in &mut chunks {
        out.extend_from_slice(chunk);
        out.push(ENC_MARKER);
    }
    let rest = chunks.remainder();
    let pad = ENC_GROUP_SIZE - rest.len();
    out.extend_from_slice(rest);
    out.extend(std::iter::repeat(ENC_PAD).take(pad));
    out.push(ENC_MARKER - pad as u8);
    out
}

/// Decode a memcomparable prefix of `encoded`. Returns the raw key and the
/// number of bytes consumed; trailing bytes (a timestamp) are ignored.
pub fn decode_bytes(encoded: &[u8]) -> Result<(Vec<u8>, usize), MvccError> {
    let mut raw = Vec::with_capacity(encoded.len());
    let mut offset = 0;
    loop {
        let group = encoded
            .get(offset..offset + ENC_GROUP_SIZE + 1)
            .ok_or_else(|| MvccError::Corrupted(format!("truncated key at offset {}", offset)))?;
        offset += ENC_GROUP_SIZE + 1;
        let marker = group[ENC_GROUP_SIZE];
        if marker == ENC_MARKER {
            raw.extend_from_slice(&group[..ENC_GROUP_SIZE]);
            continue;
        }
        let pad = (ENC_MARKER - marker) as usize;
        if pad > ENC_GROUP_SIZE {
            return Err(MvccError::Corrupted(format!("bad key marker {:#x}", marker)));
        }
        let (data, padding) = group[..ENC_GROUP_SIZE].split_at(ENC_GROUP_SIZE - pad);
        if padding.iter().any(|b| *b != ENC_PAD) {
            return Err(MvccError::Corrupted("non-zero key padding".into()));
        }
        raw.extend_from_slice(data);
        return Ok((raw, offset));
    }
}

/// An encoded user key, optionally carrying a timestamp suffix.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(Vec<u8>);

impl Key {
    pub fn from_raw(raw: &[u8]) -> Key {
        Key(encode_bytes(raw))
    }

    pub fn from_encoded(encoded: Vec<u8>) -> Key {
        Key(encoded)
    }

    pub fn from_encoded_slice(encoded: &[u8]) -> Key {
        Key(encoded.to_vec())
    }

    pub fn as_encoded(&self) -> &[u8] {
        &self.0
    }

    pub fn into_encoded(self) -> Vec<u8> {
        self.0
    }

    pub fn to_raw(&self) -> Result<Vec<u8>, MvccError> {
        decode_bytes(&self.0).map(|(raw, _)| raw)
    }

    pub fn append_ts(mut self, ts: Timestamp) -> Key {
        self.0.extend_from_slice(&(!ts).to_be_bytes());
        self
    }

    pub fn decode_ts(&self) -> Result<Timestamp, MvccError> {
        decode_ts_from(&self.0)
    }

    pub fn truncate_ts(mut self) -> Result<Key, MvccError> {
        let len = self.0.len();
        if len < TS_LEN {
            return Err(MvccError::Corrupted("key too short for timestamp".into()));
        }
        self.0.truncate(len - TS_LEN);
        Ok(self)
    }

    /// Engine key: data prefix + encoded bytes.
    pub fn data_key(&self) -> Vec<u8> {
        keys::data_key(&self.0)
    }

    /// Smallest data key strictly greater than every version of this key.
    pub fn data_key_upper_bound(&self) -> Vec<u8> {
        let mut k = self.data_key();
        k.extend_from_slice(&[0xFF; TS_LEN + 1]);
        k
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key(")?;
        for b in &self.0 {
            write!(f, "{:02X}", b)?;
        }
        write!(f, ")")
    }
}

pub fn decode_ts_from(encoded: &[u8]) -> Result<Timestamp, MvccError> {
    let len = encoded.len();
    if len < TS_LEN {
        return Err(MvccError::Corrupted("key too short for timestamp".into()));
    }
    let mut buf = [0u8; TS_LEN];
    buf.copy_from_slice(&encoded[len - TS_LEN..]);
    Ok(!u64::from_be_bytes(buf))
}

/// Split a versioned data key into its user key and commit/start timestamp.
pub fn split_data_key(data_key: &[u8]) -> Result<(Key, Timestamp), MvccError> {
    let encoded = keys::origin_key(data_key)
        .ok_or_else(|| MvccError::Corrupted("not a data key".into()))?;
    let ts = decode_ts_from(encoded)?;
    Ok((Key::from_encoded_slice(&encoded[..encoded.len() - TS_LEN]), ts))
}

/// Recover the raw user key from any data key, versioned or not.
pub fn raw_key_from_data_key(data_key: &[u8]) -> Result<Vec<u8>, MvccError> {
    let encoded = keys::origin_key(data_key)
        .ok_or_else(|| MvccError::Corrupted("not a data key".into()))?;
    decode_bytes(encoded).map(|(raw, _)| raw)
}

/// Engine key range `[start, end)` covering a region's raw range.
/// An empty `end_key` maps to the end of the data space.
pub fn data_range(start_key: &[u8], end_key: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let start = Key::from_raw(start_key).data_key();
    let end = if end_key.is_empty() {
        keys::DATA_MAX_KEY.to_vec()
    } else {
        Key::from_raw(end_key).data_key()
    };
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_known_vectors() {
        assert_eq!(encode_bytes(b""), vec![0, 0, 0, 0, 0, 0, 0, 0, 0xF7]);
        assert_eq!(
            encode_bytes(b"abc"),
            vec![b'a', b'b', b'c', 0, 0, 0, 0, 0, 0xFA]
        );
        let eight = encode_bytes(b"12345678");
        assert_eq!(eight.len(), 18);
        assert_eq!(eight[8], 0xFF);
        assert_eq!(eight[17], 0xF7);
    }

    #[test]
    fn test_encoding_preserves_order() {
        let mut raws: Vec<Vec<u8>> = [
            &b""[..],
            b"\x00",
            b"a",
            b"a\x00",
            b"ab",
            b"abcdefgh",
            b"abcdefgh\x00",
            b"b",
            b"\xff",
        ]
        .iter()
        .map(|r| r.to_vec())
        .collect();
        raws.sort();
        let encoded: Vec<Vec<u8>> = raws.iter().map(|r| encode_bytes(r)).collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn test_decode_ignores_timestamp_suffix() {
        let key = Key::from_raw(b"hello world").append_ts(42);
        assert_eq!(key.decode_ts().unwrap(), 42);
        assert_eq!(key.to_raw().unwrap(), b"hello world".to_vec());
        assert_eq!(key.truncate_ts().unwrap(), Key::from_raw(b"hello world"));
    }

    #[test]
    fn test_newer_versions_sort_first() {
        let k = Key::from_raw(b"k");
        let v5 = k.clone().append_ts(5);
        let v9 = k.clone().append_ts(9);
        assert!(v9 < v5);
        // Every version of "k" sorts before the next user key.
        let next = Key::from_raw(b"k\x00");
        assert!(k.clone().append_ts(0) < next);
        assert!(k.data_key_upper_bound() <= next.data_key());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_bytes(b"abc").is_err());
        assert!(decode_bytes(&[1, 2, 3, 4, 5, 6, 7, 8, 0x00]).is_err());
        assert!(decode_bytes(&[b'a', 0, 0, 0, 0, 0, 0, 1, 0xF8]).is_err());
    }

    #[test]
    fn test_split_data_key() {
        let dk = Key::from_raw(b"user").append_ts(77).data_key();
        let (key, ts) = split_data_key(&dk).unwrap();
        assert_eq!(ts, 77);
        assert_eq!(key.to_raw().unwrap(), b"user".to_vec());
        assert_eq!(raw_key_from_data_key(&dk).unwrap(), b"user".to_vec());
    }

    #[test]
    fn test_data_range_unbounded_end() {
        let (start, end) = data_range(b"a", b"");
        assert!(start < end);
        assert_eq!(end, keys::DATA_MAX_KEY.to_vec());
        let (_, end) = data_range(b"a", b"m");
        assert!(Key::from_raw(b"l").append_ts(1).data_key() < end);
    }
}
