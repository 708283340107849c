//! Reserved key namespaces.
//!
//! ```text
//!   internal\store            store metadata
//!   internal\region<id>       one entry per region (decimal id)
//!   0x01 0x02 <rid> 0x01 <i>  raft log entry i of region rid (raft engine)
//!   z<encoded key>[<!ts>]     user data, memcomparable encoded
//! ```
//!
//! `z` sorts after every metadata key, so a data scan never sees metadata.

use crate::types::RegionId;

pub const INTERNAL_KEY_PREFIX: &[u8] = b"internal\\";
pub const STORE_META_KEY: &[u8] = b"internal\\store";
pub const REGION_META_PREFIX: &[u8] = b"internal\\region";

pub const DATA_PREFIX: u8 = b'z';
pub const DATA_MIN_KEY: &[u8] = b"z";
pub const DATA_MAX_KEY: &[u8] = b"{";

pub const LOCAL_PREFIX: u8 = 0x01;
const RAFT_LOG_PREFIX: u8 = 0x02;
const RAFT_LOG_SUFFIX: u8 = 0x01;

pub fn region_meta_key(region_id: RegionId) -> Vec<u8> {
    let mut key = REGION_META_PREFIX.to_vec();
    key.extend_from_slice(region_id.to_string().as_bytes());
    key
}

/// Parse the region id out of an `internal\region<id>` key.
pub fn region_id_from_meta_key(key: &[u8]) -> Option<RegionId> {
    let digits = key.strip_prefix(REGION_META_PREFIX)?;
    std::str::from_utf8(digits).ok()?.parse().ok()
}

pub fn is_internal_key(key: &[u8]) -> bool {
    key.starts_with(INTERNAL_KEY_PREFIX)
}

pub fn data_key(encoded: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(encoded.len() + 1);
    key.push(DATA_PREFIX);
    key.extend_from_slice(encoded);
    key
}

/// Strip the data prefix. Returns `None` for keys outside the data space.
pub fn origin_key(data_key: &[u8]) -> Option<&[u8]> {
    match data_key.split_first() {
        Some((&DATA_PREFIX, rest)) => Some(rest),
        _ => None,
    }
}

pub fn raft_log_prefix(region_id: RegionId) -> Vec<u8> {
    let mut key = Vec::with_capacity(11);
    key.push(LOCAL_PREFIX);
    key.push(RAFT_LOG_PREFIX);
    key.extend_from_slice(&region_id.to_be_bytes());
    key.push(RAFT_LOG_SUFFIX);
    key
}

pub fn raft_log_key(region_id: RegionId, index: u64) -> Vec<u8> {
    let mut key = raft_log_prefix(region_id);
    key.extend_from_slice(&index.to_be_bytes());
    key
}
