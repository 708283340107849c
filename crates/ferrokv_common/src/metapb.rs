//! Region and store metadata.
//!
//! These types are persisted under the `internal\` namespace (see
//! [`crate::keys`]) as JSON and exchanged with the cluster manager.

use serde::{Deserialize, Serialize};

use crate::error::RegionError;
use crate::types::{PeerId, RegionId, StoreId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionEpoch {
    /// Bumped on peer membership change.
    pub conf_ver: u64,
    /// Bumped on split and merge.
    pub version: u64,
}

impl RegionEpoch {
    pub fn new(conf_ver: u64, version: u64) -> Self {
        Self { conf_ver, version }
    }

    /// True when `self` is older than `other` in either dimension.
    pub fn is_stale_against(&self, other: &RegionEpoch) -> bool {
        self.conf_ver < other.conf_ver || self.version < other.version
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub store_id: StoreId,
}

/// A contiguous key range `[start_key, end_key)` and the peers replicating it.
/// An empty `end_key` means the range is unbounded above.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub id: RegionId,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub region_epoch: RegionEpoch,
    pub peers: Vec<Peer>,
}

impl Region {
    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_slice() && (self.end_key.is_empty() || key < self.end_key.as_slice())
    }

    /// Recoverable range check used on every request path.
    pub fn check_key_in_region(&self, key: &[u8]) -> Result<(), RegionError> {
        if self.contains_key(key) {
            Ok(())
        } else {
            Err(RegionError::KeyNotInRegion {
                key: key.to_vec(),
                region_id: self.id,
                start_key: self.start_key.clone(),
                end_key: self.end_key.clone(),
            })
        }
    }

    pub fn find_peer(&self, store_id: StoreId) -> Option<&Peer> {
        self.peers.iter().find(|p| p.store_id == store_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Store {
    pub id: StoreId,
    pub address: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(start: &[u8], end: &[u8]) -> Region {
        Region {
            id: 7,
            start_key: start.to_vec(),
            end_key: end.to_vec(),
            region_epoch: RegionEpoch::new(1, 1),
            peers: vec![Peer { id: 8, store_id: 1 }],
        }
    }

    #[test]
    fn test_contains_key_bounds() {
        let r = region(b"b", b"d");
        assert!(!r.contains_key(b"a"));
        assert!(r.contains_key(b"b"));
        assert!(r.contains_key(b"c\xff"));
        assert!(!r.contains_key(b"d"));
    }

    #[test]
    fn test_unbounded_region() {
        let r = region(b"", b"");
        assert!(r.contains_key(b""));
        assert!(r.contains_key(b"\xff\xff\xff"));
    }

    #[test]
    fn test_check_key_in_region_error() {
        let r = region(b"b", b"d");
        match r.check_key_in_region(b"x") {
            Err(RegionError::KeyNotInRegion { region_id, .. }) => assert_eq!(region_id, 7),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_epoch_staleness() {
        let cur = RegionEpoch::new(2, 5);
        assert!(RegionEpoch::new(2, 4).is_stale_against(&cur));
        assert!(RegionEpoch::new(1, 5).is_stale_against(&cur));
        assert!(!RegionEpoch::new(2, 5).is_stale_against(&cur));
    }

    #[test]
    fn test_find_peer() {
        let r = region(b"", b"");
        assert_eq!(r.find_peer(1).map(|p| p.id), Some(8));
        assert!(r.find_peer(2).is_none());
    }
}
