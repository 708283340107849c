//! Messages delivered to a region's control loop through the [`Router`].
//!
//! [`Router`]: crate::router::Router

use std::fmt;

use ferrokv_common::{KvResult, Peer, Region, RegionEpoch, RegionId};

/// Receives the regions produced by a split (left to right), or the error
/// that stopped it.
pub type SplitRegionCallback = Box<dyn FnOnce(KvResult<Vec<Region>>) + Send>;

pub enum Msg {
    /// Split at `split_keys` if the region is still at `region_epoch`.
    SplitRegion {
        region_epoch: RegionEpoch,
        split_keys: Vec<Vec<u8>>,
        callback: Option<SplitRegionCallback>,
    },
    ComputeHashResult {
        index: u64,
        hash: u32,
    },
    /// The cluster manager no longer lists `peer` in the region.
    StalePeer {
        peer: Peer,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    SplitRegion,
    ComputeHashResult,
    StalePeer,
}

impl Msg {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Msg::SplitRegion { .. } => MsgType::SplitRegion,
            Msg::ComputeHashResult { .. } => MsgType::ComputeHashResult,
            Msg::StalePeer { .. } => MsgType::StalePeer,
        }
    }
}

impl fmt::Debug for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Msg::SplitRegion {
                region_epoch,
                split_keys,
                callback,
            } => f
                .debug_struct("SplitRegion")
                .field("region_epoch", region_epoch)
                .field("split_keys", &split_keys.len())
                .field("has_callback", &callback.is_some())
                .finish(),
            Msg::ComputeHashResult { index, hash } => f
                .debug_struct("ComputeHashResult")
                .field("index", index)
                .field("hash", hash)
                .finish(),
            Msg::StalePeer { peer } => f.debug_struct("StalePeer").field("peer", peer).finish(),
        }
    }
}

/// A message addressed to one region.
#[derive(Debug)]
pub struct RegionMsg {
    pub region_id: RegionId,
    pub msg: Msg,
}
