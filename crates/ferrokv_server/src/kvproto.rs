//! Transactional request/response types served by [`KvServer`].
//!
//! The transport that carries them is external; these are the in-process
//! shapes every request is validated and answered in.
//!
//! [`KvServer`]: crate::server::KvServer

use ferrokv_common::error::RegionError;
use ferrokv_common::{ErrorKind, LockInfo, MvccError, Region, RegionEpoch, RegionId, Timestamp};
use ferrokv_storage::mvcc::{Mutation, Pair};

/// Routing header carried by every request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    pub region_id: RegionId,
    pub region_epoch: RegionEpoch,
}

impl Context {
    pub fn for_region(region: &Region) -> Self {
        Self {
            region_id: region.id,
            region_epoch: region.region_epoch,
        }
    }
}

/// Per-key transaction error, classified for the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// Resolve the lock, then retry the read.
    Locked(LockInfo),
    /// Restart the transaction with a new start version.
    Retryable(String),
    Abort(String),
}

impl From<MvccError> for KeyError {
    fn from(e: MvccError) -> Self {
        match (e.kind(), e) {
            (_, MvccError::KeyIsLocked(info)) => KeyError::Locked(info),
            (ErrorKind::Retryable, e) => KeyError::Retryable(e.to_string()),
            (_, e) => KeyError::Abort(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub error: Option<KeyError>,
}

impl From<Pair> for KvPair {
    fn from(p: Pair) -> Self {
        match p.result {
            Ok(value) => KvPair {
                key: p.key,
                value,
                error: None,
            },
            Err(e) => KvPair {
                key: p.key,
                value: Vec::new(),
                error: Some(e.into()),
            },
        }
    }
}

fn keys_size<'a>(keys: impl IntoIterator<Item = &'a Vec<u8>>) -> u64 {
    keys.into_iter().map(|k| k.len() as u64).sum()
}

#[derive(Debug, Clone, Default)]
pub struct GetRequest {
    pub context: Context,
    pub key: Vec<u8>,
    pub version: Timestamp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetResponse {
    pub region_error: Option<RegionError>,
    pub error: Option<KeyError>,
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    pub context: Context,
    pub start_key: Vec<u8>,
    /// Exclusive; empty means the region's end.
    pub end_key: Vec<u8>,
    /// 0 means no limit.
    pub limit: u32,
    pub version: Timestamp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResponse {
    pub region_error: Option<RegionError>,
    pub pairs: Vec<KvPair>,
}

#[derive(Debug, Clone, Default)]
pub struct BatchGetRequest {
    pub context: Context,
    pub keys: Vec<Vec<u8>>,
    pub version: Timestamp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchGetResponse {
    pub region_error: Option<RegionError>,
    pub pairs: Vec<KvPair>,
}

#[derive(Debug, Clone, Default)]
pub struct PrewriteRequest {
    pub context: Context,
    pub mutations: Vec<Mutation>,
    pub primary_lock: Vec<u8>,
    pub start_version: Timestamp,
    pub lock_ttl: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrewriteResponse {
    pub region_error: Option<RegionError>,
    /// One slot per mutation, in request order.
    pub errors: Vec<Option<KeyError>>,
}

impl PrewriteResponse {
    pub fn is_ok(&self) -> bool {
        self.region_error.is_none() && self.errors.iter().all(|e| e.is_none())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommitRequest {
    pub context: Context,
    pub keys: Vec<Vec<u8>>,
    pub start_version: Timestamp,
    pub commit_version: Timestamp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitResponse {
    pub region_error: Option<RegionError>,
    pub error: Option<KeyError>,
}

#[derive(Debug, Clone, Default)]
pub struct BatchRollbackRequest {
    pub context: Context,
    pub keys: Vec<Vec<u8>>,
    pub start_version: Timestamp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchRollbackResponse {
    pub region_error: Option<RegionError>,
    pub error: Option<KeyError>,
}

#[derive(Debug, Clone, Default)]
pub struct ScanLockRequest {
    pub context: Context,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub max_version: Timestamp,
    pub limit: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanLockResponse {
    pub region_error: Option<RegionError>,
    pub error: Option<KeyError>,
    pub locks: Vec<LockInfo>,
}

#[derive(Debug, Clone, Default)]
pub struct SplitRegionRequest {
    pub context: Context,
    pub split_keys: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitRegionResponse {
    pub region_error: Option<RegionError>,
    /// Failure that is not about routing (cluster manager, timeout).
    pub other_error: Option<String>,
    /// Resulting regions, left to right.
    pub regions: Vec<Region>,
}

/// Bytes a request would occupy in a replicated log entry.
pub trait PayloadSize {
    fn payload_size(&self) -> u64;
}

impl PayloadSize for GetRequest {
    fn payload_size(&self) -> u64 {
        self.key.len() as u64
    }
}

impl PayloadSize for ScanRequest {
    fn payload_size(&self) -> u64 {
        (self.start_key.len() + self.end_key.len()) as u64
    }
}

impl PayloadSize for BatchGetRequest {
    fn payload_size(&self) -> u64 {
        keys_size(&self.keys)
    }
}

impl PayloadSize for PrewriteRequest {
    fn payload_size(&self) -> u64 {
        self.primary_lock.len() as u64
            + self
                .mutations
                .iter()
                .map(|m| (m.key.len() + m.value.len()) as u64)
                .sum::<u64>()
    }
}

impl PayloadSize for CommitRequest {
    fn payload_size(&self) -> u64 {
        keys_size(&self.keys)
    }
}

impl PayloadSize for BatchRollbackRequest {
    fn payload_size(&self) -> u64 {
        keys_size(&self.keys)
    }
}

impl PayloadSize for ScanLockRequest {
    fn payload_size(&self) -> u64 {
        (self.start_key.len() + self.end_key.len()) as u64
    }
}

impl PayloadSize for SplitRegionRequest {
    fn payload_size(&self) -> u64 {
        keys_size(&self.split_keys)
    }
}
