use thiserror::Error;

use crate::types::{RegionId, Timestamp};

/// Convenience alias for `Result<T, KvError>`.
pub type KvResult<T> = Result<T, KvError>;

/// Error classification that tells the caller what to do next.
///
/// - `Locked`: a lock blocks the read; resolve it, then retry the read
/// - `Retryable`: transient conflict; restart the transaction with a new start_ts
/// - `Abort`: terminal for this transaction; surface to the client
/// - `InvariantViolation`: routing/configuration mismatch (key outside the serving region)
/// - `Transient`: resource pressure or a peer not reachable; retry after back-off
/// - `Internal`: storage or encoding failure that should never happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Locked,
    Retryable,
    Abort,
    InvariantViolation,
    Transient,
    Internal,
}

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum KvError {
    #[error("MVCC error: {0}")]
    Mvcc(#[from] MvccError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Region error: {0}")]
    Region(#[from] RegionError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Router error: {0}")]
    Router(#[from] RouterError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Lock details returned to a reader or writer that ran into a foreign lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub key: Vec<u8>,
    pub primary_lock: Vec<u8>,
    pub lock_version: Timestamp,
    pub lock_ttl: u64,
}

impl std::fmt::Display for LockInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "key={} primary={} start_ts={} ttl={}",
            String::from_utf8_lossy(&self.key),
            String::from_utf8_lossy(&self.primary_lock),
            self.lock_version,
            self.lock_ttl
        )
    }
}

/// Transaction-level errors raised by the MVCC engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MvccError {
    #[error("key is locked: {0}")]
    KeyIsLocked(LockInfo),

    #[error("write conflict on key {}: start_ts={start_ts} conflict_commit_ts={conflict_commit_ts}", String::from_utf8_lossy(.key))]
    WriteConflict {
        key: Vec<u8>,
        start_ts: Timestamp,
        conflict_start_ts: Timestamp,
        conflict_commit_ts: Timestamp,
    },

    #[error("lock not found for key {} (start_ts={start_ts}, commit_ts={commit_ts})", String::from_utf8_lossy(.key))]
    TxnLockNotFound {
        key: Vec<u8>,
        start_ts: Timestamp,
        commit_ts: Timestamp,
    },

    #[error("invalid commit_ts {commit_ts}: must exceed start_ts {start_ts}")]
    InvalidCommitTs {
        start_ts: Timestamp,
        commit_ts: Timestamp,
    },

    #[error("corrupted record: {0}")]
    Corrupted(String),

    #[error("engine: {0}")]
    Engine(String),
}

impl From<EngineError> for MvccError {
    fn from(e: EngineError) -> Self {
        MvccError::Engine(e.to_string())
    }
}

/// Storage substrate errors.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("Unknown column family: {0}")]
    UnknownCf(String),
}

/// Errors about the region a request was routed to.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegionError {
    #[error("region {0} not found on this store")]
    RegionNotFound(RegionId),

    #[error("key {} not in region {region_id} [{}, {})", String::from_utf8_lossy(.key), String::from_utf8_lossy(.start_key), String::from_utf8_lossy(.end_key))]
    KeyNotInRegion {
        key: Vec<u8>,
        region_id: RegionId,
        start_key: Vec<u8>,
        end_key: Vec<u8>,
    },

    #[error("epoch not match for region {region_id}: request ({req_conf_ver}, {req_version}), current ({conf_ver}, {version})")]
    EpochNotMatch {
        region_id: RegionId,
        req_conf_ver: u64,
        req_version: u64,
        conf_ver: u64,
        version: u64,
    },

    #[error("raft entry too large for region {region_id}: {entry_size} bytes")]
    RaftEntryTooLarge { region_id: RegionId, entry_size: u64 },
}

/// Cluster-manager (placement driver) errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("cluster already bootstrapped")]
    AlreadyBootstrapped,

    #[error("cluster not bootstrapped")]
    NotBootstrapped,

    #[error("region {0} unknown to cluster manager")]
    RegionNotFound(RegionId),

    #[error("stale region {region_id}: {reason}")]
    StaleRegion { region_id: RegionId, reason: String },

    #[error("cluster manager unavailable: {0}")]
    Unavailable(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

/// Errors delivering a message to a region's control loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("no mailbox registered for region {0}")]
    RegionNotFound(RegionId),

    #[error("mailbox of region {0} is disconnected")]
    Disconnected(RegionId),
}

impl MvccError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MvccError::KeyIsLocked(_) => ErrorKind::Locked,
            MvccError::WriteConflict { .. } => ErrorKind::Retryable,
            MvccError::TxnLockNotFound { .. } | MvccError::InvalidCommitTs { .. } => {
                ErrorKind::Abort
            }
            MvccError::Corrupted(_) | MvccError::Engine(_) => ErrorKind::Internal,
        }
    }
}

impl RegionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegionError::KeyNotInRegion { .. } => ErrorKind::InvariantViolation,
            RegionError::RegionNotFound(_) | RegionError::EpochNotMatch { .. } => {
                ErrorKind::Retryable
            }
            RegionError::RaftEntryTooLarge { .. } => ErrorKind::Abort,
        }
    }
}

impl KvError {
    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            KvError::Mvcc(e) => e.kind(),
            KvError::Region(e) => e.kind(),
            KvError::Cluster(ClusterError::Unavailable(_) | ClusterError::Timeout(_)) => {
                ErrorKind::Transient
            }
            KvError::Cluster(ClusterError::StaleRegion { .. }) => ErrorKind::Retryable,
            KvError::Cluster(_) => ErrorKind::Abort,
            KvError::Router(_) => ErrorKind::Transient,
            KvError::Engine(_) | KvError::Config(_) | KvError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable | ErrorKind::Transient)
    }

    pub fn is_locked(&self) -> bool {
        self.kind() == ErrorKind::Locked
    }
}
