//! [`Runnable`](crate::worker::Runnable) implementations, one per worker.

pub mod compact;
pub mod compute_hash;
pub mod pd;
pub mod raft_log_gc;
pub mod region;
pub mod split_check;

pub use compact::CompactRunner;
pub use compute_hash::ComputeHashRunner;
pub use pd::PdRunner;
pub use raft_log_gc::RaftLogGcRunner;
pub use region::RegionRunner;
pub use split_check::{SplitCheckRunner, SplitCheckerHost};
