pub mod config;
pub mod error;
pub mod keys;
pub mod metapb;
pub mod shutdown;
pub mod types;

pub use error::{ErrorKind, KvError, KvResult, LockInfo, MvccError};
pub use metapb::{Peer, Region, RegionEpoch, Store};
pub use shutdown::ShutdownBarrier;
pub use types::{PeerId, RegionId, StoreId, Timestamp};
