//! Identifier and timestamp aliases shared across crates.

/// Logical timestamp allocated by the external timestamp authority.
pub type Timestamp = u64;

pub type RegionId = u64;
pub type StoreId = u64;
pub type PeerId = u64;

/// Largest timestamp; reads at `MAX_TS` see every committed version.
pub const MAX_TS: Timestamp = u64::MAX;
