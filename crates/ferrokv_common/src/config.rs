use serde::{Deserialize, Serialize};

/// Top-level node configuration, loaded from `ferrokv.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub mvcc: MvccConfig,
    #[serde(default)]
    pub raftstore: RaftstoreConfig,
    #[serde(default)]
    pub split_check: SplitCheckConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub pd: PdConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address advertised for this store.
    pub addr: String,
    /// Prometheus metrics listen address.
    pub status_addr: String,
    /// Requests at or above this payload size are rejected before reaching
    /// the MVCC engine (raft entry ceiling).
    pub max_request_size: u64,
    /// How long a SplitRegion request waits for the split to be applied.
    pub split_region_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:20160".into(),
            status_addr: "127.0.0.1:20180".into(),
            max_request_size: 6 * 1024 * 1024,
            split_region_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the kv and raft engine WALs.
    pub data_dir: String,
    /// Disable to run fully in memory.
    pub wal_enabled: bool,
    /// fsync after every write batch.
    pub sync_wal: bool,
    /// Outstanding tombstones above which the engine reports write stall.
    pub write_stall_tombstones: u64,
    /// Entries between two sampled range-property points.
    pub properties_sample_step: usize,
    /// WAL size in bytes past which the log is rewritten as a checkpoint
    /// of the live data.
    pub wal_checkpoint_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "ferrokv-data".into(),
            wal_enabled: true,
            sync_wal: false,
            write_stall_tombstones: 200_000,
            properties_sample_step: 64,
            wal_checkpoint_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MvccConfig {
    /// Number of latch slots, rounded up to a power of two.
    pub latch_slots: usize,
}

impl Default for MvccConfig {
    fn default() -> Self {
        Self { latch_slots: 2048 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftstoreConfig {
    /// Bounded queue capacity of every background worker.
    pub worker_capacity: usize,
    /// Idle interval after which a worker calls its runner's tick hook.
    pub worker_tick_interval_ms: u64,
    pub split_check_tick_interval_ms: u64,
    pub pd_heartbeat_tick_interval_ms: u64,
    pub pd_store_heartbeat_tick_interval_ms: u64,
    pub compact_check_tick_interval_ms: u64,
    /// Keys deleted per batch when destroying a region's data.
    pub snap_apply_batch_size: usize,
    /// Reported store capacity in bytes (0 = unlimited).
    pub capacity: u64,
}

impl Default for RaftstoreConfig {
    fn default() -> Self {
        Self {
            worker_capacity: 128,
            worker_tick_interval_ms: 100,
            split_check_tick_interval_ms: 10_000,
            pd_heartbeat_tick_interval_ms: 60_000,
            pd_store_heartbeat_tick_interval_ms: 10_000,
            compact_check_tick_interval_ms: 300_000,
            snap_apply_batch_size: 1024,
            capacity: 0,
        }
    }
}

/// How the split checker finds split keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitCheckPolicy {
    /// Walk every key in the region.
    Scan,
    /// Estimate from sampled range properties; falls back to `Scan`.
    Approximate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitCheckConfig {
    pub region_max_size: u64,
    pub region_split_size: u64,
    pub region_max_keys: u64,
    pub region_split_keys: u64,
    /// Most split keys reported by a single check.
    pub batch_split_limit: usize,
    pub policy: SplitCheckPolicy,
}

impl Default for SplitCheckConfig {
    fn default() -> Self {
        Self {
            region_max_size: 144 * 1024 * 1024,
            region_split_size: 96 * 1024 * 1024,
            region_max_keys: 1_440_000,
            region_split_keys: 960_000,
            batch_split_limit: 10,
            policy: SplitCheckPolicy::Approximate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Minimum tombstones in a range before CheckAndCompact compacts it.
    pub tombstone_num_threshold: u64,
    /// Minimum tombstone percentage (0-100) before CheckAndCompact compacts.
    pub tombstone_percent_threshold: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            tombstone_num_threshold: 10_000,
            tombstone_percent_threshold: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PdConfig {
    pub cluster_id: u64,
}

impl Default for PdConfig {
    fn default() -> Self {
        Self { cluster_id: 1 }
    }
}

impl NodeConfig {
    pub fn from_toml(s: &str) -> Result<Self, crate::error::KvError> {
        toml::from_str(s).map_err(|e| crate::error::KvError::Config(e.to_string()))
    }

    /// Reject settings that would make the node misbehave at runtime.
    pub fn validate(&self) -> Result<(), crate::error::KvError> {
        let err = |m: &str| Err(crate::error::KvError::Config(m.to_string()));
        if self.raftstore.worker_capacity == 0 {
            return err("raftstore.worker_capacity must be > 0");
        }
        if self.split_check.region_split_size == 0
            || self.split_check.region_split_size > self.split_check.region_max_size
        {
            return err("split_check.region_split_size must be in (0, region_max_size]");
        }
        if self.split_check.region_split_keys == 0
            || self.split_check.region_split_keys > self.split_check.region_max_keys
        {
            return err("split_check.region_split_keys must be in (0, region_max_keys]");
        }
        if self.compaction.tombstone_percent_threshold > 100 {
            return err("compaction.tombstone_percent_threshold must be <= 100");
        }
        if self.server.max_request_size == 0 {
            return err("server.max_request_size must be > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = NodeConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.server.max_request_size, 6 * 1024 * 1024);
        assert_eq!(cfg.raftstore.worker_capacity, 128);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg = NodeConfig::from_toml(
            r#"
            [storage]
            data_dir = "/tmp/kv"

            [split_check]
            policy = "scan"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.storage.data_dir, "/tmp/kv");
        assert!(cfg.storage.wal_enabled);
        assert_eq!(cfg.split_check.policy, SplitCheckPolicy::Scan);
        assert_eq!(cfg.split_check.batch_split_limit, 10);
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let text = toml::to_string_pretty(&NodeConfig::default()).unwrap();
        let back = NodeConfig::from_toml(&text).unwrap();
        assert_eq!(back.compaction.tombstone_num_threshold, 10_000);
        assert_eq!(back.split_check.policy, SplitCheckPolicy::Approximate);
    }

    #[test]
    fn test_validate_rejects_bad_split_sizes() {
        let mut cfg = NodeConfig::default();
        cfg.split_check.region_split_size = cfg.split_check.region_max_size + 1;
        assert!(cfg.validate().is_err());

        let mut cfg = NodeConfig::default();
        cfg.raftstore.worker_capacity = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = NodeConfig::from_toml("server = 3").unwrap_err();
        assert!(matches!(err, crate::error::KvError::Config(_)));
    }
}
