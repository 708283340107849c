//! Work items executed by the background workers.
//!
//! Every worker consumes the same [`Task`] type; each runner handles the
//! variants it owns and rejects the rest.

use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;

use ferrokv_common::config::SplitCheckPolicy;
use ferrokv_common::error::ClusterError;
use ferrokv_common::{Peer, Region, RegionId};
use ferrokv_storage::engine::{Cf, Engine, Snapshot};

use crate::pd_client::{FlowStats, RegionHeartbeat, SplitId, StoreStats};
use crate::snap::{JobStatus, RegionSnapshot};

pub enum Task {
    /// Terminates the consuming worker. Tasks queued behind it never run.
    Stop,
    SplitCheck(SplitCheckTask),
    ComputeHash(ComputeHashTask),
    RaftLogGc(RaftLogGcTask),
    Compact(CompactTask),
    CheckAndCompact(CheckAndCompactTask),
    Region(RegionTask),
    Pd(PdTask),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Stop,
    SplitCheck,
    ComputeHash,
    RaftLogGc,
    Compact,
    CheckAndCompact,
    RegionGenerate,
    RegionApply,
    RegionDestroy,
    PdAskSplit,
    PdAskBatchSplit,
    PdHeartbeat,
    PdStoreHeartbeat,
    PdReportBatchSplit,
    PdValidatePeer,
    PdReadStats,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Stop => "stop",
            TaskKind::SplitCheck => "split_check",
            TaskKind::ComputeHash => "compute_hash",
            TaskKind::RaftLogGc => "raft_log_gc",
            TaskKind::Compact => "compact",
            TaskKind::CheckAndCompact => "check_and_compact",
            TaskKind::RegionGenerate => "region_generate",
            TaskKind::RegionApply => "region_apply",
            TaskKind::RegionDestroy => "region_destroy",
            TaskKind::PdAskSplit => "pd_ask_split",
            TaskKind::PdAskBatchSplit => "pd_ask_batch_split",
            TaskKind::PdHeartbeat => "pd_heartbeat",
            TaskKind::PdStoreHeartbeat => "pd_store_heartbeat",
            TaskKind::PdReportBatchSplit => "pd_report_batch_split",
            TaskKind::PdValidatePeer => "pd_validate_peer",
            TaskKind::PdReadStats => "pd_read_stats",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        match self {
            Task::Stop => TaskKind::Stop,
            Task::SplitCheck(_) => TaskKind::SplitCheck,
            Task::ComputeHash(_) => TaskKind::ComputeHash,
            Task::RaftLogGc(_) => TaskKind::RaftLogGc,
            Task::Compact(_) => TaskKind::Compact,
            Task::CheckAndCompact(_) => TaskKind::CheckAndCompact,
            Task::Region(RegionTask::Generate { .. }) => TaskKind::RegionGenerate,
            Task::Region(RegionTask::Apply { .. }) => TaskKind::RegionApply,
            Task::Region(RegionTask::Destroy { .. }) => TaskKind::RegionDestroy,
            Task::Pd(PdTask::AskSplit { .. }) => TaskKind::PdAskSplit,
            Task::Pd(PdTask::AskBatchSplit { .. }) => TaskKind::PdAskBatchSplit,
            Task::Pd(PdTask::Heartbeat(_)) => TaskKind::PdHeartbeat,
            Task::Pd(PdTask::StoreHeartbeat { .. }) => TaskKind::PdStoreHeartbeat,
            Task::Pd(PdTask::ReportBatchSplit { .. }) => TaskKind::PdReportBatchSplit,
            Task::Pd(PdTask::ValidatePeer { .. }) => TaskKind::PdValidatePeer,
            Task::Pd(PdTask::ReadStats(_)) => TaskKind::PdReadStats,
        }
    }

    /// Region the task is about, when it concerns exactly one.
    pub fn region_id(&self) -> Option<RegionId> {
        match self {
            Task::SplitCheck(t) => Some(t.region.id),
            Task::ComputeHash(t) => Some(t.region.id),
            Task::RaftLogGc(t) => Some(t.region_id),
            Task::Region(RegionTask::Generate { region_id, .. })
            | Task::Region(RegionTask::Apply { region_id, .. })
            | Task::Region(RegionTask::Destroy { region_id, .. }) => Some(*region_id),
            Task::Pd(PdTask::AskSplit { region, .. })
            | Task::Pd(PdTask::AskBatchSplit { region, .. })
            | Task::Pd(PdTask::ValidatePeer { region, .. }) => Some(region.id),
            Task::Pd(PdTask::Heartbeat(hb)) => Some(hb.region.id),
            _ => None,
        }
    }
}

// Callbacks and channels are not Debug; print the tag and region.
impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Task");
        d.field("kind", &self.kind());
        if let Some(id) = self.region_id() {
            d.field("region_id", &id);
        }
        d.finish()
    }
}

#[derive(Debug, Clone)]
pub struct SplitCheckTask {
    pub region: Region,
    /// Periodic checks skip regions that are clearly below the thresholds.
    pub auto_split: bool,
    pub policy: SplitCheckPolicy,
}

#[derive(Clone)]
pub struct ComputeHashTask {
    /// Raft log index the hash is taken at.
    pub index: u64,
    pub region: Region,
    pub snap: Snapshot,
}

pub struct RaftLogGcTask {
    pub raft_engine: Arc<Engine>,
    pub region_id: RegionId,
    /// Logs in `[start_idx, end_idx)` are deleted.
    pub start_idx: u64,
    pub end_idx: u64,
}

/// Engine-key range. Built with `data_range` for region bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct CompactTask {
    pub cf: Cf,
    /// Engine keys; `None` leaves that side unbounded.
    pub start_key: Option<Vec<u8>>,
    pub end_key: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct CheckAndCompactTask {
    pub ranges: Vec<KeyRange>,
    pub tombstone_num_threshold: u64,
    pub tombstone_percent_threshold: u64,
}

pub enum RegionTask {
    Generate {
        region_id: RegionId,
        start_key: Vec<u8>,
        end_key: Vec<u8>,
        status: JobStatus,
        notifier: SyncSender<RegionSnapshot>,
    },
    Apply {
        region_id: RegionId,
        status: JobStatus,
        snapshot: RegionSnapshot,
    },
    /// Delete every data key of `[start_key, end_key)` (raw region bounds).
    Destroy {
        region_id: RegionId,
        start_key: Vec<u8>,
        end_key: Vec<u8>,
    },
}

pub type AskSplitCallback = Box<dyn FnOnce(Result<Vec<SplitId>, ClusterError>) + Send>;

pub enum PdTask {
    AskSplit {
        region: Region,
        split_key: Vec<u8>,
        peer: Peer,
        right_derive: bool,
        callback: AskSplitCallback,
    },
    AskBatchSplit {
        region: Region,
        split_keys: Vec<Vec<u8>>,
        peer: Peer,
        right_derive: bool,
        callback: AskSplitCallback,
    },
    Heartbeat(RegionHeartbeat),
    StoreHeartbeat {
        stats: StoreStats,
        engine: Arc<Engine>,
        /// Configured capacity in bytes, 0 = unlimited.
        capacity: u64,
    },
    ReportBatchSplit {
        regions: Vec<Region>,
    },
    ValidatePeer {
        region: Region,
        peer: Peer,
        merge_source: Option<RegionId>,
    },
    ReadStats(HashMap<RegionId, FlowStats>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrokv_storage::engine::EngineOptions;

    #[test]
    fn test_task_kind_and_region() {
        let region = Region {
            id: 7,
            ..Default::default()
        };
        let task = Task::SplitCheck(SplitCheckTask {
            region,
            auto_split: true,
            policy: SplitCheckPolicy::Scan,
        });
        assert_eq!(task.kind(), TaskKind::SplitCheck);
        assert_eq!(task.region_id(), Some(7));

        let gc = Task::RaftLogGc(RaftLogGcTask {
            raft_engine: Arc::new(Engine::new_in_memory(EngineOptions::default())),
            region_id: 3,
            start_idx: 0,
            end_idx: 10,
        });
        assert_eq!(gc.kind().as_str(), "raft_log_gc");
        assert_eq!(gc.region_id(), Some(3));
        assert_eq!(Task::Stop.region_id(), None);
    }

    #[test]
    fn test_debug_prints_kind() {
        let task = Task::Region(RegionTask::Destroy {
            region_id: 4,
            start_key: vec![],
            end_key: vec![],
        });
        let s = format!("{:?}", task);
        assert!(s.contains("RegionDestroy"));
        assert!(s.contains("region_id: 4"));
    }
}
