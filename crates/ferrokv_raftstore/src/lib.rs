//! Region-level background machinery of a storage node: bounded workers,
//! the runners they execute, message routing to region control loops and
//! the cluster-manager client.

pub mod msg;
pub mod pd_client;
pub mod router;
pub mod runner;
pub mod snap;
pub mod task;
pub mod worker;

pub use msg::{Msg, MsgType, RegionMsg, SplitRegionCallback};
pub use pd_client::{LocalPdClient, PdClient, SplitId};
pub use router::Router;
pub use task::{PdTask, RegionTask, Task, TaskKind};
pub use worker::{Runnable, ScheduleError, Scheduler, Worker};
