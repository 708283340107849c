//! Node assembly: request protocol, the request gate, the region map and
//! the node that wires engines, workers and the region control loop.

pub mod kvproto;
pub mod node;
pub mod region_manager;
pub mod server;

pub use node::{Node, Schedulers};
pub use region_manager::RegionManager;
pub use server::KvServer;
