//! Shared model for the fleetsync hub: topology snapshots, polling modes and
//! the JSON event protocol spoken over sync channels.

pub mod interval;
pub mod sync_ipc;
pub mod topology;

pub use interval::{ConnectionInfo, IntervalError, PollMode};
pub use topology::TopologySnapshot;
