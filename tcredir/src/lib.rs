//! Userspace side of tcredir: the concurrent connection-track table, the
//! telemetry sink backends, a composable userspace datapath, and the
//! configuration and live-state types used by the agent binary.

pub mod config;
pub mod conntrack;
pub mod datapath;
pub mod sink;
pub mod state;

pub use conntrack::ConnTrackTable;
pub use datapath::Datapath;
pub use sink::{PerCpuChannel, PerCpuSink, RingSink, SinkBackend};
