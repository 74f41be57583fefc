//! The Apiary replay engine: the scheduler that paces jobs off disk, the
//! worker pool that replays them through a protocol adapter, the statistics
//! collector, and the supervisor that wires the three together and tears them
//! down in order.

pub mod adapter;
pub mod api;
mod collector;
mod pool;
mod queue;
mod scheduler;
mod supervisor;
pub mod telemetry;
mod worker;

pub use api::{
    JobDescriptor, PoolOptions, ReplayHandle, ReplayOptions, ReplayStopper, RunConfig, RunSummary,
    start_replay,
};
