//! Worker system: concurrent queue consumption.
//!
//! Core components:
//! - `state`: Consumer state machine (Running → Draining → Stopped)
//! - `consumer`: Receive loop, bounded worker pool, disposition, shutdown

pub mod consumer;
pub mod state;

pub use consumer::{
    Consumer, ConsumerConfig, ConsumerStats, Disposition, RunSummary, ShutdownHandle, disposition,
};
pub use state::{ConsumerState, StopRequest};
