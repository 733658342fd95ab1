//! Shared core of the polman agent: the node-local shadow state, the metrics
//! surface, the controller plumbing and the debug snapshot codec.

pub mod controller;
pub mod error;
pub mod metrics;
pub mod snapshot;
pub mod state;
pub mod telemetry;
