//! Session control and the per-stream coordinator.

pub mod pipeline;
pub mod session;
