//! Display-facing half of the pipeline: cadence buffering, structural
//! classification, and the diagram render queue.

pub mod cadence;
pub mod diagram;
pub mod structure;
