//! Core rill library: the incremental streaming render pipeline.
//!
//! rill turns a bursty SSE token stream into steadily-paced, structure-aware
//! UI commits. Markdown conversion, syntax highlighting and presentation live
//! on the far side of the [`core::pipeline::UiSink`] boundary; diagram layout
//! is consumed through [`render::diagram::DiagramEngine`].

pub mod config;
pub mod core;
pub mod logging;
pub mod render;
pub mod stream;
pub mod tokens;
