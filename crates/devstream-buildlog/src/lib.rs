//! Assembly of structured build traces into renderable invocations.
//!
//! Provides:
//! - `BuildLogAssembler` - newline-delimited trace event reconciler
//! - `BuildInvocation` / `VertexEvent` - one build's ordered step log
//! - `Segment` - display segmentation of step names

pub mod assembler;
pub mod event;
pub mod segment;

pub use assembler::BuildLogAssembler;
pub use event::{BuildInvocation, VertexEvent, VertexStatus, WireEvent};
pub use segment::Segment;
