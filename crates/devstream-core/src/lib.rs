//! Core data model for dev-session observability streams.
//!
//! This crate provides the fundamental building blocks:
//! - Wire types: `Update`, `Stack`, `Task` and its partial form `TaskDelta`
//! - `ControlCommand` - Outbound control messages
//! - `ObserverSet` - Replay-friendly observer registry

pub mod command;
pub mod model;
pub mod observer;

pub use command::ControlCommand;
pub use model::{Stack, Task, TaskDelta, Update};
pub use observer::{ObserverSet, Subscription};
