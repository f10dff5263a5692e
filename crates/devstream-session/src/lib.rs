//! Reconciliation for dev-session streams.
//!
//! Provides:
//! - `SessionFeed` / `SessionClient` - stack snapshot + task reconciler
//! - `OutputStream` / `OutputClient` - ordered raw byte delivery

pub mod feed;
pub mod output;

pub use feed::{SessionClient, SessionFeed};
pub use output::{OutputChunk, OutputClient, OutputStream};
