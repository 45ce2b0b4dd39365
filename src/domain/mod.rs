//! Domain module
//!
//! Cross-cutting domain types shared by commands, projections and queries.

mod context;

pub use context::{Context, SYSTEM_USER};
