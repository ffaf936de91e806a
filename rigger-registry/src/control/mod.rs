//! Utilities for managing program execution flow.
//!
//! It includes the dependency graph scheduler used by every registry pass,
//! and the cancellation primitives its tasks share.

pub mod cancel;
pub mod graph;
