//! Room reservation scheduling: overlap-safe booking, recurring series with a
//! rolling materialization horizon, series-wide edits, pattern-based
//! permissions, and field-level audit diffs.

pub mod audit;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod directory;
pub mod engine;
pub mod horizon;
pub mod limits;
pub mod model;
pub mod observability;
pub mod permissions;
pub mod recurrence;
pub mod wal;
