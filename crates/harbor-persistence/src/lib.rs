//! harbor-persistence: durability layer.
//!
//! Stores the cluster's slot and replica assignment tables as
//! checksummed files so a restarted node can resume without
//! recomputing them.

pub mod assignment;
pub mod format;

pub use assignment::{AssignmentFile, AssignmentLog};
pub use format::FormatError;
