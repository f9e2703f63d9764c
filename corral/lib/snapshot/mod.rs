//! Point-in-time capture and recovery.
//!
//! Snapshots form a forest: a full snapshot has no parent, an incremental
//! one stores the delta from a named parent. Every artifact carries a
//! content checksum; verification failures always block a restore and are
//! never repaired silently. Retention pruning never removes a snapshot that
//! a retained snapshot still needs for its restore chain.

mod manager;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use manager::*;
