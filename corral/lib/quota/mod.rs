//! System- and owner-level capacity accounting.
//!
//! The engine admits or rejects resource requests against two ceilings at
//! once: system-wide capacity and the owner's quota tier. It is
//! non-preemptive; a running VM is never evicted to admit another. The
//! monitor samples host utilization into a rolling history and recommends
//! capacity changes with hysteresis, which the autoscaler applies in bounded
//! steps when enabled.

mod engine;
mod monitor;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use engine::*;
pub use monitor::*;
