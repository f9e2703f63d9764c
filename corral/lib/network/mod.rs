//! Address, interface, and port-forward management.
//!
//! The allocator owns a fixed-size address pool carved from the configured
//! subnet, one shared bridge, and one TAP interface per VM. Pool bookkeeping
//! sits behind a short-lived lock that is never held across host-network
//! I/O, so allocation on one VM can never stall operations on another.

mod allocator;
mod driver;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use allocator::*;
pub use driver::*;
