//! The hypervisor control client.
//!
//! Each VM is driven through a private per-VM control channel: the engine
//! spawns one hypervisor process bound to one control socket, connects to it
//! with bounded backoff while the process starts up, and then issues
//! structured lifecycle requests with per-call deadlines. Process exit is
//! detected through the OS process handle and is always fatal, regardless of
//! in-flight requests.

mod channel;
mod client;
mod fake;
mod process;
mod protocol;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use channel::*;
pub use client::*;
pub use fake::*;
pub use process::*;
pub use protocol::*;
