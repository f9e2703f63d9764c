//! Configuration types and helpers.

mod defaults;
mod fleet;
mod machine;
mod validate;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use defaults::*;
pub use fleet::*;
pub use machine::*;
pub use validate::*;
