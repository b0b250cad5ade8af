//! Interpreters for callflow programs: a recursive reference interpreter for
//! unscheduled programs and a sequential executor for lowered plans.

pub mod kernels;
pub mod reference;
pub mod runtime;
pub mod values;

pub use kernels::*;
pub use reference::*;
pub use runtime::*;
pub use values::*;
