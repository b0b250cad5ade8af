//! callflow intermediate representation: the kernel graph arena, builders,
//! passes and lowering to executable plans.

pub mod builder;
pub mod dialect;
pub mod lowering;
pub mod passes;
pub mod program;

pub use builder::*;
pub use dialect::*;
pub use lowering::*;
pub use passes::*;
pub use program::*;
