//! callflow compiler facade: pipeline, sessions, samples and equivalence evaluation.

#[cfg(feature = "cli")]
pub mod cli;
pub mod eval;
pub mod pipeline;
pub mod samples;
pub mod session;

#[cfg(feature = "cli")]
pub use cli::*;
pub use eval::*;
pub use pipeline::*;
pub use samples::*;
pub use session::*;
