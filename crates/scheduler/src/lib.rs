//! Control-flow scheduler for callflow programs.
//!
//! Rewrites a program so that every call is a tail call and every subgraph
//! that more than one partial names is entered through its own wrappers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐
//! │ Catalog  │──▶│ Detector │──▶│ Splitter │──▶│ Boundary │
//! │ (callers)│   │(non-tail)│   │(worklist)│   │ builder  │
//! └──────────┘   └──────────┘   └────┬─────┘   └────┬─────┘
//!                                    └──▶ Links ◀───┘
//! ```
//!
//! # Key Components
//!
//! - [`catalog::SubgraphCatalog`]: partial nodes per subgraph and reachability
//! - [`detector::NonTailCallDetector`]: non-tail calls, call edges, cycle checks
//! - [`splitter::split_at_first_non_tail_call`]: one split step
//! - [`boundary::BoundaryBuilder`]: entrance and exit wrappers
//! - [`links::LinkRecorder`]: call to continuation table
//! - [`scheduler::ControlFlowScheduler`]: the driver and its state machine

pub mod boundary;
pub mod catalog;
pub mod detector;
pub mod error;
pub mod links;
pub mod report;
pub mod scheduler;
pub mod splitter;
pub mod state;

pub use boundary::{
    separate_shared_handles, Boundary, BoundaryBuilder, CallerGroup, EntranceWrapper, ExitSharing,
};
pub use catalog::SubgraphCatalog;
pub use detector::{is_tail_call, non_tail_calls, CallEdge, Detection, NonTailCallDetector};
pub use error::{ScheduleError, ScheduleResult, ScheduleWarning};
pub use links::LinkRecorder;
pub use report::ScheduleReport;
pub use scheduler::{take_report, ControlFlowPass, ControlFlowScheduler, ReportSlot, SchedulerOptions};
pub use splitter::{split_at_first_non_tail_call, SplitOutcome};
pub use state::{StateTable, SubgraphState};
