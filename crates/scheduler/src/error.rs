//! Errors and warnings raised by the control-flow scheduler.

use crate::state::SubgraphState;
use callflow_ir::{NodeId, SubgraphId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Structural failures. Any of these aborts the whole scheduling run.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("call {call} in {subgraph} does not resolve to a partial node")]
    UnresolvedCall { call: NodeId, subgraph: SubgraphId },
    #[error("partial {partial} references unknown {target}")]
    UnknownSubgraph { partial: NodeId, target: SubgraphId },
    #[error("non-tail call {call} in {subgraph} reaches {callee}, which calls back into {subgraph}")]
    NonTailCycle {
        call: NodeId,
        subgraph: SubgraphId,
        callee: SubgraphId,
    },
    #[error("partial {partial} feeds {calls} call sites; a caller must route to exactly one call")]
    AmbiguousPartial { partial: NodeId, calls: usize },
    #[error("{subgraph} still holds non-tail calls after {iterations} split iterations")]
    SplitLimitExceeded {
        subgraph: SubgraphId,
        iterations: usize,
    },
    #[error("illegal state transition for {subgraph}: {from:?} -> {to:?}")]
    IllegalTransition {
        subgraph: SubgraphId,
        from: SubgraphState,
        to: SubgraphState,
    },
}

pub type ScheduleResult<T> = Result<T, ScheduleError>;

/// Consistency problems that are logged and reported but do not abort the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ScheduleWarning {
    DuplicateLink { call: NodeId },
    DeadCaller { partial: NodeId, subgraph: SubgraphId },
    UnusedBoundary { subgraph: SubgraphId },
}

impl fmt::Display for ScheduleWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleWarning::DuplicateLink { call } => {
                write!(f, "link for {} recorded twice; keeping the latest", call)
            }
            ScheduleWarning::DeadCaller { partial, subgraph } => {
                write!(f, "partial {} naming {} feeds no call", partial, subgraph)
            }
            ScheduleWarning::UnusedBoundary { subgraph } => {
                write!(f, "{} is multiply called but kept no live callers", subgraph)
            }
        }
    }
}
