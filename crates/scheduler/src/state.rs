//! Per-subgraph progress through a scheduling run.

use crate::error::{ScheduleError, ScheduleResult};
use callflow_ir::SubgraphId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state")]
pub enum SubgraphState {
    Unvisited,
    Analyzed { non_tail_calls: usize },
    Stable,
    PendingSplit,
    Split,
    PendingBoundary,
    Bounded,
    Final,
}

impl SubgraphState {
    pub fn can_transition_to(self, next: SubgraphState) -> bool {
        use SubgraphState::*;
        match (self, next) {
            (Unvisited, Analyzed { .. }) => true,
            (Analyzed { non_tail_calls: 0 }, Stable) => true,
            (Analyzed { non_tail_calls }, PendingSplit) => non_tail_calls > 0,
            (PendingSplit, Split) => true,
            (Split, Analyzed { .. }) => true,
            (Stable, PendingBoundary) | (Stable, Final) => true,
            (PendingBoundary, Bounded) => true,
            (Bounded, Final) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StateTable {
    states: BTreeMap<SubgraphId, SubgraphState>,
}

impl StateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, id: SubgraphId) {
        self.states.entry(id).or_insert(SubgraphState::Unvisited);
    }

    /// Wrappers are built already in their final shape.
    pub fn track_final(&mut self, id: SubgraphId) {
        self.states.insert(id, SubgraphState::Final);
    }

    pub fn get(&self, id: SubgraphId) -> Option<SubgraphState> {
        self.states.get(&id).copied()
    }

    pub fn transition(&mut self, id: SubgraphId, next: SubgraphState) -> ScheduleResult<()> {
        let current = self.get(id).unwrap_or(SubgraphState::Unvisited);
        if !current.can_transition_to(next) {
            return Err(ScheduleError::IllegalTransition {
                subgraph: id,
                from: current,
                to: next,
            });
        }
        self.states.insert(id, next);
        Ok(())
    }

    /// Moves every tracked subgraph that is done into `Final`.
    pub fn finalize(&mut self) -> ScheduleResult<()> {
        let pending: Vec<SubgraphId> = self
            .states
            .iter()
            .filter(|(_, state)| **state != SubgraphState::Final)
            .map(|(id, _)| *id)
            .collect();
        for id in pending {
            self.transition(id, SubgraphState::Final)?;
        }
        Ok(())
    }

    pub fn all_final(&self) -> bool {
        self.states
            .values()
            .all(|state| *state == SubgraphState::Final)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SubgraphId, SubgraphState)> + '_ {
        self.states.iter().map(|(id, state)| (*id, *state))
    }

    pub fn into_inner(self) -> BTreeMap<SubgraphId, SubgraphState> {
        self.states
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_path_reaches_final() {
        let id = SubgraphId(0);
        let mut table = StateTable::new();
        table.track(id);
        table
            .transition(id, SubgraphState::Analyzed { non_tail_calls: 2 })
            .unwrap();
        table.transition(id, SubgraphState::PendingSplit).unwrap();
        table.transition(id, SubgraphState::Split).unwrap();
        table
            .transition(id, SubgraphState::Analyzed { non_tail_calls: 0 })
            .unwrap();
        table.transition(id, SubgraphState::Stable).unwrap();
        table.transition(id, SubgraphState::PendingBoundary).unwrap();
        table.transition(id, SubgraphState::Bounded).unwrap();
        table.finalize().unwrap();
        assert!(table.all_final());
    }

    #[test]
    fn rejects_skipping_analysis() {
        let id = SubgraphId(3);
        let mut table = StateTable::new();
        table.track(id);
        let err = table.transition(id, SubgraphState::Split).unwrap_err();
        assert_eq!(
            err,
            ScheduleError::IllegalTransition {
                subgraph: id,
                from: SubgraphState::Unvisited,
                to: SubgraphState::Split,
            }
        );
    }

    #[test]
    fn stable_requires_no_pending_calls() {
        assert!(!SubgraphState::Analyzed { non_tail_calls: 1 }.can_transition_to(SubgraphState::Stable));
        assert!(!SubgraphState::Analyzed { non_tail_calls: 0 }
            .can_transition_to(SubgraphState::PendingSplit));
    }

    #[test]
    fn finalize_rejects_unfinished_split() {
        let id = SubgraphId(1);
        let mut table = StateTable::new();
        table.track(id);
        table
            .transition(id, SubgraphState::Analyzed { non_tail_calls: 1 })
            .unwrap();
        table.transition(id, SubgraphState::PendingSplit).unwrap();
        assert!(table.finalize().is_err());
    }
}
