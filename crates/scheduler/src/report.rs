//! Scheduling reports.

use crate::boundary::Boundary;
use crate::error::ScheduleWarning;
use crate::state::SubgraphState;
use callflow_ir::{Link, NodeId, SubgraphId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Everything a scheduling run found and changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleReport {
    /// Calls given their own copy of a partial shared with another call.
    #[serde(default)]
    pub rewired_calls: usize,

    /// Non-tail calls in discovery order.
    pub non_tail_calls: Vec<NodeId>,

    /// Links recorded by this run, keyed by call node, covering split calls and
    /// entrance calls. The program keeps them in `Program::links` as well.
    pub links: BTreeMap<NodeId, Link>,

    /// Number of split steps performed.
    pub splits: usize,

    /// Entrance and exit wrappers, one entry per wrapped body.
    pub boundaries: Vec<Boundary>,

    /// State of every tracked subgraph at the end of the run.
    pub states: BTreeMap<SubgraphId, SubgraphState>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ScheduleWarning>,
}

impl ScheduleReport {
    /// True when the run left the program untouched.
    pub fn is_noop(&self) -> bool {
        self.rewired_calls == 0 && self.splits == 0 && self.boundaries.is_empty()
    }

    pub fn entrance_count(&self, body: SubgraphId) -> usize {
        self.boundaries
            .iter()
            .filter(|boundary| boundary.body == body)
            .map(|boundary| boundary.entrances.len())
            .sum()
    }

    pub fn exit_count(&self, body: SubgraphId) -> usize {
        self.boundaries
            .iter()
            .filter(|boundary| boundary.body == body)
            .map(|boundary| boundary.exits.len())
            .sum()
    }

    pub fn link_for(&self, call: NodeId) -> Option<&Link> {
        self.links.get(&call)
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Save report to JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
