//! Subgraph catalog: which partial nodes name which subgraph.

use crate::error::{ScheduleError, ScheduleResult};
use callflow_ir::{NodeId, Program, SubgraphId, SubgraphKind};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Debug, Clone, Default)]
pub struct SubgraphCatalog {
    callers: BTreeMap<SubgraphId, BTreeSet<NodeId>>,
    reachable: BTreeSet<SubgraphId>,
}

impl SubgraphCatalog {
    /// Records every partial in the program and walks reachability from the entry.
    pub fn build(program: &Program) -> ScheduleResult<Self> {
        let mut catalog = Self::default();
        for id in program.subgraph_ids() {
            for &node in &program.subgraph(id).nodes {
                if let Some(target) = program.node(node).partial_target() {
                    if target.0 >= program.subgraphs.len() {
                        return Err(ScheduleError::UnknownSubgraph {
                            partial: node,
                            target,
                        });
                    }
                    catalog.record_caller(target, node);
                }
            }
        }

        // Segments and exits are entered through links rather than partials, so
        // they ride along with the subgraph they were cut from or wrap.
        let mut attached: BTreeMap<SubgraphId, Vec<SubgraphId>> = BTreeMap::new();
        for id in program.subgraph_ids() {
            match program.subgraph(id).kind {
                SubgraphKind::Segment { origin } => attached.entry(origin).or_default().push(id),
                SubgraphKind::Exit { body } => attached.entry(body).or_default().push(id),
                _ => {}
            }
        }

        let mut queue = VecDeque::from([program.entry]);
        while let Some(id) = queue.pop_front() {
            if !catalog.reachable.insert(id) {
                continue;
            }
            queue.extend(attached.get(&id).into_iter().flatten().copied());
            for &node in &program.subgraph(id).nodes {
                if let Some(target) = program.node(node).partial_target() {
                    if !catalog.reachable.contains(&target) {
                        queue.push_back(target);
                    }
                }
            }
        }
        Ok(catalog)
    }

    pub fn record_caller(&mut self, subgraph: SubgraphId, partial: NodeId) {
        self.callers.entry(subgraph).or_default().insert(partial);
    }

    pub fn callers(&self, subgraph: SubgraphId) -> BTreeSet<NodeId> {
        self.callers.get(&subgraph).cloned().unwrap_or_default()
    }

    pub fn caller_count(&self, subgraph: SubgraphId) -> usize {
        self.callers.get(&subgraph).map_or(0, BTreeSet::len)
    }

    /// Reachable subgraphs named by more than one partial, in id order.
    pub fn multiply_called(&self) -> Vec<SubgraphId> {
        self.callers
            .iter()
            .filter(|(id, callers)| callers.len() > 1 && self.reachable.contains(id))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn is_reachable(&self, subgraph: SubgraphId) -> bool {
        self.reachable.contains(&subgraph)
    }

    pub fn reachable(&self) -> impl Iterator<Item = SubgraphId> + '_ {
        self.reachable.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callflow_ir::{KernelOp, ProgramBuilder};

    #[test]
    fn records_each_partial_and_skips_dead_subgraphs() {
        let mut builder = ProgramBuilder::new();
        let x = builder.tensor("x", &[1]);
        let fx = builder.tensor("f_x", &[1]);
        let fy = builder.tensor("f_y", &[1]);
        let h0 = builder.tensor("h0", &[]);
        let h1 = builder.tensor("h1", &[]);
        let r0 = builder.tensor("r0", &[1]);
        let out = builder.tensor("out", &[1]);

        let main = builder.declare("main");
        let f = builder.declare("f");
        let dead = builder.declare("dead");
        builder
            .subgraph(f)
            .inputs(&[fx])
            .kernel("neg", KernelOp::Neg, &[fx], &[fy])
            .returns(&[fy])
            .finish();
        builder.subgraph(dead).returns(&[]).finish();
        builder
            .subgraph(main)
            .inputs(&[x])
            .partial("p0", f, &[x], h0)
            .call("c0", h0, &[r0])
            .partial("p1", f, &[r0], h1)
            .call("c1", h1, &[out])
            .returns(&[out])
            .finish();
        let program = builder.build(main).unwrap();

        let catalog = SubgraphCatalog::build(&program).unwrap();
        assert_eq!(catalog.caller_count(f), 2);
        assert_eq!(catalog.multiply_called(), vec![f]);
        assert!(catalog.is_reachable(main));
        assert!(!catalog.is_reachable(dead));
        assert_eq!(catalog.caller_count(dead), 0);
    }
}
