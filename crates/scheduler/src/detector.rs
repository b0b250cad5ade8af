//! Non-tail call detection and call-graph cycle checks.

use crate::catalog::SubgraphCatalog;
use crate::error::{ScheduleError, ScheduleResult};
use callflow_ir::{NodeId, NodeKind, Program, SubgraphId, TensorId};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;

/// A call is tail when it is the last node and returns exactly the subgraph outputs.
pub fn is_tail_call(program: &Program, subgraph: SubgraphId, call: NodeId) -> bool {
    let owner = program.subgraph(subgraph);
    owner.last_node() == Some(call) && program.node(call).outputs == owner.outputs
}

pub fn non_tail_calls(program: &Program, subgraph: SubgraphId) -> Vec<NodeId> {
    program
        .subgraph(subgraph)
        .nodes
        .iter()
        .copied()
        .filter(|&node| program.node(node).is_call() && !is_tail_call(program, subgraph, node))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallEdge {
    pub caller: SubgraphId,
    pub call: NodeId,
    pub partial: NodeId,
    pub callee: SubgraphId,
    pub tail: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Detection {
    /// Non-tail calls per subgraph, in node order.
    pub non_tail_calls: BTreeMap<SubgraphId, Vec<NodeId>>,
    pub multiply_called: BTreeSet<SubgraphId>,
    pub edges: Vec<CallEdge>,
}

impl Detection {
    pub fn non_tail_count(&self) -> usize {
        self.non_tail_calls.values().map(Vec::len).sum()
    }
}

pub struct NonTailCallDetector<'a> {
    program: &'a Program,
    producers: HashMap<TensorId, NodeId>,
}

impl<'a> NonTailCallDetector<'a> {
    pub fn new(program: &'a Program) -> Self {
        Self {
            program,
            producers: program.producers(),
        }
    }

    pub fn detect(&self, catalog: &SubgraphCatalog) -> ScheduleResult<Detection> {
        let mut detection = Detection {
            multiply_called: catalog.multiply_called().into_iter().collect(),
            ..Detection::default()
        };

        for &id in &self.program.order {
            for &node in &self.program.subgraph(id).nodes {
                if !self.program.node(node).is_call() {
                    continue;
                }
                let tail = is_tail_call(self.program, id, node);
                if !tail {
                    detection.non_tail_calls.entry(id).or_default().push(node);
                }
                for partial in self.resolve_partials(id, node)? {
                    if let Some(callee) = self.program.node(partial).partial_target() {
                        detection.edges.push(CallEdge {
                            caller: id,
                            call: node,
                            partial,
                            callee,
                            tail,
                        });
                    }
                }
            }
        }

        check_non_tail_cycles(&detection.edges)?;
        debug!(
            non_tail_calls = detection.non_tail_count(),
            multiply_called = detection.multiply_called.len(),
            edges = detection.edges.len(),
            "detected call structure"
        );
        Ok(detection)
    }

    /// Partials reachable from the call's handle, looking through switches.
    pub fn resolve_partials(
        &self,
        subgraph: SubgraphId,
        call: NodeId,
    ) -> ScheduleResult<BTreeSet<NodeId>> {
        let unresolved = || ScheduleError::UnresolvedCall { call, subgraph };
        let handle = *self.program.node(call).inputs.first().ok_or_else(unresolved)?;

        let mut partials = BTreeSet::new();
        let mut visited = HashSet::new();
        let mut pending = vec![handle];
        while let Some(tensor) = pending.pop() {
            if !visited.insert(tensor) {
                continue;
            }
            let producer = *self.producers.get(&tensor).ok_or_else(unresolved)?;
            let node = self.program.node(producer);
            match node.kind {
                NodeKind::Partial { .. } => {
                    partials.insert(producer);
                }
                NodeKind::Switch | NodeKind::SwitchLayer => {
                    pending.extend(node.branch_inputs().iter().copied());
                }
                _ => return Err(unresolved()),
            }
        }

        if partials.is_empty() {
            return Err(unresolved());
        }
        Ok(partials)
    }
}

fn check_non_tail_cycles(edges: &[CallEdge]) -> ScheduleResult<()> {
    let mut adjacency: BTreeMap<SubgraphId, BTreeSet<SubgraphId>> = BTreeMap::new();
    for edge in edges {
        adjacency.entry(edge.caller).or_default().insert(edge.callee);
    }

    for edge in edges.iter().filter(|edge| !edge.tail) {
        if reaches(&adjacency, edge.callee, edge.caller) {
            return Err(ScheduleError::NonTailCycle {
                call: edge.call,
                subgraph: edge.caller,
                callee: edge.callee,
            });
        }
    }
    Ok(())
}

fn reaches(
    adjacency: &BTreeMap<SubgraphId, BTreeSet<SubgraphId>>,
    from: SubgraphId,
    to: SubgraphId,
) -> bool {
    let mut visited = BTreeSet::new();
    let mut pending = vec![from];
    while let Some(id) = pending.pop() {
        if id == to {
            return true;
        }
        if !visited.insert(id) {
            continue;
        }
        if let Some(next) = adjacency.get(&id) {
            pending.extend(next.iter().copied());
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use callflow_ir::{KernelOp, ProgramBuilder};

    fn detect(program: &Program) -> ScheduleResult<Detection> {
        let catalog = SubgraphCatalog::build(program)?;
        NonTailCallDetector::new(program).detect(&catalog)
    }

    #[test]
    fn flags_call_followed_by_kernel() {
        let mut builder = ProgramBuilder::new();
        let x = builder.tensor("x", &[2]);
        let tx = builder.tensor("t_x", &[2]);
        let h = builder.tensor("h", &[]);
        let r = builder.tensor("r", &[2]);
        let out = builder.tensor("out", &[2]);
        let main = builder.declare("main");
        let t = builder.declare("t");
        builder.subgraph(t).inputs(&[tx]).returns(&[tx]).finish();
        builder
            .subgraph(main)
            .inputs(&[x])
            .partial("p", t, &[x], h)
            .call("c", h, &[r])
            .kernel("add", KernelOp::Add, &[r, x], &[out])
            .returns(&[out])
            .finish();
        let program = builder.build(main).unwrap();

        let detection = detect(&program).unwrap();
        let call = program.subgraph(main).nodes[1];
        assert_eq!(detection.non_tail_calls.get(&main), Some(&vec![call]));
        assert_eq!(detection.edges.len(), 1);
        assert!(!detection.edges[0].tail);
    }

    #[test]
    fn last_call_with_foreign_outputs_is_not_tail() {
        let mut builder = ProgramBuilder::new();
        let x = builder.tensor("x", &[2]);
        let tx = builder.tensor("t_x", &[2]);
        let h = builder.tensor("h", &[]);
        let r = builder.tensor("r", &[2]);
        let main = builder.declare("main");
        let t = builder.declare("t");
        builder.subgraph(t).inputs(&[tx]).returns(&[tx]).finish();
        builder
            .subgraph(main)
            .inputs(&[x])
            .partial("p", t, &[x], h)
            .call("c", h, &[r])
            .returns(&[x])
            .finish();
        let program = builder.build(main).unwrap();

        assert_eq!(non_tail_calls(&program, main).len(), 1);
    }

    #[test]
    fn switch_branches_count_as_distinct_callers() {
        let mut builder = ProgramBuilder::new();
        let cond = builder.tensor("cond", &[1]);
        let x = builder.tensor("x", &[1]);
        let tx = builder.tensor("t_x", &[1]);
        let ha = builder.tensor("ha", &[]);
        let hb = builder.tensor("hb", &[]);
        let h = builder.tensor("h", &[]);
        let out = builder.tensor("out", &[1]);
        let main = builder.declare("main");
        let t = builder.declare("t");
        builder.subgraph(t).inputs(&[tx]).returns(&[tx]).finish();
        builder
            .subgraph(main)
            .inputs(&[cond, x])
            .partial("pa", t, &[x], ha)
            .partial("pb", t, &[cond], hb)
            .switch("sw", cond, ha, hb, h)
            .call("c", h, &[out])
            .returns(&[out])
            .finish();
        let program = builder.build(main).unwrap();

        let detection = detect(&program).unwrap();
        assert!(detection.multiply_called.contains(&t));
        assert_eq!(detection.edges.len(), 2);
        assert!(detection.non_tail_calls.is_empty());
    }

    #[test]
    fn call_on_plain_tensor_is_unresolved() {
        let mut builder = ProgramBuilder::new();
        let x = builder.tensor("x", &[1]);
        let out = builder.tensor("out", &[1]);
        let main = builder.declare("main");
        builder
            .subgraph(main)
            .inputs(&[x])
            .call("c", x, &[out])
            .returns(&[out])
            .finish();
        let program = builder.build(main).unwrap();
        let call = program.subgraph(main).nodes[0];

        assert_eq!(
            detect(&program).unwrap_err(),
            ScheduleError::UnresolvedCall {
                call,
                subgraph: main
            }
        );
    }

    #[test]
    fn mutual_non_tail_recursion_is_a_cycle() {
        let mut builder = ProgramBuilder::new();
        let x = builder.tensor("x", &[1]);
        let ax = builder.tensor("a_x", &[1]);
        let ar = builder.tensor("a_r", &[1]);
        let ay = builder.tensor("a_y", &[1]);
        let bx = builder.tensor("b_x", &[1]);
        let ha = builder.tensor("ha", &[]);
        let hb = builder.tensor("hb", &[]);
        let hm = builder.tensor("hm", &[]);
        let bout = builder.tensor("b_out", &[1]);
        let out = builder.tensor("out", &[1]);
        let main = builder.declare("main");
        let a = builder.declare("a");
        let b = builder.declare("b");
        builder
            .subgraph(a)
            .inputs(&[ax])
            .partial("pb", b, &[ax], hb)
            .call("cb", hb, &[ar])
            .kernel("neg", KernelOp::Neg, &[ar], &[ay])
            .returns(&[ay])
            .finish();
        builder
            .subgraph(b)
            .inputs(&[bx])
            .partial("pa", a, &[bx], ha)
            .call("ca", ha, &[bout])
            .returns(&[bout])
            .finish();
        builder
            .subgraph(main)
            .inputs(&[x])
            .partial("pm", a, &[x], hm)
            .call("cm", hm, &[out])
            .returns(&[out])
            .finish();
        let program = builder.build(main).unwrap();

        assert!(matches!(
            detect(&program),
            Err(ScheduleError::NonTailCycle { subgraph, callee, .. }) if subgraph == a && callee == b
        ));
    }
}
