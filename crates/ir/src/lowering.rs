//! Lowering of a scheduled program into the flattened plan handed to executors.

use crate::dialect::{Link, NodeId, NodeKind, SubgraphId, SubgraphKind};
use crate::program::Program;
use anyhow::{bail, ensure, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Terminator {
    /// Subgraph ends without a call and hands its outputs back.
    Return,
    /// Subgraph ends in a call whose result is the subgraph's own result.
    TailCall { call: NodeId },
    /// Subgraph ends in a call that resumes `continuation` once the callee returns.
    LinkedCall {
        call: NodeId,
        continuation: SubgraphId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoweredSubgraph {
    pub id: SubgraphId,
    pub name: String,
    pub kind: SubgraphKind,
    pub nodes: Vec<NodeId>,
    pub terminator: Terminator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub program: Program,
    pub schedule: Vec<LoweredSubgraph>,
}

impl ExecutionPlan {
    /// Freezes a scheduled program. Every call must sit last in its subgraph and
    /// either be a tail call or carry a link to its continuation. Segments and
    /// exits only run when a link resumes them.
    pub fn lower(program: Program) -> Result<Self> {
        let links = &program.links;
        for (call, link) in links {
            ensure!(
                call.0 < program.nodes.len() && program.node(*call).is_call(),
                "link recorded for {} which is not a call",
                call
            );
            ensure!(
                link.continuation.0 < program.subgraphs.len(),
                "link for {} resumes unknown {}",
                call,
                link.continuation
            );
        }

        let resumed: BTreeSet<SubgraphId> = links.values().map(|link| link.continuation).collect();
        let mut schedule = Vec::with_capacity(program.order.len());
        for &id in &program.order {
            let subgraph = program.subgraph(id);
            if matches!(
                subgraph.kind,
                SubgraphKind::Segment { .. } | SubgraphKind::Exit { .. }
            ) {
                ensure!(
                    resumed.contains(&id),
                    "{} ({}) is a continuation that no link resumes",
                    id,
                    subgraph.name
                );
            }
            let body_len = subgraph.nodes.len();
            for (position, &node_id) in subgraph.nodes.iter().enumerate() {
                if program.node(node_id).is_call() && position + 1 != body_len {
                    bail!(
                        "{} in {} ({}) is followed by further nodes; the program was not scheduled",
                        node_id,
                        id,
                        subgraph.name
                    );
                }
            }

            let terminator = match subgraph.last_node() {
                Some(last) if matches!(program.node(last).kind, NodeKind::Call) => {
                    if let Some(link) = links.get(&last) {
                        Terminator::LinkedCall {
                            call: last,
                            continuation: link.continuation,
                        }
                    } else if program.node(last).outputs == subgraph.outputs {
                        Terminator::TailCall { call: last }
                    } else {
                        bail!(
                            "{} ends {} ({}) without returning its results and has no link",
                            last,
                            id,
                            subgraph.name
                        );
                    }
                }
                _ => Terminator::Return,
            };

            schedule.push(LoweredSubgraph {
                id,
                name: subgraph.name.clone(),
                kind: subgraph.kind,
                nodes: subgraph.nodes.clone(),
                terminator,
            });
        }

        debug!(
            subgraphs = schedule.len(),
            links = links.len(),
            "lowered scheduled program"
        );
        Ok(Self { program, schedule })
    }

    /// Every call that resumes a continuation, entrance calls included.
    pub fn linked_calls(&self) -> Vec<NodeId> {
        self.program.links.keys().copied().collect()
    }

    /// Split calls of user subgraphs; entrance calls are left out.
    pub fn non_tail_calls(&self) -> Vec<NodeId> {
        let owners = self.program.node_owners();
        self.program
            .links
            .keys()
            .copied()
            .filter(|call| {
                owners.get(call).map_or(true, |&owner| {
                    !matches!(
                        self.program.subgraph(owner).kind,
                        SubgraphKind::Entrance { .. }
                    )
                })
            })
            .collect()
    }

    pub fn link_for(&self, call: NodeId) -> Option<&Link> {
        self.program.link_for(call)
    }

    pub fn lowered(&self, id: SubgraphId) -> Option<&LoweredSubgraph> {
        self.schedule.iter().find(|entry| entry.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ProgramBuilder;
    use crate::dialect::KernelOp;

    #[test]
    fn lower_rejects_unscheduled_call() -> Result<()> {
        let mut builder = ProgramBuilder::new();
        let x = builder.tensor("x", &[2]);
        let tx = builder.tensor("t_x", &[2]);
        let handle = builder.tensor("h", &[]);
        let r = builder.tensor("r", &[2]);
        let out = builder.tensor("out", &[2]);
        let main = builder.declare("main");
        let callee = builder.declare("callee");
        builder.subgraph(callee).inputs(&[tx]).returns(&[tx]).finish();
        builder
            .subgraph(main)
            .inputs(&[x])
            .partial("p", callee, &[x], handle)
            .call("c", handle, &[r])
            .kernel("add", KernelOp::Add, &[r, x], &[out])
            .returns(&[out])
            .finish();
        let program = builder.build(main)?;

        let err = ExecutionPlan::lower(program).unwrap_err();
        assert!(err.to_string().contains("not scheduled"));
        Ok(())
    }

    #[test]
    fn lower_classifies_tail_calls() -> Result<()> {
        let mut builder = ProgramBuilder::new();
        let x = builder.tensor("x", &[2]);
        let tx = builder.tensor("t_x", &[2]);
        let handle = builder.tensor("h", &[]);
        let out = builder.tensor("out", &[2]);
        let main = builder.declare("main");
        let callee = builder.declare("callee");
        builder.subgraph(callee).inputs(&[tx]).returns(&[tx]).finish();
        builder
            .subgraph(main)
            .inputs(&[x])
            .partial("p", callee, &[x], handle)
            .call("c", handle, &[out])
            .returns(&[out])
            .finish();
        let program = builder.build(main)?;

        let plan = ExecutionPlan::lower(program)?;
        assert!(matches!(
            plan.lowered(main).map(|entry| entry.terminator),
            Some(Terminator::TailCall { .. })
        ));
        assert_eq!(
            plan.lowered(callee).map(|entry| entry.terminator),
            Some(Terminator::Return)
        );
        assert!(plan.non_tail_calls().is_empty());
        Ok(())
    }

    #[test]
    fn lower_rejects_orphan_segment() -> Result<()> {
        let mut builder = ProgramBuilder::new();
        let x = builder.tensor("x", &[2]);
        let main = builder.declare("main");
        let segment = builder.declare("main_seg1");
        builder.subgraph(main).inputs(&[x]).returns(&[x]).finish();
        builder.subgraph(segment).returns(&[x]).finish();
        let mut program = builder.build(main)?;
        program.subgraph_mut(segment).kind = SubgraphKind::Segment { origin: main };

        let err = ExecutionPlan::lower(program).unwrap_err();
        assert!(err.to_string().contains("no link resumes"));
        Ok(())
    }
}
