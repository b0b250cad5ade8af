//! Sequential executor for scheduled programs.

use crate::kernels::execute_node;
use crate::values::{entry_arguments, Environment};
use anyhow::{bail, ensure, Context, Result};
use callflow_ir::{
    ExecutionPlan, LoweredSubgraph, NodeId, Program, SubgraphId, SubgraphKind, TensorId,
    Terminator,
};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    /// Nested calls (reference) or pending continuations (sequential) allowed at once.
    pub max_call_depth: usize,
    pub max_steps: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_call_depth: 256,
            max_steps: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub outputs: Vec<ArrayD<f32>>,
    /// Entries into body subgraphs, keyed by subgraph.
    pub call_counts: BTreeMap<SubgraphId, usize>,
    pub steps: usize,
}

/// Where a returning subgraph's results go and what runs next.
struct Frame {
    continuation: Option<SubgraphId>,
    link: Vec<TensorId>,
}

/// Runs a lowered plan with a single tensor store and an explicit stack of
/// continuations. No call ever returns to the node after it: a subgraph ends
/// by returning, tail-calling, or tail-calling with a continuation pushed.
pub struct SequentialExecutor<'a> {
    plan: &'a ExecutionPlan,
    index: HashMap<SubgraphId, &'a LoweredSubgraph>,
    options: RuntimeOptions,
}

impl<'a> SequentialExecutor<'a> {
    pub fn new(plan: &'a ExecutionPlan, options: RuntimeOptions) -> Self {
        let index = plan.schedule.iter().map(|entry| (entry.id, entry)).collect();
        Self {
            plan,
            index,
            options,
        }
    }

    fn program(&self) -> &'a Program {
        &self.plan.program
    }

    pub fn run(&self, inputs: &[ArrayD<f32>]) -> Result<Execution> {
        let program = self.program();
        let mut store = Environment::new();
        store.bind_all(program.entry_inputs(), entry_arguments(program, inputs)?)?;

        let mut frames = vec![Frame {
            continuation: None,
            link: program.outputs.clone(),
        }];
        let mut counts: BTreeMap<SubgraphId, usize> = BTreeMap::new();
        let mut steps = 0usize;
        let mut current = program.entry;
        count_entry(program, current, &mut counts);

        loop {
            let lowered = self
                .index
                .get(&current)
                .copied()
                .with_context(|| format!("{} is missing from the execution plan", current))?;
            trace!(subgraph = %current, name = %lowered.name, "entering subgraph");

            let inline = match lowered.terminator {
                Terminator::Return => &lowered.nodes[..],
                Terminator::TailCall { .. } | Terminator::LinkedCall { .. } => {
                    &lowered.nodes[..lowered.nodes.len().saturating_sub(1)]
                }
            };
            for &node in inline {
                steps += 1;
                ensure!(
                    steps <= self.options.max_steps,
                    "step budget of {} exhausted",
                    self.options.max_steps
                );
                execute_node(program, node, &mut store)?;
            }

            match lowered.terminator {
                Terminator::Return => {
                    let results = store.values(program, &program.subgraph(current).outputs)?;
                    let Some(frame) = frames.pop() else {
                        bail!("{} returned with no frame to return to", current);
                    };
                    store.bind_all(&frame.link, results)?;
                    match frame.continuation {
                        Some(next) => current = next,
                        None => break,
                    }
                }
                Terminator::TailCall { call } => {
                    current = self.enter_callee(call, &mut store)?;
                    count_entry(program, current, &mut counts);
                }
                Terminator::LinkedCall { call, continuation } => {
                    let link = self
                        .plan
                        .link_for(call)
                        .with_context(|| format!("{} has no recorded link", call))?;
                    ensure!(
                        frames.len() < self.options.max_call_depth,
                        "{} pending continuations exceed the limit of {}",
                        frames.len(),
                        self.options.max_call_depth
                    );
                    frames.push(Frame {
                        continuation: Some(continuation),
                        link: link.tensors.clone(),
                    });
                    current = self.enter_callee(call, &mut store)?;
                    count_entry(program, current, &mut counts);
                }
            }
        }

        let outputs = program
            .outputs
            .iter()
            .map(|&id| store.tensor(program, id))
            .collect::<Result<Vec<_>>>()?;
        debug!(
            steps,
            calls = counts.values().sum::<usize>(),
            "sequential run finished"
        );
        Ok(Execution {
            outputs,
            call_counts: counts,
            steps,
        })
    }

    /// Binds the closure behind `call`'s handle to its callee's inputs.
    fn enter_callee(&self, call: NodeId, store: &mut Environment) -> Result<SubgraphId> {
        let program = self.program();
        let closure = store.closure(program, program.node(call).inputs[0])?;
        let callee = program.subgraph(closure.subgraph);
        store.bind_all(&callee.inputs, closure.args)?;
        Ok(closure.subgraph)
    }
}

fn count_entry(program: &Program, id: SubgraphId, counts: &mut BTreeMap<SubgraphId, usize>) {
    if program.subgraph(id).kind == SubgraphKind::Body {
        *counts.entry(id).or_default() += 1;
    }
}
