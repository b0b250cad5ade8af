//! Call/return interpreter for programs that have not been scheduled.

use crate::kernels::execute_node;
use crate::runtime::{Execution, RuntimeOptions};
use crate::values::{entry_arguments, Environment, Value};
use anyhow::{bail, ensure, Result};
use callflow_ir::{NodeKind, Program, SubgraphId, SubgraphKind};
use ndarray::ArrayD;
use std::collections::BTreeMap;
use tracing::debug;

/// Runs calls by recursing on the host stack, so any call may sit anywhere in a
/// subgraph. Each invocation gets its own environment, shared with the
/// continuations its linked calls resume.
pub struct ReferenceInterpreter<'a> {
    program: &'a Program,
    options: RuntimeOptions,
}

#[derive(Default)]
struct Counters {
    calls: BTreeMap<SubgraphId, usize>,
    steps: usize,
}

impl<'a> ReferenceInterpreter<'a> {
    pub fn new(program: &'a Program, options: RuntimeOptions) -> Self {
        Self { program, options }
    }

    pub fn run(&self, inputs: &[ArrayD<f32>]) -> Result<Execution> {
        let args = entry_arguments(self.program, inputs)?;
        let mut counters = Counters::default();
        let results = self.invoke(self.program.entry, args, 0, &mut counters)?;

        let outputs = results
            .into_iter()
            .map(|value| match value {
                Value::Tensor(array) => Ok(array),
                Value::Closure(_) => bail!("program result is a subgraph handle"),
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(
            steps = counters.steps,
            calls = counters.calls.values().sum::<usize>(),
            "reference run finished"
        );
        Ok(Execution {
            outputs,
            call_counts: counters.calls,
            steps: counters.steps,
        })
    }

    fn invoke(
        &self,
        id: SubgraphId,
        args: Vec<Value>,
        depth: usize,
        counters: &mut Counters,
    ) -> Result<Vec<Value>> {
        ensure!(
            depth <= self.options.max_call_depth,
            "call depth {} exceeds the limit of {}",
            depth,
            self.options.max_call_depth
        );
        let subgraph = self.program.subgraph(id);
        if subgraph.kind == SubgraphKind::Body {
            *counters.calls.entry(id).or_default() += 1;
        }

        let mut env = Environment::new();
        env.bind_all(&subgraph.inputs, args)?;
        let mut current = subgraph;
        loop {
            for &node_id in &current.nodes {
                counters.steps += 1;
                ensure!(
                    counters.steps <= self.options.max_steps,
                    "step budget of {} exhausted",
                    self.options.max_steps
                );
                let node = self.program.node(node_id);
                if let NodeKind::Call = node.kind {
                    let closure = env.closure(self.program, node.inputs[0])?;
                    let results =
                        self.invoke(closure.subgraph, closure.args, depth + 1, counters)?;
                    env.bind_all(&node.outputs, results)?;
                } else {
                    execute_node(self.program, node_id, &mut env)?;
                }
            }
            // Scheduled programs resume a linked continuation in the same frame.
            match current
                .last_node()
                .and_then(|last| self.program.link_for(last))
            {
                Some(link) => current = self.program.subgraph(link.continuation),
                None => return env.values(self.program, &current.outputs),
            }
        }
    }
}
