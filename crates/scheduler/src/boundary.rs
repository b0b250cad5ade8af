//! Boundary builder: entrance and exit wrappers around multiply-called subgraphs.

use crate::error::{ScheduleError, ScheduleResult, ScheduleWarning};
use crate::links::LinkRecorder;
use callflow_ir::{
    DataType, KernelOp, Link, Node, NodeId, NodeKind, Program, Subgraph, SubgraphId, SubgraphKind,
    Tensor, TensorId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

/// When callers of one body may share an exit wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitSharing {
    /// Callers whose results land in the same destination tensors share an exit.
    #[default]
    ByDestination,
    /// Every caller gets its own exit.
    PerCaller,
}

/// Callers routed to one destination, i.e. one exit wrapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerGroup {
    pub destination: Vec<TensorId>,
    pub callers: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntranceWrapper {
    pub caller: NodeId,
    pub entrance: SubgraphId,
    pub exit: SubgraphId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Boundary {
    pub body: SubgraphId,
    pub entrances: Vec<EntranceWrapper>,
    pub exits: Vec<SubgraphId>,
}

pub struct BoundaryBuilder {
    sharing: ExitSharing,
}

impl BoundaryBuilder {
    pub fn new(sharing: ExitSharing) -> Self {
        Self { sharing }
    }

    /// Groups live callers of `body` by destination. Callers whose handle never
    /// reaches a call are reported and left out.
    pub fn group_callers(
        &self,
        program: &Program,
        body: SubgraphId,
        callers: &BTreeSet<NodeId>,
        warnings: &mut Vec<ScheduleWarning>,
    ) -> ScheduleResult<Vec<CallerGroup>> {
        let consumers = program.consumers();
        let mut groups: Vec<CallerGroup> = Vec::new();

        for &partial in callers {
            let Some(call) = destination_call(program, &consumers, partial)? else {
                warn!(partial = %partial, subgraph = %body, "partial feeds no call");
                warnings.push(ScheduleWarning::DeadCaller {
                    partial,
                    subgraph: body,
                });
                continue;
            };
            let destination = program.node(call).outputs.clone();

            let shared = match self.sharing {
                ExitSharing::ByDestination => groups
                    .iter_mut()
                    .find(|group| group.destination == destination),
                ExitSharing::PerCaller => None,
            };
            match shared {
                Some(group) => group.callers.push(partial),
                None => groups.push(CallerGroup {
                    destination,
                    callers: vec![partial],
                }),
            }
        }
        Ok(groups)
    }

    /// True when every live caller already goes through one of `body`'s own entrances.
    pub fn is_bounded(program: &Program, body: SubgraphId, groups: &[CallerGroup]) -> bool {
        let owners = program.node_owners();
        let mut live = groups.iter().flat_map(|group| group.callers.iter()).peekable();
        live.peek().is_some()
            && live.all(|partial| {
                owners.get(partial).map(|&owner| program.subgraph(owner).kind)
                    == Some(SubgraphKind::Entrance { body })
            })
    }

    pub fn build(
        &self,
        program: &mut Program,
        body: SubgraphId,
        groups: Vec<CallerGroup>,
        links: &mut LinkRecorder,
    ) -> Boundary {
        let body_name = program.subgraph(body).name.clone();
        let formals = program.subgraph(body).inputs.clone();
        let mut boundary = Boundary {
            body,
            entrances: Vec::new(),
            exits: Vec::new(),
        };
        let mut exit_anchor = body;

        for (group_index, group) in groups.into_iter().enumerate() {
            let exit_name = format!("{}_exit{}", body_name, group_index);
            let link_tensors: Vec<TensorId> = group
                .destination
                .iter()
                .enumerate()
                .map(|(index, &tensor)| {
                    program.new_tensor_like(tensor, format!("{}_link{}", exit_name, index))
                })
                .collect();
            let exit_copy = program.add_node(Node::new(
                format!("{}_copy", exit_name),
                NodeKind::Kernel(KernelOp::Copy),
                link_tensors.clone(),
                group.destination.clone(),
            ));
            let exit = program.add_subgraph(Subgraph {
                name: exit_name,
                kind: SubgraphKind::Exit { body },
                inputs: link_tensors.clone(),
                outputs: group.destination,
                nodes: vec![exit_copy],
            });
            program.insert_in_order_after(exit_anchor, exit);
            exit_anchor = exit;
            boundary.exits.push(exit);

            for caller in group.callers {
                let entrance_name =
                    format!("{}_entrance{}", body_name, boundary.entrances.len());
                let slots: Vec<TensorId> = formals
                    .iter()
                    .enumerate()
                    .map(|(index, &tensor)| {
                        program.new_tensor_like(tensor, format!("{}_arg{}", entrance_name, index))
                    })
                    .collect();
                let handle = program.add_tensor(Tensor::new(
                    format!("{}_handle", entrance_name),
                    Vec::new(),
                    DataType::F32,
                ));
                let partial = program.add_node(Node::new(
                    format!("{}_partial", entrance_name),
                    NodeKind::Partial { subgraph: body },
                    slots.clone(),
                    vec![handle],
                ));
                let call = program.add_node(Node::new(
                    format!("{}_call", entrance_name),
                    NodeKind::Call,
                    vec![handle],
                    link_tensors.clone(),
                ));
                let entrance = program.add_subgraph(Subgraph {
                    name: entrance_name,
                    kind: SubgraphKind::Entrance { body },
                    inputs: slots,
                    outputs: link_tensors.clone(),
                    nodes: vec![partial, call],
                });
                program.insert_in_order_before(body, entrance);
                program.node_mut(caller).kind = NodeKind::Partial { subgraph: entrance };

                links.record_link(Link {
                    call,
                    continuation: exit,
                    consumer: exit_copy,
                    tensors: link_tensors.clone(),
                });
                boundary.entrances.push(EntranceWrapper {
                    caller,
                    entrance,
                    exit,
                });
            }
        }

        debug!(
            subgraph = %body,
            entrances = boundary.entrances.len(),
            exits = boundary.exits.len(),
            "built boundary for multiply-called subgraph"
        );
        boundary
    }
}

/// Gives every call its own partials when one handle reaches several calls.
///
/// For each call after the first that a partial's handle reaches, the partial and
/// any switches between it and the call are cloned right before that call, and
/// the call is re-pointed at the clone. Afterwards each caller has exactly one
/// destination. Handles that reach a call from another subgraph are left alone.
/// Returns the number of calls re-pointed.
pub fn separate_shared_handles(program: &mut Program) -> usize {
    let partials: Vec<NodeId> = program
        .node_owners()
        .into_iter()
        .filter(|(node, _)| matches!(program.node(*node).kind, NodeKind::Partial { .. }))
        .map(|(node, _)| node)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut rewired = 0;
    for partial in partials {
        let calls = reached_calls(program, &program.consumers(), partial);
        if calls.len() < 2 {
            continue;
        }
        for call in calls.into_iter().skip(1) {
            if rewire_call(program, call) {
                rewired += 1;
            }
        }
    }
    if rewired > 0 {
        debug!(calls = rewired, "separated handles shared between calls");
    }
    rewired
}

/// Clones the handle tree feeding `call` inside its own subgraph.
fn rewire_call(program: &mut Program, call: NodeId) -> bool {
    let owners = program.node_owners();
    let Some(&subgraph) = owners.get(&call) else {
        return false;
    };
    let producers = program.producers();
    let handle = program.node(call).inputs[0];
    let suffix = program.node(call).name.clone();
    let mut clones = Vec::new();
    let fresh = clone_handle_tree(
        program,
        &producers,
        &owners,
        subgraph,
        handle,
        &suffix,
        &mut clones,
    );
    if fresh == handle {
        return false;
    }

    let nodes = &mut program.subgraph_mut(subgraph).nodes;
    let position = nodes
        .iter()
        .position(|&node| node == call)
        .unwrap_or(nodes.len());
    for (offset, clone) in clones.into_iter().enumerate() {
        nodes.insert(position + offset, clone);
    }
    program.node_mut(call).inputs[0] = fresh;
    true
}

fn clone_handle_tree(
    program: &mut Program,
    producers: &HashMap<TensorId, NodeId>,
    owners: &HashMap<NodeId, SubgraphId>,
    subgraph: SubgraphId,
    handle: TensorId,
    suffix: &str,
    clones: &mut Vec<NodeId>,
) -> TensorId {
    let Some(&producer) = producers.get(&handle) else {
        return handle;
    };
    if owners.get(&producer) != Some(&subgraph) {
        return handle;
    }
    let node = program.node(producer).clone();
    let inputs = match node.kind {
        NodeKind::Partial { .. } => node.inputs.clone(),
        NodeKind::Switch | NodeKind::SwitchLayer => {
            let mut inputs = node.inputs.clone();
            for input in inputs.iter_mut().skip(1) {
                *input =
                    clone_handle_tree(program, producers, owners, subgraph, *input, suffix, clones);
            }
            inputs
        }
        _ => return handle,
    };
    let name = format!("{}_{}", program.tensor(handle).name, suffix);
    let fresh = program.new_tensor_like(handle, name);
    let clone = program.add_node(Node::new(
        format!("{}_{}", node.name, suffix),
        node.kind,
        inputs,
        vec![fresh],
    ));
    clones.push(clone);
    fresh
}

/// Calls a partial's handle reaches, looking through switches.
fn reached_calls(
    program: &Program,
    consumers: &HashMap<TensorId, Vec<NodeId>>,
    partial: NodeId,
) -> BTreeSet<NodeId> {
    let mut calls = BTreeSet::new();
    let mut visited = HashSet::new();
    let mut pending: Vec<TensorId> = program.node(partial).outputs.clone();

    while let Some(handle) = pending.pop() {
        if !visited.insert(handle) {
            continue;
        }
        for &reader in consumers.get(&handle).map(Vec::as_slice).unwrap_or(&[]) {
            let node = program.node(reader);
            match node.kind {
                NodeKind::Call if node.inputs.first() == Some(&handle) => {
                    calls.insert(reader);
                }
                NodeKind::Switch | NodeKind::SwitchLayer
                    if node.branch_inputs().contains(&handle) =>
                {
                    pending.extend(node.outputs.iter().copied());
                }
                _ => {}
            }
        }
    }
    calls
}

/// The single call a partial's handle reaches.
fn destination_call(
    program: &Program,
    consumers: &HashMap<TensorId, Vec<NodeId>>,
    partial: NodeId,
) -> ScheduleResult<Option<NodeId>> {
    let calls = reached_calls(program, consumers, partial);
    match calls.len() {
        0 => Ok(None),
        1 => Ok(calls.into_iter().next()),
        count => Err(ScheduleError::AmbiguousPartial {
            partial,
            calls: count,
        }),
    }
}
