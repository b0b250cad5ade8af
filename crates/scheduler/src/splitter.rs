//! Subgraph splitter: cuts a subgraph after its first non-tail call.

use crate::detector::{is_tail_call, non_tail_calls};
use callflow_ir::{
    KernelOp, Link, Node, NodeId, NodeKind, Program, Subgraph, SubgraphId, SubgraphKind, TensorId,
};
use std::iter;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitOutcome {
    /// The split subgraph; it keeps its id and now ends with `call`.
    pub head: SubgraphId,
    pub continuation: SubgraphId,
    pub call: NodeId,
    pub link: Link,
    /// Non-tail calls still left in the continuation.
    pub remaining_non_tail: usize,
}

/// Splits `id` at its first non-tail call, or returns `None` when there is none.
///
/// The call gets fresh link tensors as outputs, which also become the head's
/// outputs so the call is tail in the head. The continuation opens with a copy
/// from the link tensors into the call's former outputs, so every node after the
/// cut keeps reading the tensors it read before.
pub fn split_at_first_non_tail_call(program: &mut Program, id: SubgraphId) -> Option<SplitOutcome> {
    let position = program
        .subgraph(id)
        .nodes
        .iter()
        .position(|&node| program.node(node).is_call() && !is_tail_call(program, id, node))?;
    let call = program.subgraph(id).nodes[position];

    let call_name = program.node(call).name.clone();
    let original_outputs = program.node(call).outputs.clone();
    let link_tensors: Vec<TensorId> = original_outputs
        .iter()
        .enumerate()
        .map(|(index, &tensor)| program.new_tensor_like(tensor, format!("{}_link{}", call_name, index)))
        .collect();
    program.node_mut(call).outputs = link_tensors.clone();

    let origin = match program.subgraph(id).kind {
        SubgraphKind::Segment { origin } => origin,
        _ => id,
    };
    let origin_name = program.subgraph(origin).name.clone();
    let segment_index = program
        .subgraphs
        .iter()
        .filter(|subgraph| subgraph.kind == SubgraphKind::Segment { origin })
        .count()
        + 1;

    let resume = program.add_node(Node::new(
        format!("{}_resume{}", origin_name, segment_index),
        NodeKind::Kernel(KernelOp::Copy),
        link_tensors.clone(),
        original_outputs,
    ));

    let head = program.subgraph_mut(id);
    let rest = head.nodes.split_off(position + 1);
    let results = std::mem::replace(&mut head.outputs, link_tensors.clone());

    let segment = Subgraph {
        name: format!("{}_seg{}", origin_name, segment_index),
        kind: SubgraphKind::Segment { origin },
        inputs: link_tensors.clone(),
        outputs: results,
        nodes: iter::once(resume).chain(rest).collect(),
    };
    let continuation = program.add_subgraph(segment);
    program.insert_in_order_after(id, continuation);

    let remaining_non_tail = non_tail_calls(program, continuation).len();
    debug!(
        subgraph = %id,
        call = %call,
        continuation = %continuation,
        remaining_non_tail,
        "split subgraph at non-tail call"
    );

    Some(SplitOutcome {
        head: id,
        continuation,
        call,
        link: Link {
            call,
            continuation,
            consumer: resume,
            tensors: link_tensors,
        },
        remaining_non_tail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use callflow_ir::ProgramBuilder;

    struct Nested {
        program: Program,
        main: SubgraphId,
        first_call: NodeId,
        second_call: NodeId,
        r1: TensorId,
        out: TensorId,
    }

    fn nested() -> Nested {
        let mut builder = ProgramBuilder::new();
        let x = builder.tensor("x", &[2]);
        let tx = builder.tensor("t_x", &[2]);
        let ty = builder.tensor("t_y", &[2]);
        let h1 = builder.tensor("h1", &[]);
        let h2 = builder.tensor("h2", &[]);
        let r1 = builder.tensor("r1", &[2]);
        let r2 = builder.tensor("r2", &[2]);
        let out = builder.tensor("out", &[2]);
        let main = builder.declare("main");
        let t = builder.declare("t");
        builder
            .subgraph(t)
            .inputs(&[tx])
            .kernel("neg", KernelOp::Neg, &[tx], &[ty])
            .returns(&[ty])
            .finish();
        builder
            .subgraph(main)
            .inputs(&[x])
            .partial("p1", t, &[x], h1)
            .call("c1", h1, &[r1])
            .partial("p2", t, &[r1], h2)
            .call("c2", h2, &[r2])
            .kernel("add", KernelOp::Add, &[r2, x], &[out])
            .returns(&[out])
            .finish();
        let program = builder.build(main).unwrap();
        let first_call = program.subgraph(main).nodes[1];
        let second_call = program.subgraph(main).nodes[3];
        Nested {
            program,
            main,
            first_call,
            second_call,
            r1,
            out,
        }
    }

    #[test]
    fn head_keeps_id_and_ends_in_tail_call() {
        let Nested {
            mut program,
            main,
            first_call,
            r1,
            ..
        } = nested();

        let outcome = split_at_first_non_tail_call(&mut program, main).unwrap();
        assert_eq!(outcome.head, main);
        assert_eq!(outcome.call, first_call);
        assert_eq!(program.subgraph(main).nodes.len(), 2);
        assert!(is_tail_call(&program, main, first_call));
        assert_eq!(program.subgraph(main).outputs, outcome.link.tensors);

        let segment = program.subgraph(outcome.continuation);
        assert_eq!(segment.kind, SubgraphKind::Segment { origin: main });
        assert_eq!(segment.inputs, outcome.link.tensors);
        assert_eq!(segment.nodes[0], outcome.link.consumer);
        assert_eq!(program.node(outcome.link.consumer).outputs, vec![r1]);
        assert_eq!(outcome.remaining_non_tail, 1);
        assert_eq!(program.order, vec![main, outcome.continuation, SubgraphId(1)]);
        program.validate().unwrap();
    }

    #[test]
    fn repeated_splits_preserve_program_order() {
        let Nested {
            mut program,
            main,
            second_call,
            out,
            ..
        } = nested();

        let first = split_at_first_non_tail_call(&mut program, main).unwrap();
        let second = split_at_first_non_tail_call(&mut program, first.continuation).unwrap();
        assert_eq!(second.call, second_call);
        assert_eq!(second.remaining_non_tail, 0);
        assert!(split_at_first_non_tail_call(&mut program, second.continuation).is_none());

        let last = program.subgraph(second.continuation);
        assert_eq!(last.name, "main_seg2");
        assert_eq!(last.kind, SubgraphKind::Segment { origin: main });
        assert_eq!(last.outputs, vec![out]);
        assert_eq!(
            program.order,
            vec![main, first.continuation, second.continuation, SubgraphId(1)]
        );
        for id in [main, first.continuation, second.continuation] {
            assert!(non_tail_calls(&program, id).is_empty());
        }
        program.validate().unwrap();
    }

    #[test]
    fn subgraph_without_non_tail_calls_is_left_alone() {
        let Nested { mut program, .. } = nested();
        let before = program.clone();
        assert!(split_at_first_non_tail_call(&mut program, SubgraphId(1)).is_none());
        assert_eq!(program, before);
    }
}
