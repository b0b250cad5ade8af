//! Element-wise kernels and evaluation of non-call nodes.

use crate::values::{Closure, Environment, Value};
use anyhow::{bail, ensure, Result};
use callflow_ir::{KernelOp, NodeId, NodeKind, Program};
use ndarray::{ArrayD, Zip};

fn ensure_same_shape(op: KernelOp, lhs: &ArrayD<f32>, rhs: &ArrayD<f32>) -> Result<()> {
    ensure!(
        lhs.shape() == rhs.shape(),
        "{} shape mismatch: {:?} vs {:?}",
        op.as_str(),
        lhs.shape(),
        rhs.shape()
    );
    Ok(())
}

pub fn apply_kernel(op: KernelOp, inputs: Vec<ArrayD<f32>>) -> Result<Vec<ArrayD<f32>>> {
    if let Some(arity) = op.arity() {
        ensure!(
            inputs.len() == arity,
            "{} takes {} operands, got {}",
            op.as_str(),
            arity,
            inputs.len()
        );
    }

    let output = match op {
        KernelOp::Copy => return Ok(inputs),
        KernelOp::Neg => inputs[0].mapv(|x| -x),
        KernelOp::Add | KernelOp::Sub | KernelOp::Mul | KernelOp::Less => {
            let (lhs, rhs) = (&inputs[0], &inputs[1]);
            ensure_same_shape(op, lhs, rhs)?;
            match op {
                KernelOp::Add => lhs + rhs,
                KernelOp::Sub => lhs - rhs,
                KernelOp::Mul => lhs * rhs,
                _ => Zip::from(lhs)
                    .and(rhs)
                    .map_collect(|&a, &b| if a < b { 1.0 } else { 0.0 }),
            }
        }
    };
    Ok(vec![output])
}

/// A condition is taken when its first element is non-zero.
pub fn is_truthy(cond: &ArrayD<f32>) -> bool {
    cond.iter().next().is_some_and(|&value| value != 0.0)
}

pub fn branch_index(index: &ArrayD<f32>, branches: usize) -> Result<usize> {
    let Some(&raw) = index.iter().next() else {
        bail!("switch index tensor is empty");
    };
    ensure!(
        raw >= 0.0 && raw.fract() == 0.0 && (raw as usize) < branches,
        "switch index {} outside 0..{}",
        raw,
        branches
    );
    Ok(raw as usize)
}

/// Runs a kernel, partial or switch node against `env`. Calls are control
/// transfers and belong to the interpreters.
pub fn execute_node(program: &Program, id: NodeId, env: &mut Environment) -> Result<()> {
    let node = program.node(id);
    match node.kind {
        NodeKind::Kernel(op) => {
            let operands = node
                .inputs
                .iter()
                .map(|&tensor| env.tensor(program, tensor))
                .collect::<Result<Vec<_>>>()?;
            let results = apply_kernel(op, operands)?;
            env.bind_all(&node.outputs, results.into_iter().map(Value::Tensor).collect())?;
        }
        NodeKind::Partial { subgraph } => {
            let args = env.values(program, &node.inputs)?;
            env.bind(node.outputs[0], Value::Closure(Closure { subgraph, args }));
        }
        NodeKind::Switch => {
            let cond = env.tensor(program, node.inputs[0])?;
            let taken = if is_truthy(&cond) { node.inputs[1] } else { node.inputs[2] };
            let value = env.value(program, taken)?;
            env.bind(node.outputs[0], value);
        }
        NodeKind::SwitchLayer => {
            let index = env.tensor(program, node.inputs[0])?;
            let branches = node.branch_inputs();
            let taken = branches[branch_index(&index, branches.len())?];
            let value = env.value(program, taken)?;
            env.bind(node.outputs[0], value);
        }
        NodeKind::Call => bail!("{} ({}) is a call and cannot run inline", id, node.name),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, IxDyn};

    fn vector(values: &[f32]) -> ArrayD<f32> {
        arr1(values).into_dyn()
    }

    #[test]
    fn binary_kernels_are_elementwise() {
        let out = apply_kernel(
            KernelOp::Sub,
            vec![vector(&[3.0, 1.5]), vector(&[1.0, 0.25])],
        )
        .unwrap();
        assert_abs_diff_eq!(out[0][[0]], 2.0);
        assert_abs_diff_eq!(out[0][[1]], 1.25);

        let less = apply_kernel(
            KernelOp::Less,
            vec![vector(&[1.0, 4.0]), vector(&[2.0, 2.0])],
        )
        .unwrap();
        assert_eq!(less[0], vector(&[1.0, 0.0]));
    }

    #[test]
    fn shape_mismatch_is_an_error() {
        let err = apply_kernel(
            KernelOp::Add,
            vec![vector(&[1.0]), ArrayD::zeros(IxDyn(&[2]))],
        )
        .unwrap_err();
        assert!(err.to_string().contains("shape mismatch"));
    }

    #[test]
    fn copy_passes_every_operand_through() {
        let inputs = vec![vector(&[1.0]), vector(&[2.0, 3.0])];
        assert_eq!(apply_kernel(KernelOp::Copy, inputs.clone()).unwrap(), inputs);
    }

    #[test]
    fn switch_index_must_name_a_branch() {
        assert_eq!(branch_index(&vector(&[1.0]), 3).unwrap(), 1);
        assert!(branch_index(&vector(&[3.0]), 3).is_err());
        assert!(branch_index(&vector(&[-1.0]), 3).is_err());
        assert!(is_truthy(&vector(&[0.5])));
        assert!(!is_truthy(&vector(&[0.0, 1.0])));
    }
}
