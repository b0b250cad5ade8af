//! Runtime values and tensor environments.

use anyhow::{anyhow, bail, Context, Result};
use callflow_ir::{Program, SubgraphId, TensorId};
use ndarray::{ArrayD, IxDyn};
use std::collections::HashMap;

/// A subgraph with its arguments already bound, as produced by a partial node.
#[derive(Debug, Clone, PartialEq)]
pub struct Closure {
    pub subgraph: SubgraphId,
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Tensor(ArrayD<f32>),
    Closure(Closure),
}

impl Value {
    pub fn as_tensor(&self) -> Option<&ArrayD<f32>> {
        match self {
            Value::Tensor(array) => Some(array),
            Value::Closure(_) => None,
        }
    }
}

impl From<ArrayD<f32>> for Value {
    fn from(array: ArrayD<f32>) -> Self {
        Value::Tensor(array)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Environment {
    values: HashMap<TensorId, Value>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, id: TensorId, value: Value) {
        self.values.insert(id, value);
    }

    pub fn bind_all(&mut self, ids: &[TensorId], values: Vec<Value>) -> Result<()> {
        if ids.len() != values.len() {
            bail!("binding {} values to {} tensors", values.len(), ids.len());
        }
        for (&id, value) in ids.iter().zip(values) {
            self.bind(id, value);
        }
        Ok(())
    }

    /// Looks up a tensor, materializing program constants on first use.
    pub fn value(&self, program: &Program, id: TensorId) -> Result<Value> {
        if let Some(value) = self.values.get(&id) {
            return Ok(value.clone());
        }
        let tensor = program.tensor(id);
        let data = tensor
            .constant
            .clone()
            .ok_or_else(|| anyhow!("{} ({}) read before it was written", id, tensor.name))?;
        let array = ArrayD::from_shape_vec(IxDyn(&tensor.shape), data)
            .with_context(|| format!("constant {} ({})", id, tensor.name))?;
        Ok(Value::Tensor(array))
    }

    pub fn values(&self, program: &Program, ids: &[TensorId]) -> Result<Vec<Value>> {
        ids.iter().map(|&id| self.value(program, id)).collect()
    }

    pub fn tensor(&self, program: &Program, id: TensorId) -> Result<ArrayD<f32>> {
        match self.value(program, id)? {
            Value::Tensor(array) => Ok(array),
            Value::Closure(_) => bail!("{} holds a subgraph handle, expected a tensor", id),
        }
    }

    pub fn closure(&self, program: &Program, id: TensorId) -> Result<Closure> {
        match self.value(program, id)? {
            Value::Closure(closure) => Ok(closure),
            Value::Tensor(_) => bail!("{} holds a tensor, expected a subgraph handle", id),
        }
    }
}

/// Checks the entry arguments against the declared input tensors.
pub fn entry_arguments(program: &Program, inputs: &[ArrayD<f32>]) -> Result<Vec<Value>> {
    let formals = program.entry_inputs();
    if formals.len() != inputs.len() {
        bail!(
            "entry takes {} inputs but {} were supplied",
            formals.len(),
            inputs.len()
        );
    }
    formals
        .iter()
        .zip(inputs)
        .map(|(&id, array)| {
            let declared = &program.tensor(id).shape;
            if array.shape() != declared.as_slice() {
                bail!(
                    "input {} expects shape {:?}, got {:?}",
                    program.tensor(id).name,
                    declared,
                    array.shape()
                );
            }
            Ok(Value::Tensor(array.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use callflow_ir::{KernelOp, ProgramBuilder};

    #[test]
    fn constants_materialize_on_read() {
        let mut builder = ProgramBuilder::new();
        let x = builder.tensor("x", &[2]);
        let bias = builder.constant("bias", &[2], vec![0.5, -1.0]);
        let out = builder.tensor("out", &[2]);
        let main = builder.declare("main");
        builder
            .subgraph(main)
            .inputs(&[x])
            .kernel("add", KernelOp::Add, &[x, bias], &[out])
            .returns(&[out])
            .finish();
        let program = builder.build(main).unwrap();

        let env = Environment::new();
        let value = env.tensor(&program, bias).unwrap();
        assert_eq!(value.as_slice(), Some(&[0.5, -1.0][..]));
        assert!(env.tensor(&program, out).is_err());
    }

    #[test]
    fn entry_arguments_check_shapes() {
        let mut builder = ProgramBuilder::new();
        let x = builder.tensor("x", &[2]);
        let main = builder.declare("main");
        builder.subgraph(main).inputs(&[x]).returns(&[x]).finish();
        let program = builder.build(main).unwrap();

        let good = ArrayD::<f32>::zeros(IxDyn(&[2]));
        let bad = ArrayD::<f32>::zeros(IxDyn(&[3]));
        assert!(entry_arguments(&program, &[good]).is_ok());
        assert!(entry_arguments(&program, &[bad]).is_err());
        assert!(entry_arguments(&program, &[]).is_err());
    }
}
