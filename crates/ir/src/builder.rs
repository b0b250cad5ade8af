//! IR builder entrypoints and helpers.

use crate::dialect::{
    DataType, KernelOp, Node, NodeId, NodeKind, Subgraph, SubgraphId, SubgraphKind, Tensor, TensorId,
};
use crate::program::Program;
use anyhow::{ensure, Result};

#[derive(Debug, Default, Clone)]
pub struct ProgramBuilder {
    tensors: Vec<Tensor>,
    nodes: Vec<Node>,
    subgraphs: Vec<Subgraph>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self {
            tensors: Vec::new(),
            nodes: Vec::new(),
            subgraphs: Vec::new(),
        }
    }

    pub fn tensor(&mut self, name: &str, shape: &[usize]) -> TensorId {
        self.tensor_with_dtype(name, shape, DataType::F32)
    }

    pub fn tensor_with_dtype(&mut self, name: &str, shape: &[usize], dtype: DataType) -> TensorId {
        self.tensors.push(Tensor::new(name, shape.to_vec(), dtype));
        TensorId(self.tensors.len() - 1)
    }

    pub fn constant(&mut self, name: &str, shape: &[usize], values: Vec<f32>) -> TensorId {
        let tensor = Tensor::new(name, shape.to_vec(), DataType::F32).with_constant(values);
        self.tensors.push(tensor);
        TensorId(self.tensors.len() - 1)
    }

    /// Reserves a subgraph id so bodies can reference each other before being defined.
    pub fn declare<N: Into<String>>(&mut self, name: N) -> SubgraphId {
        self.subgraphs.push(Subgraph::new(name, SubgraphKind::Body));
        SubgraphId(self.subgraphs.len() - 1)
    }

    pub fn subgraph(&mut self, id: SubgraphId) -> SubgraphBuilder<'_> {
        SubgraphBuilder {
            program: self,
            id,
            inputs: Vec::new(),
            outputs: Vec::new(),
            nodes: Vec::new(),
        }
    }

    pub fn build(self, entry: SubgraphId) -> Result<Program> {
        ensure!(
            entry.0 < self.subgraphs.len(),
            "entry {} was never declared",
            entry
        );
        let outputs = self.subgraphs[entry.0].outputs.clone();
        let order = (0..self.subgraphs.len()).map(SubgraphId).collect();
        let program = Program {
            tensors: self.tensors,
            nodes: self.nodes,
            subgraphs: self.subgraphs,
            order,
            entry,
            outputs,
            links: Default::default(),
        };
        program.validate()?;
        Ok(program)
    }
}

pub struct SubgraphBuilder<'a> {
    program: &'a mut ProgramBuilder,
    id: SubgraphId,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    nodes: Vec<Node>,
}

impl SubgraphBuilder<'_> {
    /// Declares a tensor while the subgraph is still being assembled.
    pub fn tensor(&mut self, name: &str, shape: &[usize]) -> TensorId {
        self.program.tensor(name, shape)
    }

    pub fn inputs(mut self, inputs: &[TensorId]) -> Self {
        self.inputs = inputs.to_vec();
        self
    }

    pub fn kernel<N: Into<String>>(
        mut self,
        name: N,
        op: KernelOp,
        inputs: &[TensorId],
        outputs: &[TensorId],
    ) -> Self {
        self.nodes.push(Node::new(
            name,
            NodeKind::Kernel(op),
            inputs.to_vec(),
            outputs.to_vec(),
        ));
        self
    }

    pub fn partial<N: Into<String>>(
        mut self,
        name: N,
        callee: SubgraphId,
        args: &[TensorId],
        handle: TensorId,
    ) -> Self {
        self.nodes.push(Node::new(
            name,
            NodeKind::Partial { subgraph: callee },
            args.to_vec(),
            vec![handle],
        ));
        self
    }

    pub fn call<N: Into<String>>(mut self, name: N, handle: TensorId, outputs: &[TensorId]) -> Self {
        self.nodes.push(Node::new(
            name,
            NodeKind::Call,
            vec![handle],
            outputs.to_vec(),
        ));
        self
    }

    pub fn switch<N: Into<String>>(
        mut self,
        name: N,
        cond: TensorId,
        on_true: TensorId,
        on_false: TensorId,
        handle: TensorId,
    ) -> Self {
        self.nodes.push(Node::new(
            name,
            NodeKind::Switch,
            vec![cond, on_true, on_false],
            vec![handle],
        ));
        self
    }

    pub fn switch_layer<N: Into<String>>(
        mut self,
        name: N,
        index: TensorId,
        branches: &[TensorId],
        handle: TensorId,
    ) -> Self {
        let mut inputs = Vec::with_capacity(branches.len() + 1);
        inputs.push(index);
        inputs.extend_from_slice(branches);
        self.nodes
            .push(Node::new(name, NodeKind::SwitchLayer, inputs, vec![handle]));
        self
    }

    pub fn returns(mut self, outputs: &[TensorId]) -> Self {
        self.outputs = outputs.to_vec();
        self
    }

    pub fn finish(self) {
        let mut node_ids = Vec::with_capacity(self.nodes.len());
        for node in self.nodes {
            self.program.nodes.push(node);
            node_ids.push(NodeId(self.program.nodes.len() - 1));
        }
        let subgraph = &mut self.program.subgraphs[self.id.0];
        subgraph.inputs = self.inputs;
        subgraph.outputs = self.outputs;
        subgraph.nodes = node_ids;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_wires_partial_and_call() -> Result<()> {
        let mut builder = ProgramBuilder::new();
        let x = builder.tensor("x", &[2]);
        let tx = builder.tensor("t_x", &[2]);
        let ty = builder.tensor("t_y", &[2]);
        let handle = builder.tensor("h", &[]);
        let out = builder.tensor("out", &[2]);

        let main = builder.declare("main");
        let callee = builder.declare("callee");
        builder
            .subgraph(callee)
            .inputs(&[tx])
            .kernel("neg", KernelOp::Neg, &[tx], &[ty])
            .returns(&[ty])
            .finish();
        builder
            .subgraph(main)
            .inputs(&[x])
            .partial("p", callee, &[x], handle)
            .call("c", handle, &[out])
            .returns(&[out])
            .finish();

        let program = builder.build(main)?;
        assert_eq!(program.subgraphs.len(), 2);
        assert_eq!(program.outputs, vec![out]);
        assert_eq!(program.subgraph(main).nodes.len(), 2);
        let partial = program.node(program.subgraph(main).nodes[0]);
        assert_eq!(partial.partial_target(), Some(callee));
        assert!(program.to_text().contains("partial @callee"));
        Ok(())
    }

    #[test]
    fn build_rejects_partial_arity_mismatch() {
        let mut builder = ProgramBuilder::new();
        let x = builder.tensor("x", &[2]);
        let handle = builder.tensor("h", &[]);
        let out = builder.tensor("out", &[2]);
        let main = builder.declare("main");
        let callee = builder.declare("callee");
        builder.subgraph(callee).returns(&[]).finish();
        builder
            .subgraph(main)
            .inputs(&[x])
            .partial("p", callee, &[x], handle)
            .call("c", handle, &[out])
            .returns(&[out])
            .finish();

        let err = builder.build(main).unwrap_err();
        assert!(err.to_string().contains("binds 1 arguments"));
    }

    #[test]
    fn build_rejects_misshaped_constant() {
        let mut builder = ProgramBuilder::new();
        let c = builder.constant("c", &[3], vec![1.0, 2.0]);
        let main = builder.declare("main");
        builder.subgraph(main).returns(&[c]).finish();
        assert!(builder.build(main).is_err());
    }
}
