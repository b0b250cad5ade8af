//! Node, tensor and subgraph definitions for the callflow kernel graph.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TensorId(pub usize);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(pub usize);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SubgraphId(pub usize);

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

impl fmt::Display for SubgraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subgraph#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum DataType {
    #[default]
    F32,
    F16,
    BF16,
}

impl DataType {
    pub fn element_type(&self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F16 => "f16",
            DataType::BF16 => "bf16",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constant: Option<Vec<f32>>,
}

impl Tensor {
    pub fn new<N: Into<String>>(name: N, shape: Vec<usize>, dtype: DataType) -> Self {
        Self {
            name: name.into(),
            shape,
            dtype,
            constant: None,
        }
    }

    pub fn with_constant(mut self, values: Vec<f32>) -> Self {
        self.constant = Some(values);
        self
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_constant(&self) -> bool {
        self.constant.is_some()
    }

    pub fn type_string(&self) -> String {
        if self.shape.is_empty() {
            return format!("tensor<{}>", self.dtype.element_type());
        }
        let dims = self
            .shape
            .iter()
            .map(|dim| dim.to_string())
            .collect::<Vec<_>>()
            .join("x");
        format!("tensor<{}x{}>", dims, self.dtype.element_type())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum KernelOp {
    Add,
    Sub,
    Mul,
    Neg,
    /// Pairwise copy of `inputs[i]` into `outputs[i]`.
    Copy,
    /// Elementwise `lhs < rhs`, producing 1.0 or 0.0.
    Less,
}

impl KernelOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            KernelOp::Add => "add",
            KernelOp::Sub => "sub",
            KernelOp::Mul => "mul",
            KernelOp::Neg => "neg",
            KernelOp::Copy => "copy",
            KernelOp::Less => "less",
        }
    }

    /// Number of inputs the op expects, `None` for variadic ops.
    pub fn arity(&self) -> Option<usize> {
        match self {
            KernelOp::Add | KernelOp::Sub | KernelOp::Mul | KernelOp::Less => Some(2),
            KernelOp::Neg => Some(1),
            KernelOp::Copy => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeKind {
    Kernel(KernelOp),
    /// Binds arguments to a callee without running it; the single output is a handle.
    Partial { subgraph: SubgraphId },
    /// Runs the subgraph behind the handle in `inputs[0]`.
    Call,
    /// `[cond, on_true, on_false]` -> selected handle.
    Switch,
    /// `[index, branch_0, .., branch_n]` -> selected handle.
    SwitchLayer,
}

impl NodeKind {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            NodeKind::Kernel(op) => op.as_str(),
            NodeKind::Partial { .. } => "partial",
            NodeKind::Call => "call",
            NodeKind::Switch => "switch",
            NodeKind::SwitchLayer => "switch_layer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
}

impl Node {
    pub fn new<N: Into<String>>(
        name: N,
        kind: NodeKind,
        inputs: Vec<TensorId>,
        outputs: Vec<TensorId>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            inputs,
            outputs,
        }
    }

    pub fn is_call(&self) -> bool {
        matches!(self.kind, NodeKind::Call)
    }

    pub fn partial_target(&self) -> Option<SubgraphId> {
        match self.kind {
            NodeKind::Partial { subgraph } => Some(subgraph),
            _ => None,
        }
    }

    /// Handle operands a switch selects between.
    pub fn branch_inputs(&self) -> &[TensorId] {
        match self.kind {
            NodeKind::Switch | NodeKind::SwitchLayer => self.inputs.get(1..).unwrap_or(&[]),
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SubgraphKind {
    Body,
    /// Continuation split off the subgraph `origin`.
    Segment { origin: SubgraphId },
    /// Per-caller wrapper that binds caller arguments before running `body`.
    Entrance { body: SubgraphId },
    /// Wrapper that routes the results of `body` to a caller destination.
    Exit { body: SubgraphId },
}

impl SubgraphKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubgraphKind::Body => "body",
            SubgraphKind::Segment { .. } => "segment",
            SubgraphKind::Entrance { .. } => "entrance",
            SubgraphKind::Exit { .. } => "exit",
        }
    }

    pub fn is_wrapper(&self) -> bool {
        matches!(self, SubgraphKind::Entrance { .. } | SubgraphKind::Exit { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subgraph {
    pub name: String,
    pub kind: SubgraphKind,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    pub nodes: Vec<NodeId>,
}

impl Subgraph {
    pub fn new<N: Into<String>>(name: N, kind: SubgraphKind) -> Self {
        Self {
            name: name.into(),
            kind,
            inputs: Vec::new(),
            outputs: Vec::new(),
            nodes: Vec::new(),
        }
    }

    pub fn last_node(&self) -> Option<NodeId> {
        self.nodes.last().copied()
    }
}

/// Hand-off from a non-tail call to the subgraph that resumes after it returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub call: NodeId,
    pub continuation: SubgraphId,
    /// First node of the continuation that reads the link tensors.
    pub consumer: NodeId,
    pub tensors: Vec<TensorId>,
}
