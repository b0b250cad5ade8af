//! Arena holding the flattened kernel graph.

use crate::dialect::{Link, Node, NodeId, NodeKind, Subgraph, SubgraphId, Tensor, TensorId};
use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::path::Path;

/// Tensors, nodes and subgraphs addressed by stable indices.
///
/// Entries are only ever appended, so an id handed out once stays valid for the
/// lifetime of the program even while passes rewrite node lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub tensors: Vec<Tensor>,
    pub nodes: Vec<Node>,
    pub subgraphs: Vec<Subgraph>,
    /// Flattened kernel-list order handed to the executor.
    pub order: Vec<SubgraphId>,
    pub entry: SubgraphId,
    /// Program results, fixed when the program is built.
    pub outputs: Vec<TensorId>,
    /// Continuation links of scheduled calls, keyed by call. A split leaves the
    /// head's call looking like a tail call, so the link is what keeps it apart.
    #[serde(default)]
    pub links: BTreeMap<NodeId, Link>,
}

impl Program {
    pub fn tensor(&self, id: TensorId) -> &Tensor {
        &self.tensors[id.0]
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn subgraph(&self, id: SubgraphId) -> &Subgraph {
        &self.subgraphs[id.0]
    }

    pub fn subgraph_mut(&mut self, id: SubgraphId) -> &mut Subgraph {
        &mut self.subgraphs[id.0]
    }

    pub fn subgraph_ids(&self) -> impl Iterator<Item = SubgraphId> {
        (0..self.subgraphs.len()).map(SubgraphId)
    }

    pub fn entry_inputs(&self) -> &[TensorId] {
        &self.subgraph(self.entry).inputs
    }

    pub fn add_tensor(&mut self, tensor: Tensor) -> TensorId {
        self.tensors.push(tensor);
        TensorId(self.tensors.len() - 1)
    }

    /// Allocates a fresh tensor with the shape and dtype of `like`.
    pub fn new_tensor_like<N: Into<String>>(&mut self, like: TensorId, name: N) -> TensorId {
        let template = self.tensor(like);
        let tensor = Tensor::new(name, template.shape.clone(), template.dtype);
        self.add_tensor(tensor)
    }

    pub fn add_node(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    /// Appends a subgraph to the arena. Placement in `order` is up to the caller.
    pub fn add_subgraph(&mut self, subgraph: Subgraph) -> SubgraphId {
        self.subgraphs.push(subgraph);
        SubgraphId(self.subgraphs.len() - 1)
    }

    pub fn insert_in_order_after(&mut self, anchor: SubgraphId, id: SubgraphId) {
        match self.order.iter().position(|&entry| entry == anchor) {
            Some(index) => self.order.insert(index + 1, id),
            None => self.order.push(id),
        }
    }

    pub fn insert_in_order_before(&mut self, anchor: SubgraphId, id: SubgraphId) {
        match self.order.iter().position(|&entry| entry == anchor) {
            Some(index) => self.order.insert(index, id),
            None => self.order.push(id),
        }
    }

    /// Owning subgraph for every node that appears in some node list.
    pub fn node_owners(&self) -> HashMap<NodeId, SubgraphId> {
        let mut owners = HashMap::with_capacity(self.nodes.len());
        for id in self.subgraph_ids() {
            for &node in &self.subgraph(id).nodes {
                owners.insert(node, id);
            }
        }
        owners
    }

    /// First producer of each tensor across all subgraphs, in `order`.
    pub fn producers(&self) -> HashMap<TensorId, NodeId> {
        let mut producers = HashMap::new();
        for &id in &self.order {
            for &node in &self.subgraph(id).nodes {
                for &output in &self.node(node).outputs {
                    producers.entry(output).or_insert(node);
                }
            }
        }
        producers
    }

    /// Nodes reading each tensor across all subgraphs, in `order`.
    pub fn consumers(&self) -> HashMap<TensorId, Vec<NodeId>> {
        let mut consumers: HashMap<TensorId, Vec<NodeId>> = HashMap::new();
        for &id in &self.order {
            for &node in &self.subgraph(id).nodes {
                for &input in &self.node(node).inputs {
                    let readers = consumers.entry(input).or_default();
                    if !readers.contains(&node) {
                        readers.push(node);
                    }
                }
            }
        }
        consumers
    }

    pub fn link_for(&self, call: NodeId) -> Option<&Link> {
        self.links.get(&call)
    }

    pub fn call_count(&self) -> usize {
        self.nodes.iter().filter(|node| node.is_call()).count()
    }

    pub fn validate(&self) -> Result<()> {
        let tensor_count = self.tensors.len();
        let subgraph_count = self.subgraphs.len();
        let check_tensor = |id: TensorId, context: &str| -> Result<()> {
            ensure!(
                id.0 < tensor_count,
                "{} references unknown tensor {}",
                context,
                id
            );
            Ok(())
        };

        ensure!(
            self.entry.0 < subgraph_count,
            "entry {} is not a subgraph",
            self.entry
        );
        for &output in &self.outputs {
            check_tensor(output, "program outputs")?;
        }

        for (index, tensor) in self.tensors.iter().enumerate() {
            if let Some(values) = &tensor.constant {
                ensure!(
                    values.len() == tensor.element_count(),
                    "constant {} ({}) holds {} values for shape {:?}",
                    TensorId(index),
                    tensor.name,
                    values.len(),
                    tensor.shape
                );
            }
        }

        let mut sorted_order = self.order.clone();
        sorted_order.sort();
        ensure!(
            sorted_order.len() == subgraph_count
                && sorted_order.iter().enumerate().all(|(index, id)| id.0 == index),
            "subgraph order must list each of the {} subgraphs exactly once",
            subgraph_count
        );

        let mut owner: Vec<Option<SubgraphId>> = vec![None; self.nodes.len()];
        for id in self.subgraph_ids() {
            let subgraph = self.subgraph(id);
            let context = format!("subgraph {} ({})", id, subgraph.name);
            for &tensor in subgraph.inputs.iter().chain(subgraph.outputs.iter()) {
                check_tensor(tensor, &context)?;
            }
            for &node in &subgraph.nodes {
                let slot = owner
                    .get_mut(node.0)
                    .with_context(|| format!("{} lists unknown node {}", context, node))?;
                if let Some(previous) = slot.replace(id) {
                    bail!("{} is owned by both {} and {}", node, previous, id);
                }
                self.validate_node(node, &context)?;
            }
        }

        for (call, link) in &self.links {
            ensure!(
                *call == link.call && call.0 < self.nodes.len() && self.node(*call).is_call(),
                "link keyed by {} does not name that call",
                call
            );
            ensure!(
                link.continuation.0 < subgraph_count,
                "link for {} resumes unknown {}",
                call,
                link.continuation
            );
            ensure!(
                self.subgraph(link.continuation).nodes.first() == Some(&link.consumer),
                "link for {} names {} which does not start {}",
                call,
                link.consumer,
                link.continuation
            );
            for &tensor in &link.tensors {
                check_tensor(tensor, "link")?;
            }
        }
        Ok(())
    }

    fn validate_node(&self, id: NodeId, context: &str) -> Result<()> {
        let node = self.node(id);
        let context = format!("{}: {} ({})", context, id, node.name);
        for &tensor in node.inputs.iter().chain(node.outputs.iter()) {
            ensure!(
                tensor.0 < self.tensors.len(),
                "{} references unknown tensor {}",
                context,
                tensor
            );
        }

        match node.kind {
            NodeKind::Kernel(op) => {
                if let Some(arity) = op.arity() {
                    ensure!(
                        node.inputs.len() == arity && node.outputs.len() == 1,
                        "{} expects {} inputs and one output",
                        context,
                        arity
                    );
                } else {
                    ensure!(
                        node.inputs.len() == node.outputs.len(),
                        "{} copies {} inputs into {} outputs",
                        context,
                        node.inputs.len(),
                        node.outputs.len()
                    );
                }
            }
            NodeKind::Partial { subgraph } => {
                ensure!(
                    subgraph.0 < self.subgraphs.len(),
                    "{} binds unknown {}",
                    context,
                    subgraph
                );
                let formals = self.subgraph(subgraph).inputs.len();
                ensure!(
                    node.inputs.len() == formals,
                    "{} binds {} arguments but {} takes {}",
                    context,
                    node.inputs.len(),
                    subgraph,
                    formals
                );
                ensure!(node.outputs.len() == 1, "{} must produce one handle", context);
            }
            NodeKind::Call => {
                ensure!(!node.inputs.is_empty(), "{} has no handle input", context);
            }
            NodeKind::Switch => {
                ensure!(
                    node.inputs.len() == 3 && node.outputs.len() == 1,
                    "{} expects [cond, on_true, on_false] and one output",
                    context
                );
            }
            NodeKind::SwitchLayer => {
                ensure!(
                    node.inputs.len() >= 2 && node.outputs.len() == 1,
                    "{} expects an index, at least one branch and one output",
                    context
                );
            }
        }
        Ok(())
    }

    pub fn to_text(&self) -> String {
        let mut text = String::from("program {\n");
        let _ = writeln!(text, "  entry {}", self.entry);
        for &id in &self.order {
            let subgraph = self.subgraph(id);
            let _ = writeln!(
                text,
                "  {} @{} [{}]({}) -> ({}) {{",
                id,
                subgraph.name,
                subgraph.kind.as_str(),
                self.tensor_list(&subgraph.inputs),
                self.tensor_list(&subgraph.outputs)
            );
            for &node_id in &subgraph.nodes {
                let node = self.node(node_id);
                let target = match node.kind {
                    NodeKind::Partial { subgraph } => format!(" @{}", self.subgraph(subgraph).name),
                    _ => String::new(),
                };
                let _ = writeln!(
                    text,
                    "    {} = {}{}({})  // {} {}",
                    self.tensor_list(&node.outputs),
                    node.kind.mnemonic(),
                    target,
                    self.tensor_list(&node.inputs),
                    node_id,
                    node.name
                );
            }
            text.push_str("  }\n");
        }
        text.push_str("}\n");
        text
    }

    /// Reads a program from JSON and validates it before handing it out.
    pub fn from_json(json: &str) -> Result<Self> {
        let program: Program = serde_json::from_str(json).context("malformed program JSON")?;
        program.validate()?;
        Ok(program)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading program from {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("loading program {}", path.display()))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    fn tensor_list(&self, tensors: &[TensorId]) -> String {
        tensors
            .iter()
            .map(|&id| format!("{}:{}", id, self.tensor(id).type_string()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ProgramBuilder;
    use crate::dialect::KernelOp;

    fn negate() -> Program {
        let mut builder = ProgramBuilder::new();
        let x = builder.tensor("x", &[2]);
        let y = builder.tensor("y", &[2]);
        let main = builder.declare("main");
        builder
            .subgraph(main)
            .inputs(&[x])
            .kernel("neg", KernelOp::Neg, &[x], &[y])
            .returns(&[y])
            .finish();
        builder.build(main).unwrap()
    }

    #[test]
    fn json_round_trip_preserves_program() {
        let program = negate();
        let restored = Program::from_json(&program.to_json().unwrap()).unwrap();
        assert_eq!(restored, program);
    }

    #[test]
    fn rejects_order_with_unknown_subgraph() {
        let mut program = negate();
        program.order = vec![SubgraphId(4)];
        assert!(program.validate().is_err());
    }

    #[test]
    fn new_tensor_like_copies_type() {
        let mut program = negate();
        let x = program.subgraph(program.entry).inputs[0];
        let fresh = program.new_tensor_like(x, "x_copy");
        assert_ne!(fresh, x);
        assert_eq!(program.tensor(fresh).shape, vec![2]);
        assert_eq!(program.tensor(fresh).name, "x_copy");
    }

    #[test]
    fn text_dump_names_every_subgraph() {
        let text = negate().to_text();
        assert!(text.contains("@main [body]"));
        assert!(text.contains("neg(%0"));
    }
}
