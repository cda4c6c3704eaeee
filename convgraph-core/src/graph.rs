use std::{collections::HashSet, env, fmt::Write as _, fs, path::Path, process::Command};

use petgraph::{
    dot::{Config, Dot},
    graph::NodeIndex,
    Graph as PetGraph,
};

use crate::{
    compile::Plan,
    error::Context,
    node::{Alias, Node, NodeKind, Region},
    CpuDevice, Device, Error, NodeId, OpId, Operation, Result, Shape,
};

pub(crate) enum State<D: Device> {
    Building,
    Compiled(Box<Plan<D>>),
    Failed(String),
}

/// A declarative network: nodes connected by operations, compiled once and then
/// encoded frame after frame.
///
/// Nodes can only refer to nodes that already exist, so the graph is acyclic by
/// construction. There is exactly one input node.
pub struct Graph<D: Device = CpuDevice> {
    pub(crate) device: D,
    pub(crate) nodes: Vec<Node>,
    pub(crate) ops: Vec<Operation>,
    pub(crate) input: Option<NodeId>,
    pub(crate) state: State<D>,
}

impl<D: Device + Default> Default for Graph<D> {
    fn default() -> Self {
        Self::new(D::default())
    }
}

impl<D: Device> Graph<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            nodes: Vec::new(),
            ops: Vec::new(),
            input: None,
            state: State::Building,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    fn check_building(&self) -> Result<()> {
        match &self.state {
            State::Building => Ok(()),
            State::Compiled(_) => Err(Error::AlreadyCompiled),
            State::Failed(msg) => Err(Error::CompileFailed(msg.clone())),
        }
    }

    fn check_node(&self, node: NodeId) -> Result<&Node> {
        self.nodes.get(node.0).ok_or(Error::UnknownNode(node))
    }

    fn push_node(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    /// Declare the graph input. Unknown dimensions are taken from the source buffer.
    pub fn input(&mut self, shape: Shape) -> Result<NodeId> {
        self.check_building()?;
        if let Some(existing) = self.input {
            return Err(Error::construction(
                existing,
                "the graph already has an input node",
            ));
        }
        let id = self.push_node(Node::new(NodeKind::Input, shape));
        self.input = Some(id);
        Ok(id)
    }

    /// Register an operation so it can be applied to several nodes.
    pub fn add_operation(&mut self, op: impl Into<Operation>) -> OpId {
        self.ops.push(op.into());
        OpId(self.ops.len() - 1)
    }

    /// Apply a registered operation to `node`, returning the new node.
    pub fn apply(&mut self, node: NodeId, op: OpId) -> Result<NodeId> {
        self.check_building()?;
        let shape = self.check_node(node)?.shape;
        let operation = self
            .ops
            .get(op.0)
            .ok_or_else(|| Error::construction(node, format!("unknown operation {}", op.0)))?;
        let shape = operation.output_shape(shape);
        let id = self.push_node(Node::new(NodeKind::Op { op, input: node }, shape));
        self.nodes[node.0].next.push(id);
        Ok(id)
    }

    /// Connect `node` to a new operation.
    pub fn append(&mut self, node: NodeId, op: impl Into<Operation>) -> Result<NodeId> {
        self.check_building()?;
        self.check_node(node)?;
        let op = self.add_operation(op);
        self.apply(node, op)
    }

    /// Append several operations one after the other.
    pub fn chain<I>(&mut self, node: NodeId, ops: I) -> Result<NodeId>
    where
        I: IntoIterator,
        I::Item: Into<Operation>,
    {
        ops.into_iter()
            .try_fold(node, |node, op| self.append(node, op))
    }

    fn check_contributors(&self, what: &str, inputs: &[NodeId]) -> Result<()> {
        self.check_building()?;
        if inputs.is_empty() {
            return Err(Error::construction(what, "needs at least one input"));
        }
        let mut seen = HashSet::new();
        for &id in inputs {
            let node = self.check_node(id)?;
            if !seen.insert(id) {
                return Err(Error::construction(what, format!("{id} is listed twice")));
            }
            if matches!(node.kind, NodeKind::Input) {
                return Err(Error::construction(
                    what,
                    format!("{id} is the graph input, which the caller owns"),
                ));
            }
            if let Some(alias) = node.alias {
                return Err(Error::construction(
                    what,
                    format!("{id} already writes into {}", alias.target),
                ));
            }
            if !node.shape.is_fully_specified() {
                return Err(Error::construction(
                    what,
                    format!("{id} has unresolved shape {}", node.shape),
                ));
            }
        }
        Ok(())
    }

    fn merge(&mut self, kind: NodeKind, shape: Shape, regions: Vec<(NodeId, Region)>) -> NodeId {
        let id = self.push_node(Node::new(kind, shape));
        for (input, region) in regions {
            let node = &mut self.nodes[input.0];
            node.alias = Some(Alias { target: id, region });
            node.next.push(id);
        }
        id
    }

    /// Join `inputs` along the channel axis. Each input writes straight into its
    /// channel range of the result.
    pub fn concatenate(&mut self, inputs: &[NodeId]) -> Result<NodeId> {
        self.check_contributors("Concatenate", inputs)?;
        let dims: Vec<_> = inputs
            .iter()
            .filter_map(|id| self.nodes[id.0].shape.dims())
            .collect();
        let num_images = dims[0].num_images;
        if let Some((id, d)) = inputs
            .iter()
            .zip(&dims)
            .find(|(_, d)| d.num_images != num_images)
        {
            return Err(Error::construction(
                "Concatenate",
                format!(
                    "{id} has {} images, expected {num_images}",
                    d.num_images
                ),
            ));
        }
        let shape = Shape::new(
            dims.iter().map(|d| d.width).max().unwrap_or(0),
            dims.iter().map(|d| d.height).max().unwrap_or(0),
            dims.iter().map(|d| d.channels).sum(),
        )
        .with_images(num_images);
        let mut offset = 0;
        let regions = inputs
            .iter()
            .zip(&dims)
            .map(|(&id, d)| {
                let region = (id, Region::Channels(offset));
                offset += d.channels;
                region
            })
            .collect();
        Ok(self.merge(
            NodeKind::Concatenate {
                inputs: inputs.to_vec(),
            },
            shape,
            regions,
        ))
    }

    /// Stack `inputs` as consecutive image slots. Width, height and channels must
    /// match exactly.
    pub fn collect(&mut self, inputs: &[NodeId]) -> Result<NodeId> {
        self.check_contributors("Collect", inputs)?;
        let dims: Vec<_> = inputs
            .iter()
            .filter_map(|id| self.nodes[id.0].shape.dims())
            .collect();
        let first = dims[0];
        if let Some((id, d)) = inputs.iter().zip(&dims).find(|(_, d)| {
            (d.width, d.height, d.channels) != (first.width, first.height, first.channels)
        }) {
            return Err(Error::construction(
                "Collect",
                format!(
                    "{id} has shape {d}, expected {}x{}x{}",
                    first.width, first.height, first.channels
                ),
            ));
        }
        let shape = Shape::from(first.with_images(dims.iter().map(|d| d.num_images).sum()));
        let mut offset = 0;
        let regions = inputs
            .iter()
            .zip(&dims)
            .map(|(&id, d)| {
                let region = (id, Region::Images(offset));
                offset += d.num_images;
                region
            })
            .collect();
        Ok(self.merge(
            NodeKind::Collect {
                inputs: inputs.to_vec(),
            },
            shape,
            regions,
        ))
    }

    /// Keep `node`'s value readable after each frame, one copy per in-flight slot.
    pub fn keep(&mut self, node: NodeId) -> Result<()> {
        self.check_building()?;
        if matches!(self.check_node(node)?.kind, NodeKind::Input) {
            return Err(Error::construction(
                node,
                "the graph input is owned by the caller",
            ));
        }
        self.nodes[node.0].durable = true;
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    pub fn operation(&self, id: OpId) -> Option<&Operation> {
        self.ops.get(id.0)
    }

    pub fn input_node(&self) -> Option<NodeId> {
        self.input
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_compiled(&self) -> bool {
        matches!(self.state, State::Compiled(_))
    }

    /// The message of a failed compile, if any.
    pub fn compile_error(&self) -> Option<&str> {
        match &self.state {
            State::Failed(msg) => Some(msg),
            _ => None,
        }
    }

    /// Display name of a node: its operation's name, or a generated one.
    pub fn label(&self, id: NodeId) -> String {
        match self.nodes.get(id.0).map(|n| &n.kind) {
            Some(NodeKind::Op { op, .. }) => {
                let op = &self.ops[op.0];
                op.name()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("__{}_{}__", op.type_name(), id.0))
            }
            Some(kind) => format!("__{}_{}__", kind_name(kind), id.0),
            None => format!("__unknown_{}__", id.0),
        }
    }

    pub fn type_name(&self, id: NodeId) -> &str {
        match self.nodes.get(id.0).map(|n| &n.kind) {
            Some(NodeKind::Op { op, .. }) => self.ops[op.0].type_name(),
            Some(kind) => kind_name(kind),
            None => "Unknown",
        }
    }

    /// Parameters of the operation at `id`, zero for markers and the input.
    pub fn param_count(&self, id: NodeId) -> usize {
        match self.nodes.get(id.0).map(|n| &n.kind) {
            Some(NodeKind::Op { op, input }) => {
                self.ops[op.0].param_count(self.nodes[input.0].shape, self.nodes[id.0].shape)
            }
            _ => 0,
        }
    }

    /// Nodes in execution order once compiled, construction order before.
    pub fn order(&self) -> Vec<NodeId> {
        match &self.state {
            State::Compiled(plan) => plan.order.clone(),
            _ => (0..self.nodes.len()).map(NodeId).collect(),
        }
    }

    /// Per-node table of names, types, shapes, parameter counts and fan-in/out.
    pub fn summary(&self) -> String {
        let mut s = String::new();
        let rule = "-".repeat(88);
        let _ = writeln!(
            s,
            "{:<30} {:<14} {:<16} {:<13} {}",
            "Layer/Tensor", "Type", "Output Shape", "Parameters", "In/Out"
        );
        let _ = writeln!(s, "{rule}");
        for id in self.order() {
            let node = &self.nodes[id.0];
            let _ = writeln!(
                s,
                "{:<30} {:<14} {:<16} {:<13} {}/{}",
                self.label(id),
                self.type_name(id),
                node.shape.to_string(),
                self.param_count(id),
                node.previous().len(),
                node.next.len()
            );
        }
        let _ = writeln!(s, "{rule}");

        // A reused operation counts once.
        let mut counted = HashSet::new();
        let total: usize = self
            .nodes()
            .filter(|(_, n)| n.op().is_some_and(|op| counted.insert(op)))
            .map(|(id, _)| self.param_count(id))
            .sum();
        let _ = writeln!(
            s,
            "Number of operations: {} (nodes: {})",
            self.ops.len(),
            self.nodes.len()
        );
        let _ = writeln!(s, "Total parameters: {total}");
        if let Some(msg) = self.compile_error() {
            let _ = writeln!(s, "Compile failed: {msg}");
        }
        s
    }

    pub fn to_petgraph(&self) -> PetGraph<String, String> {
        let mut g = PetGraph::<String, String>::new();
        let idx: Vec<NodeIndex> = (0..self.nodes.len())
            .map(|i| {
                let id = NodeId(i);
                g.add_node(format!(
                    "{} : {}\n{}",
                    self.label(id),
                    self.type_name(id),
                    self.nodes[i].shape
                ))
            })
            .collect();
        for (i, node) in self.nodes.iter().enumerate() {
            for next in &node.next {
                g.add_edge(idx[i], idx[next.0], String::new());
            }
        }
        g
    }

    /// Produce a DOT format string of this graph.
    pub fn dot_graph(&self) -> String {
        let g = self.to_petgraph();
        format!("{}", Dot::with_config(&g, &[Config::EdgeNoLabel]))
    }

    /// Visualize the graph by saving it to this file.
    ///
    /// Install graphvis:
    /// - brew install graphviz
    /// - apt install graphviz
    pub fn visualize<P: AsRef<Path>>(&self, filename: P) -> Result<()> {
        let path = filename.as_ref();
        let dot_path = env::temp_dir().join(format!("convgraph-{}.dot", std::process::id()));

        fs::write(&dot_path, self.dot_graph())
            .with_context(|| format!("writing {}", dot_path.display()))?;
        let status = Command::new("dot")
            .args([
                "-Tpng",
                &dot_path.display().to_string(),
                "-o",
                &path.display().to_string(),
            ])
            .status()
            .context("running graphviz `dot`")?;
        if !status.success() {
            crate::bail!("graphviz exited with {}", status);
        }
        Ok(())
    }
}

fn kind_name(kind: &NodeKind) -> &'static str {
    match kind {
        NodeKind::Input => "Input",
        NodeKind::Op { .. } => "Op",
        NodeKind::Concatenate { .. } => "Concatenate",
        NodeKind::Collect { .. } => "Collect",
    }
}
