use std::{
    collections::{HashMap, HashSet},
    time::Instant,
};

use petgraph::{graphmap::DiGraphMap, visit::DfsPostOrder};

use crate::{
    device::{BufferDesc, Parameters, View},
    error::Context,
    graph::State,
    node::NodeKind,
    CompileConfig, Device, Dims, Error, Graph, NodeId, OpId, ParameterKind, ParameterSource,
    Result, Shape,
};

/// Where a node's value lives: a window into the buffer of `owner`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Placement {
    pub owner: NodeId,
    pub view: View,
}

/// Everything `encode` needs, fixed at compile time.
pub(crate) struct Plan<D: Device> {
    pub input: NodeId,
    pub output: NodeId,
    pub order: Vec<NodeId>,
    /// Indexed by node; `None` for the input, whose storage is the caller's source.
    pub placements: Vec<Option<Placement>>,
    /// Kernel executions that touch each owner's buffer in one full frame.
    pub pending: Vec<usize>,
    /// Owners whose writers leave part of the buffer untouched. Zeroed when acquired.
    pub uncovered: HashSet<NodeId>,
    /// Indexed by operation.
    pub kernels: Vec<Option<D::Kernel>>,
    pub descriptors: HashMap<Shape, BufferDesc>,
    /// Durable owners, one buffer per in-flight slot.
    pub durable: HashMap<NodeId, Vec<D::Buffer>>,
    pub slots: usize,
    pub total_params: usize,
}

impl<D: Device> Plan<D> {
    pub fn placement(&self, node: NodeId) -> Result<Placement> {
        self.placements
            .get(node.0)
            .copied()
            .flatten()
            .ok_or_else(|| Error::invariant(format!("node {node} has no placement")))
    }

    pub fn descriptor(&self, node: NodeId, shape: Shape) -> Result<BufferDesc> {
        self.descriptors
            .get(&shape)
            .copied()
            .ok_or_else(|| Error::invariant(format!("no descriptor registered for {node} ({shape})")))
    }
}

impl<D: Device> Graph<D> {
    /// Compile with the default [`CompileConfig`].
    pub fn compile<P: ParameterSource + ?Sized>(&mut self, params: &mut P) -> Result<()> {
        self.compile_with(params, &CompileConfig::default())
    }

    /// Freeze the graph: infer and check shapes, load parameters, build kernels and
    /// plan buffers. A graph compiles at most once; after a failure it stays
    /// inspectable through [`Graph::summary`] but cannot be executed.
    pub fn compile_with<P: ParameterSource + ?Sized>(
        &mut self,
        params: &mut P,
        config: &CompileConfig,
    ) -> Result<()> {
        match &self.state {
            State::Building => {}
            State::Compiled(_) => return Err(Error::AlreadyCompiled),
            State::Failed(msg) => return Err(Error::CompileFailed(msg.clone())),
        }
        let start = Instant::now();
        match self.plan(params, config) {
            Ok(plan) => {
                log::info!(
                    "compiled {} nodes ({} operations, {} parameters) in {:?}",
                    plan.order.len(),
                    self.ops.len(),
                    plan.total_params,
                    start.elapsed()
                );
                self.state = State::Compiled(Box::new(plan));
                Ok(())
            }
            Err(e) => {
                log::warn!("compile failed: {e}");
                self.state = State::Failed(e.to_string());
                Err(e)
            }
        }
    }

    fn operation_name(&self, op: OpId) -> String {
        let op = &self.ops[op.0];
        op.name().unwrap_or(op.type_name()).to_string()
    }

    /// Depth-first postorder from the input, reversed.
    fn topological_order(&self, input: NodeId) -> Result<Vec<NodeId>> {
        let mut g = DiGraphMap::<usize, ()>::new();
        for (i, node) in self.nodes.iter().enumerate() {
            g.add_node(i);
            for next in &node.next {
                g.add_edge(i, next.0, ());
            }
        }
        let mut dfs = DfsPostOrder::new(&g, input.0);
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(i) = dfs.next(&g) {
            order.push(NodeId(i));
        }
        order.reverse();
        if order.len() != self.nodes.len() {
            crate::bail!(
                "{} nodes are not reachable from the input",
                self.nodes.len() - order.len()
            );
        }
        Ok(order)
    }

    fn validate_shapes(&self, order: &[NodeId]) -> Result<()> {
        for &id in order {
            let node = &self.nodes[id.0];
            let NodeKind::Op { op, input } = node.kind else {
                continue;
            };
            let operation = &self.ops[op.0];
            let name = self.operation_name(op);
            operation.check().map_err(|message| Error::Compile {
                operation: name.clone(),
                message,
            })?;
            let input_shape = self.nodes[input.0].shape;
            if !input_shape.is_fully_specified() && !operation.allows_incomplete_input() {
                return Err(Error::UnresolvedShape {
                    operation: name,
                    shape: input_shape,
                });
            }
            if !node.shape.is_fully_specified() {
                return Err(Error::Compile {
                    operation: name,
                    message: format!(
                        "output shape {} cannot be resolved from input {}",
                        node.shape, input_shape
                    ),
                });
            }
        }
        Ok(())
    }

    fn auto_name(&mut self) {
        for (i, op) in self.ops.iter_mut().enumerate() {
            if op.name().is_none() {
                let name = format!("__{}_{}__", op.type_name(), i + 1);
                op.set_name(name);
            }
        }
    }

    fn load<P: ParameterSource + ?Sized>(
        &self,
        params: &mut P,
        op: OpId,
        kind: ParameterKind,
        count: usize,
    ) -> Result<Option<Vec<f32>>> {
        if count == 0 {
            return Ok(None);
        }
        let operation = self.operation_name(op);
        let values = params
            .load_parameters(&operation, count, kind)
            .ok_or_else(|| Error::MissingParameters {
                operation: operation.clone(),
                kind,
                expected: count,
            })?;
        if values.len() != count {
            return Err(Error::ParameterCount {
                operation,
                kind,
                expected: count,
                actual: values.len(),
            });
        }
        Ok(Some(values))
    }

    /// Load parameters and build every operation's kernel once.
    fn build_kernels<P: ParameterSource + ?Sized>(
        &self,
        params: &mut P,
        order: &[NodeId],
    ) -> Result<(Vec<Option<D::Kernel>>, usize)> {
        let mut kernels: Vec<Option<D::Kernel>> = (0..self.ops.len()).map(|_| None).collect();
        let mut built: HashMap<OpId, (Shape, Shape)> = HashMap::new();
        let mut total = 0;
        for &id in order {
            let node = &self.nodes[id.0];
            let NodeKind::Op { op, input } = node.kind else {
                continue;
            };
            let shapes = (self.nodes[input.0].shape, node.shape);
            if let Some(first) = built.get(&op) {
                if *first != shapes {
                    return Err(Error::Compile {
                        operation: self.operation_name(op),
                        message: format!(
                            "reused with {} -> {}, first applied to {} -> {}",
                            shapes.0, shapes.1, first.0, first.1
                        ),
                    });
                }
                continue;
            }
            let operation = &self.ops[op.0];
            let weights = self.load(
                params,
                op,
                ParameterKind::Weights,
                operation.weight_count(shapes.0, shapes.1),
            )?;
            let biases = self.load(
                params,
                op,
                ParameterKind::Biases,
                operation.bias_count(shapes.1),
            )?;
            total += weights.as_ref().map_or(0, Vec::len) + biases.as_ref().map_or(0, Vec::len);

            let output = output_dims(node.shape)?;
            let kernel = self
                .device
                .build(operation, shapes.0, output, Parameters { weights, biases })
                .map_err(|e| Error::Compile {
                    operation: self.operation_name(op),
                    message: e.to_string(),
                })?;
            log::debug!(
                "built kernel for {} ({} -> {})",
                self.operation_name(op),
                shapes.0,
                shapes.1
            );
            kernels[op.0] = Some(kernel);
            built.insert(op, shapes);
        }
        Ok((kernels, total))
    }

    /// Follow aliasing targets to the node that owns the storage, composing offsets.
    fn placement_of(&self, id: NodeId) -> Result<Placement> {
        let node = &self.nodes[id.0];
        let dims = output_dims(node.shape)?;
        match node.alias {
            None => Ok(Placement {
                owner: id,
                view: View::full(dims),
            }),
            Some(alias) => {
                let target = self.placement_of(alias.target)?;
                Ok(Placement {
                    owner: target.owner,
                    view: target.view.region(alias.region, dims),
                })
            }
        }
    }

    fn plan<P: ParameterSource + ?Sized>(
        &mut self,
        params: &mut P,
        config: &CompileConfig,
    ) -> Result<Plan<D>> {
        config.validate()?;
        let input = self
            .input
            .context("the graph has no input node")?;
        for &node in config.durable.iter().chain(config.output.iter()) {
            if node.0 >= self.nodes.len() {
                return Err(Error::UnknownNode(node));
            }
        }

        let order = self.topological_order(input)?;
        self.auto_name();
        self.validate_shapes(&order)?;

        let mut descriptors = HashMap::new();
        for &id in &order {
            let shape = self.nodes[id.0].shape;
            if let Some(dims) = shape.dims().filter(|_| id != input) {
                descriptors.entry(shape).or_insert_with(|| {
                    log::debug!("registered buffer descriptor for {shape}");
                    BufferDesc { dims }
                });
            }
        }

        let (kernels, total_params) = self.build_kernels(params, &order)?;

        let mut placements = vec![None; self.nodes.len()];
        for &id in &order {
            if id != input {
                placements[id.0] = Some(self.placement_of(id)?);
            }
        }
        let owner = |id: NodeId| placements[id.0].map(|p: Placement| p.owner);

        // Every kernel touches the buffer it writes and the buffer it reads once.
        let mut pending = vec![0usize; self.nodes.len()];
        for &id in &order {
            if let NodeKind::Op { input: source, .. } = self.nodes[id.0].kind {
                if let Some(o) = owner(id) {
                    pending[o.0] += 1;
                }
                if let Some(o) = owner(source) {
                    pending[o.0] += 1;
                }
            }
        }

        let mut uncovered = HashSet::new();
        for &id in &order {
            if !matches!(self.nodes[id.0].kind, NodeKind::Op { .. }) {
                continue;
            }
            if let Some(p) = placements[id.0] {
                let (dims, extent) = (p.view.dims, p.view.extent);
                if dims.width < extent.width || dims.height < extent.height {
                    uncovered.insert(p.owner);
                }
            }
        }

        let output = match config.output {
            Some(node) => node,
            None => *order
                .last()
                .context("the graph is empty")?,
        };
        if output == input {
            crate::bail!("the graph input cannot be its output");
        }
        let mut durable_owners = HashSet::new();
        let kept = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.durable)
            .map(|(i, _)| NodeId(i));
        for node in kept.chain(config.durable.iter().copied()).chain([output]) {
            match owner(node) {
                Some(o) => {
                    durable_owners.insert(o);
                }
                None => log::debug!("{node} is the graph input, nothing to keep"),
            }
        }
        let mut durable = HashMap::new();
        for o in durable_owners {
            let shape = self.nodes[o.0].shape;
            let desc = *descriptors
                .get(&shape)
                .ok_or_else(|| Error::invariant(format!("no descriptor for {o}")))?;
            let buffers = (0..config.inflight_slots)
                .map(|_| self.device.allocate_durable(&desc))
                .collect::<Result<Vec<_>>>()?;
            log::debug!(
                "allocated {} durable buffers of {} for {}",
                buffers.len(),
                desc.dims,
                self.label(o)
            );
            durable.insert(o, buffers);
        }

        Ok(Plan {
            input,
            output,
            order,
            placements,
            pending,
            uncovered,
            kernels,
            descriptors,
            durable,
            slots: config.inflight_slots,
            total_params,
        })
    }

    /// Number of in-flight slots, once compiled.
    pub fn inflight_slots(&self) -> Option<usize> {
        match &self.state {
            State::Compiled(plan) => Some(plan.slots),
            _ => None,
        }
    }

    /// The node `encode` produces, once compiled.
    pub fn output(&self) -> Option<NodeId> {
        match &self.state {
            State::Compiled(plan) => Some(plan.output),
            _ => None,
        }
    }

    /// Where `node` is stored: the owning node and the window inside its buffer.
    /// `None` before compiling and for the input.
    pub fn placement(&self, node: NodeId) -> Option<(NodeId, View)> {
        match &self.state {
            State::Compiled(plan) => plan
                .placements
                .get(node.0)
                .copied()
                .flatten()
                .map(|p| (p.owner, p.view)),
            _ => None,
        }
    }

    /// Kernel executions that will touch `owner`'s buffer during one full frame.
    pub fn pending_count(&self, owner: NodeId) -> Option<usize> {
        match &self.state {
            State::Compiled(plan) => plan.pending.get(owner.0).copied(),
            _ => None,
        }
    }

    /// Number of distinct buffer descriptors registered for the ephemeral pool.
    pub fn descriptor_count(&self) -> usize {
        match &self.state {
            State::Compiled(plan) => plan.descriptors.len(),
            _ => 0,
        }
    }

    /// Total number of loaded parameters, once compiled.
    pub fn total_params(&self) -> Option<usize> {
        match &self.state {
            State::Compiled(plan) => Some(plan.total_params),
            _ => None,
        }
    }
}

fn output_dims(shape: Shape) -> Result<Dims> {
    shape
        .dims()
        .with_context(|| format!("shape {shape} is not fully specified"))
}
