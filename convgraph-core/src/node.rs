use std::fmt;

use crate::Shape;

/// Index of a node in its graph's arena.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Index of an operation in its graph's arena. One operation may be applied to
/// several nodes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct OpId(pub(crate) usize);

impl OpId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum NodeKind {
    /// The graph's single entry point, fed by the caller's source buffer.
    Input,
    Op {
        op: OpId,
        input: NodeId,
    },
    /// Marker joining its inputs along the channel axis.
    Concatenate { inputs: Vec<NodeId> },
    /// Marker stacking its inputs as consecutive image slots.
    Collect { inputs: Vec<NodeId> },
}

/// Where an aliased node writes inside its target.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Region {
    Channels(usize),
    Images(usize),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Alias {
    pub target: NodeId,
    pub region: Region,
}

/// A vertex of the graph, holding one tensor value.
#[derive(Clone, Debug)]
pub struct Node {
    pub(crate) kind: NodeKind,
    pub(crate) shape: Shape,
    pub(crate) next: Vec<NodeId>,
    pub(crate) alias: Option<Alias>,
    pub(crate) durable: bool,
}

impl Node {
    pub(crate) fn new(kind: NodeKind, shape: Shape) -> Self {
        Self {
            kind,
            shape,
            next: Vec::new(),
            alias: None,
            durable: false,
        }
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Downstream consumers, in the order they were attached.
    pub fn next(&self) -> &[NodeId] {
        &self.next
    }

    pub fn previous(&self) -> &[NodeId] {
        match &self.kind {
            NodeKind::Input => &[],
            NodeKind::Op { input, .. } => std::slice::from_ref(input),
            NodeKind::Concatenate { inputs } | NodeKind::Collect { inputs } => inputs,
        }
    }

    pub fn op(&self) -> Option<OpId> {
        match self.kind {
            NodeKind::Op { op, .. } => Some(op),
            _ => None,
        }
    }

    pub fn alias(&self) -> Option<Alias> {
        self.alias
    }

    pub fn is_marker(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::Concatenate { .. } | NodeKind::Collect { .. }
        )
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }
}
