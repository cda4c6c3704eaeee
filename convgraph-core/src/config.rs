use crate::{Error, NodeId, Result};

/// Default number of frames that may be in flight at once.
pub const DEFAULT_INFLIGHT_SLOTS: usize = 3;

/// Options for [`Graph::compile_with`](crate::Graph::compile_with).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompileConfig {
    /// Number of independent durable buffer sets, one per in-flight frame.
    pub inflight_slots: usize,
    /// The node `encode` produces. Defaults to the last node in topological order.
    pub output: Option<NodeId>,
    /// Extra nodes whose values stay readable after a frame completes.
    pub durable: Vec<NodeId>,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            inflight_slots: DEFAULT_INFLIGHT_SLOTS,
            output: None,
            durable: Vec::new(),
        }
    }
}

impl CompileConfig {
    pub fn with_inflight_slots(mut self, slots: usize) -> Self {
        self.inflight_slots = slots;
        self
    }

    pub fn with_output(mut self, node: NodeId) -> Self {
        self.output = Some(node);
        self
    }

    pub fn keep(mut self, node: NodeId) -> Self {
        self.durable.push(node);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.inflight_slots == 0 {
            return Err(Error::msg("at least one in-flight slot is required"));
        }
        Ok(())
    }
}
