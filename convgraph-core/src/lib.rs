//! Convgraph compiles declarative convolutional networks into execution plans that can be
//! encoded frame after frame with almost no per-frame bookkeeping.
//!
//! A network is described as a [`Graph`] of nodes. Nodes are produced by applying an
//! [`Operation`] to an existing node, or by joining nodes with [`Graph::concatenate`]
//! (along channels) and [`Graph::collect`] (along the image count). Joined nodes never
//! copy: their contributors write straight into windows of the joined buffer.
//!
//! Compiling the graph with [`Graph::compile`] sorts it, checks every shape, loads the
//! parameters from a [`ParameterSource`] and builds one kernel per operation through a
//! [`Device`]. Afterwards [`Graph::encode`] records one frame into a command sequence,
//! reusing ephemeral buffers as soon as nothing reads them anymore, and the durable
//! output of each in-flight slot stays readable after submission.
//!
//! ## A quick guide
//! - Create a [`Graph`], add its input with [`Graph::input`].
//! - Append operations with [`Graph::append`], or register an operation once with
//!   [`Graph::add_operation`] and [`Graph::apply`] it to several nodes.
//! - Compile with [`Graph::compile`] (or [`Graph::compile_with`] and a [`CompileConfig`]).
//! - Run with [`Graph::evaluate`], or drive frames yourself with [`Graph::encode`].
//!
//! ## What can you do with it?
//! ```
//! use convgraph_core::{Activation, Convolution, Dims, Graph, Pooling, RandomParameters, Shape, Tensor};
//!
//! # fn main() -> convgraph_core::Result<()> {
//! let mut graph: Graph = Graph::default();
//! let x = graph.input(Shape::new(8, 8, 3))?;
//! let a = graph.append(x, Convolution::new(3, 8).activation(Activation::ReLU))?;
//! let b = graph.append(a, Convolution::pointwise(8))?;
//! let joined = graph.concatenate(&[a, b])?;
//! graph.append(joined, Pooling::max(2, 2))?;
//!
//! graph.compile(&mut RandomParameters::new(42))?;
//!
//! let image = Tensor::full(Dims::new(8, 8, 3), 0.5);
//! let out = graph.evaluate(&image, None)?;
//! assert_eq!(out.dims(), Dims::new(4, 4, 16));
//! # Ok(())
//! # }
//! ```

mod compile;
mod config;
mod cpu_storage;
mod device;
mod encode;
mod error;
mod graph;
mod node;
mod ops;
mod params;
mod pool;
mod shape;
mod tensor;

pub use config::{CompileConfig, DEFAULT_INFLIGHT_SLOTS};
pub use cpu_storage::{CpuBuffer, CpuCommands, CpuDevice, CpuKernel, CpuSubmission, PoolMetrics};
pub use device::{BufferDesc, Device, Parameters, Submission, View};
pub use encode::{Output, TensorDumper};
pub use error::{Context, Error, Result};
pub use graph::Graph;
pub use node::{Alias, Node, NodeId, NodeKind, OpId, Region};
pub use ops::{
    Activation, Convolution, Custom, CustomKernel, Dense, DepthwiseConvolution, MergeOp, OpKind,
    Operation, PoolKind, Pooling, Resize, ZeroPad,
};
pub use params::{MemoryParameters, NoParameters, ParameterKind, ParameterSource, RandomParameters};
pub use pool::{BufferId, FramePool, FrameStats};
pub use shape::{Dims, Padding, Shape};
pub use tensor::Tensor;
