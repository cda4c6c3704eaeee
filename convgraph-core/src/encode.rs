use crate::{
    compile::Plan,
    error::Context,
    device::{Submission, View},
    graph::State,
    node::NodeKind,
    pool::{BufferId, FramePool},
    Device, Dims, Error, Graph, NodeId, Result, Shape, Tensor,
};

/// A node's value after `encode`: a window into a buffer that stays valid once the
/// frame's commands complete.
#[derive(Clone, Debug)]
pub struct Output<B> {
    pub node: NodeId,
    pub buffer: B,
    pub view: View,
}

impl<B> Output<B> {
    pub fn dims(&self) -> Dims {
        self.view.dims
    }
}

/// Receives intermediate values from [`Graph::debug_evaluate`].
pub trait TensorDumper {
    fn dump(&mut self, node: NodeId, label: &str, tensor: &Tensor) -> Result<()>;
}

impl<F> TensorDumper for F
where
    F: FnMut(NodeId, &str, &Tensor) -> Result<()>,
{
    fn dump(&mut self, node: NodeId, label: &str, tensor: &Tensor) -> Result<()> {
        self(node, label, tensor)
    }
}

impl<D: Device> Graph<D> {
    pub(crate) fn plan_ref(&self) -> Result<&Plan<D>> {
        match &self.state {
            State::Compiled(plan) => Ok(plan),
            State::Building => Err(Error::NotCompiled),
            State::Failed(msg) => Err(Error::CompileFailed(msg.clone())),
        }
    }

    /// Record one frame into `commands`.
    ///
    /// `source` feeds the input node. Durable buffers come from in-flight `slot`; the
    /// caller must not reuse a slot before the submission that last used it has
    /// completed. With `stop`, recording ends right after that node and its value is
    /// returned in a buffer that outlives the frame.
    pub fn encode(
        &self,
        commands: &mut D::Commands,
        source: &D::Buffer,
        slot: usize,
        stop: Option<NodeId>,
    ) -> Result<Output<D::Buffer>> {
        let plan = self.plan_ref()?;
        if slot >= plan.slots {
            return Err(Error::InvalidSlot {
                slot,
                slots: plan.slots,
            });
        }
        let source_dims = self.device.dims(source);
        // Operations reading an input of unknown image count produce one image.
        let input_shape = self.nodes[plan.input.0].shape;
        let expected = Shape {
            num_images: input_shape.num_images.or(Some(1)),
            ..input_shape
        };
        if source_dims.element_count() == 0 || !expected.accepts(source_dims) {
            return Err(Error::SourceShape {
                expected,
                actual: source_dims.into(),
            });
        }
        if let Some(stop) = stop {
            if stop.0 >= self.nodes.len() {
                return Err(Error::UnknownNode(stop));
            }
            if stop == plan.input {
                return Ok(Output {
                    node: stop,
                    buffer: source.clone(),
                    view: View::full(source_dims),
                });
            }
        }
        let stop_owner = stop.map(|s| plan.placement(s)).transpose()?.map(|p| p.owner);

        let mut frame = FramePool::new();
        // Indexed by owner node.
        let mut storage: Vec<Option<BufferId>> = vec![None; self.nodes.len()];

        for &id in &plan.order {
            let NodeKind::Op { op, input } = self.nodes[id.0].kind else {
                if stop == Some(id) {
                    break;
                }
                continue;
            };
            let out = plan.placement(id)?;
            let out_id = match storage[out.owner.0] {
                Some(b) => b,
                None => {
                    let b = self.resolve(plan, &mut frame, commands, out.owner, slot, stop_owner)?;
                    storage[out.owner.0] = Some(b);
                    b
                }
            };

            let (in_buffer, in_view, in_id) = if input == plan.input {
                (source, View::full(source_dims), None)
            } else {
                let placement = plan.placement(input)?;
                let in_id = storage[placement.owner.0].ok_or_else(|| {
                    Error::invariant(format!(
                        "{} reads {} before its buffer exists",
                        self.label(id),
                        self.label(input)
                    ))
                })?;
                (frame.buffer(in_id)?, placement.view, Some(in_id))
            };
            let kernel = plan.kernels[op.0]
                .as_ref()
                .ok_or_else(|| Error::invariant(format!("no kernel for {}", self.label(id))))?;
            self.device.execute(
                commands,
                kernel,
                (in_buffer, in_view),
                (frame.buffer(out_id)?, out.view),
            )?;

            let released = frame.consume(out_id)?;
            log::trace!(
                "{}: wrote {} of {}, pending {}",
                self.label(id),
                out.view.dims,
                self.label(out.owner),
                if released { 0 } else { frame.pending(out_id)? }
            );
            if let Some(in_id) = in_id {
                if frame.consume(in_id)? {
                    log::trace!("{}: released input buffer", self.label(id));
                }
            }
            if stop == Some(id) {
                break;
            }
        }

        let target = stop.unwrap_or(plan.output);
        let placement = plan.placement(target)?;
        let buffer_id = storage[placement.owner.0].ok_or_else(|| {
            Error::invariant(format!("{} was never written", self.label(target)))
        })?;
        if stop.is_none() && frame.outstanding() != 0 {
            return Err(Error::invariant(format!(
                "{} buffer uses still pending after a full frame",
                frame.outstanding()
            )));
        }
        log::debug!("encoded frame on slot {slot}: {:?}", frame.stats());
        Ok(Output {
            node: target,
            buffer: frame.buffer(buffer_id)?.clone(),
            view: placement.view,
        })
    }

    /// Storage for `owner` the first time one of its contributors runs.
    fn resolve(
        &self,
        plan: &Plan<D>,
        frame: &mut FramePool<D::Buffer>,
        commands: &mut D::Commands,
        owner: NodeId,
        slot: usize,
        stop_owner: Option<NodeId>,
    ) -> Result<BufferId> {
        let desc = plan.descriptor(owner, self.nodes[owner.0].shape)?;
        let pending = plan.pending[owner.0];
        let id = if let Some(buffers) = plan.durable.get(&owner) {
            log::trace!("{}: durable buffer, slot {slot}", self.label(owner));
            frame.adopt(buffers[slot].clone(), desc, pending)
        } else if stop_owner == Some(owner) {
            log::trace!("{}: one-shot durable buffer", self.label(owner));
            frame.adopt(self.device.allocate_durable(&desc)?, desc, pending)
        } else {
            let id = frame.acquire(desc, pending, |d| {
                self.device.allocate_ephemeral(d, commands)
            })?;
            log::trace!(
                "{}: ephemeral buffer {:?} for {}, pending {}",
                self.label(owner),
                id,
                desc.dims,
                pending
            );
            id
        };
        if plan.uncovered.contains(&owner) {
            log::trace!("{}: clearing, contributors do not cover it", self.label(owner));
            self.device.clear(commands, frame.buffer(id)?)?;
        }
        Ok(id)
    }

    /// Encode one frame on slot 0, run it and read the result back.
    pub fn evaluate(&self, source: &Tensor, stop: Option<NodeId>) -> Result<Tensor> {
        let buffer = self.device.upload(source)?;
        let mut commands = self.device.new_commands();
        let output = self.encode(&mut commands, &buffer, 0, stop)?;
        self.device.submit(commands).wait()?;
        self.device.download(&output.buffer, output.view)
    }

    /// Read a node kept across frames (the output or any node marked with
    /// [`Graph::keep`]) from the given slot.
    pub fn durable(&self, node: NodeId, slot: usize) -> Result<Output<D::Buffer>> {
        let plan = self.plan_ref()?;
        if slot >= plan.slots {
            return Err(Error::InvalidSlot {
                slot,
                slots: plan.slots,
            });
        }
        if node.0 >= self.nodes.len() {
            return Err(Error::UnknownNode(node));
        }
        let placement = plan.placement(node)?;
        let buffers = plan
            .durable
            .get(&placement.owner)
            .with_context(|| format!("{} is not kept across frames", self.label(node)))?;
        Ok(Output {
            node,
            buffer: buffers[slot].clone(),
            view: placement.view,
        })
    }

    /// Copy an output back to the host.
    pub fn read(&self, output: &Output<D::Buffer>) -> Result<Tensor> {
        self.device.download(&output.buffer, output.view)
    }

    /// Evaluate up to each node in turn and hand its value to `dumper`.
    ///
    /// Nodes feeding a Concatenate or Collect are skipped; their values show up as
    /// part of the joined node.
    pub fn debug_evaluate(&self, source: &Tensor, dumper: &mut impl TensorDumper) -> Result<()> {
        let plan = self.plan_ref()?;
        for &id in &plan.order {
            let single = self.nodes[id.0]
                .next
                .iter()
                .all(|next| self.nodes[next.0].previous().len() == 1);
            if id == plan.input || !single {
                continue;
            }
            let tensor = self.evaluate(source, Some(id))?;
            dumper.dump(id, &self.label(id), &tensor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::{
        device::{BufferDesc, Parameters},
        ops::{Convolution, Pooling},
        Operation, ParameterKind, Shape,
    };

    /// Records executions instead of running them. Buffers are allocation numbers.
    #[derive(Default)]
    struct Recorder {
        durable: std::cell::Cell<usize>,
    }

    struct Exec {
        kernel: String,
        input: (usize, View),
        output: (usize, View),
    }

    #[derive(Default)]
    struct Tape {
        execs: Vec<Exec>,
        /// Cleared buffer and the number of executions recorded before it.
        clears: Vec<(usize, usize)>,
        next: usize,
    }

    struct Done;

    impl Submission for Done {
        fn wait(self) -> Result<()> {
            Ok(())
        }
    }

    const SOURCE: usize = usize::MAX;

    impl Device for Recorder {
        type Buffer = usize;
        type Commands = Tape;
        type Kernel = String;
        type Submission = Done;

        fn new_commands(&self) -> Tape {
            Tape::default()
        }

        fn allocate_ephemeral(&self, _: &BufferDesc, tape: &mut Tape) -> Result<usize> {
            tape.next += 1;
            Ok(tape.next)
        }

        fn allocate_durable(&self, _: &BufferDesc) -> Result<usize> {
            self.durable.set(self.durable.get() + 1);
            Ok(1_000_000 + self.durable.get())
        }

        fn build(&self, op: &Operation, _: Shape, _: Dims, _: Parameters) -> Result<String> {
            Ok(op.name().unwrap_or_default().to_string())
        }

        fn execute(
            &self,
            tape: &mut Tape,
            kernel: &String,
            input: (&usize, View),
            output: (&usize, View),
        ) -> Result<()> {
            tape.execs.push(Exec {
                kernel: kernel.clone(),
                input: (*input.0, input.1),
                output: (*output.0, output.1),
            });
            Ok(())
        }

        fn clear(&self, tape: &mut Tape, buffer: &usize) -> Result<()> {
            tape.clears.push((*buffer, tape.execs.len()));
            Ok(())
        }

        fn submit(&self, _: Tape) -> Done {
            Done
        }

        fn dims(&self, _: &usize) -> Dims {
            Dims::new(8, 8, 3)
        }

        fn upload(&self, _: &Tensor) -> Result<usize> {
            Ok(SOURCE)
        }

        fn download(&self, _: &usize, view: View) -> Result<Tensor> {
            Ok(Tensor::zeros(view.dims))
        }
    }

    fn overlaps(a: &View, b: &View) -> bool {
        let chans = a.channel_offset < b.channel_offset + b.dims.channels
            && b.channel_offset < a.channel_offset + a.dims.channels;
        let images = a.image_offset < b.image_offset + b.dims.num_images
            && b.image_offset < a.image_offset + a.dims.num_images;
        chans && images
    }

    fn contains(outer: &View, inner: &View) -> bool {
        inner.channel_offset >= outer.channel_offset
            && inner.channel_offset + inner.dims.channels
                <= outer.channel_offset + outer.dims.channels
            && inner.image_offset >= outer.image_offset
            && inner.image_offset + inner.dims.num_images
                <= outer.image_offset + outer.dims.num_images
    }

    /// Replays the tape, checking every read still sees exactly the values written
    /// by the operations that make up the node being read.
    fn check_tape(graph: &Graph<Recorder>, tape: &Tape) {
        let by_label: HashMap<String, NodeId> =
            graph.nodes().map(|(id, _)| (graph.label(id), id)).collect();
        let mut written: Vec<(usize, View, NodeId)> = Vec::new();
        for exec in &tape.execs {
            let id = by_label[&exec.kernel];
            let NodeKind::Op { input, .. } = graph.node(id).unwrap().kind else {
                unreachable!()
            };
            let (buf, view) = exec.input;
            if buf != SOURCE {
                let (owner, read) = graph.placement(input).unwrap();
                assert_eq!(read, view);
                let wanted: Vec<NodeId> = graph
                    .nodes()
                    .filter(|(w, node)| {
                        node.op().is_some()
                            && graph
                                .placement(*w)
                                .is_some_and(|(o, v)| o == owner && contains(&read, &v))
                    })
                    .map(|(w, _)| w)
                    .collect();
                let mut seen: Vec<NodeId> = written
                    .iter()
                    .filter(|(b, v, _)| *b == buf && overlaps(v, &view))
                    .map(|(_, _, w)| *w)
                    .collect();
                seen.sort();
                assert_eq!(seen, wanted, "{} read a clobbered buffer", exec.kernel);
            }
            let (buf, view) = exec.output;
            written.retain(|(b, v, _)| !(*b == buf && overlaps(v, &view)));
            written.push((buf, view, id));
        }
    }

    fn named(op: impl Into<Operation>, name: &str) -> Operation {
        op.into().named(name)
    }

    #[test]
    fn chain_reuses_buffers_without_clobbering() {
        let mut graph = Graph::new(Recorder::default());
        let x = graph.input(Shape::new(8, 8, 3)).unwrap();
        let a = graph.append(x, named(Convolution::new(3, 4), "a")).unwrap();
        let b = graph.append(a, named(Convolution::new(3, 4), "b")).unwrap();
        let c = graph.append(b, named(Convolution::new(3, 4), "c")).unwrap();
        let d = graph.append(c, named(Convolution::new(3, 4), "d")).unwrap();
        graph.append(d, named(Pooling::max(2, 2), "e")).unwrap();
        graph
            .compile(&mut |_: &str, n: usize, _: ParameterKind| Some(vec![0.0f32; n]))
            .unwrap();

        let mut tape = Tape::default();
        graph.encode(&mut tape, &SOURCE, 0, None).unwrap();
        assert_eq!(tape.execs.len(), 5);
        check_tape(&graph, &tape);
        // a, b, c, d share one descriptor; only two buffers ping-pong.
        assert_eq!(tape.next, 2);
    }

    #[test]
    fn branches_and_merges_respect_pending_counts() {
        let mut graph = Graph::new(Recorder::default());
        let x = graph.input(Shape::new(8, 8, 3)).unwrap();
        let a = graph.append(x, named(Convolution::new(1, 4), "a")).unwrap();
        let b = graph.append(a, named(Convolution::new(1, 4), "b")).unwrap();
        let c = graph.append(a, named(Convolution::new(3, 4), "c")).unwrap();
        let d = graph.append(b, named(Convolution::new(1, 2), "d")).unwrap();
        let cat = graph.concatenate(&[b, c, d]).unwrap();
        let e = graph.append(c, named(Convolution::new(1, 10), "e")).unwrap();
        let col = graph.collect(&[cat, e]).unwrap();
        graph.append(col, named(Pooling::max(2, 2), "f")).unwrap();
        graph
            .compile(&mut |_: &str, n: usize, _: ParameterKind| Some(vec![0.0f32; n]))
            .unwrap();

        // b, c and d all land in the collect buffer, owned by `col`.
        let (owner, view) = graph.placement(d).unwrap();
        assert_eq!(owner, col);
        assert_eq!((view.channel_offset, view.image_offset), (8, 0));
        let (_, view) = graph.placement(e).unwrap();
        assert_eq!((view.channel_offset, view.image_offset), (0, 1));
        // Writes b, c, d, e; reads by d (of b), e (of c) and f (of col).
        assert_eq!(graph.pending_count(col), Some(7));

        for _ in 0..3 {
            let mut tape = Tape::default();
            graph.encode(&mut tape, &SOURCE, 1, None).unwrap();
            assert_eq!(tape.execs.len(), 6);
            assert!(tape.clears.is_empty());
            check_tape(&graph, &tape);
        }
    }

    #[test]
    fn partly_covered_owner_is_cleared_before_writes() {
        let mut graph = Graph::new(Recorder::default());
        let x = graph.input(Shape::new(8, 8, 3)).unwrap();
        let a = graph.append(x, named(Convolution::new(1, 2), "a")).unwrap();
        let p = graph.append(x, named(Pooling::max(2, 2), "p")).unwrap();
        let c = graph.append(p, named(Convolution::new(1, 1), "c")).unwrap();
        let cat = graph.concatenate(&[a, c]).unwrap();
        graph.append(cat, named(Pooling::max(2, 2), "f")).unwrap();
        graph
            .compile(&mut |_: &str, n: usize, _: ParameterKind| Some(vec![0.0f32; n]))
            .unwrap();
        let (_, view) = graph.placement(c).unwrap();
        assert_eq!(view.dims, Dims::new(4, 4, 1));
        assert_eq!(view.extent, Dims::new(8, 8, 3));

        for _ in 0..2 {
            let mut tape = Tape::default();
            graph.encode(&mut tape, &SOURCE, 0, None).unwrap();
            assert_eq!(tape.clears.len(), 1);
            let (cleared, before) = tape.clears[0];
            let writers: Vec<usize> = tape
                .execs
                .iter()
                .enumerate()
                .filter(|(_, e)| e.output.0 == cleared)
                .map(|(i, _)| i)
                .collect();
            assert_eq!(writers.len(), 2);
            assert!(writers.iter().all(|&i| i >= before));
            check_tape(&graph, &tape);
        }
    }

    #[test]
    fn stop_node_gets_its_own_buffer() {
        let mut graph = Graph::new(Recorder::default());
        let x = graph.input(Shape::new(8, 8, 3)).unwrap();
        let a = graph.append(x, named(Convolution::new(1, 4), "a")).unwrap();
        let b = graph.append(a, named(Convolution::new(1, 4), "b")).unwrap();
        graph.append(b, named(Convolution::new(1, 4), "c")).unwrap();
        graph
            .compile_with(
                &mut |_: &str, n: usize, _: ParameterKind| Some(vec![0.0f32; n]),
                &crate::CompileConfig::default().with_inflight_slots(1),
            )
            .unwrap();
        let durable_before = graph.device().durable.get();

        let mut tape = Tape::default();
        let out = graph.encode(&mut tape, &SOURCE, 0, Some(a)).unwrap();
        assert_eq!(tape.execs.len(), 1);
        assert_eq!(out.node, a);
        assert_eq!(graph.device().durable.get(), durable_before + 1);
        assert_eq!(out.buffer, 1_000_000 + durable_before + 1);
    }

    #[test]
    fn encode_checks_slot_and_source() {
        let mut graph = Graph::new(Recorder::default());
        let x = graph.input(Shape::new(4, 4, 3)).unwrap();
        graph.append(x, named(Pooling::max(2, 2), "p")).unwrap();
        let mut tape = Tape::default();
        assert!(matches!(
            graph.encode(&mut tape, &SOURCE, 0, None),
            Err(Error::NotCompiled)
        ));
        graph.compile(&mut crate::NoParameters).unwrap();
        assert!(matches!(
            graph.encode(&mut tape, &SOURCE, 3, None),
            Err(Error::InvalidSlot { slot: 3, slots: 3 })
        ));
        // The recorder always reports 8x8x3 sources.
        assert!(matches!(
            graph.encode(&mut tape, &SOURCE, 0, None),
            Err(Error::SourceShape { .. })
        ));
    }
}
