use convgraph_core::{
    Activation, CompileConfig, Convolution, DepthwiseConvolution, Device, Dims, Graph, MergeOp,
    NodeId, Operation, ParameterKind, Pooling, Shape, Submission, Tensor,
};

const SHAPE: Shape = Shape::new(6, 5, 3);

fn params(name: &str, count: usize, kind: ParameterKind) -> Option<Vec<f32>> {
    let salt = name.bytes().map(usize::from).sum::<usize>();
    let scale = match kind {
        ParameterKind::Weights => 0.05,
        ParameterKind::Biases => 0.2,
    };
    Some(
        (0..count)
            .map(|i| ((i * 7 + salt) % 11) as f32 * scale - 0.25)
            .collect(),
    )
}

fn image() -> Tensor {
    Tensor::from_fn(Dims::new(6, 5, 3), |_, y, x, c| {
        ((y * 7 + x * 3 + c * 5) % 9) as f32 * 0.25 - 1.0
    })
}

fn assert_close(a: &Tensor, b: &Tensor) {
    let diff = a.max_abs_diff(b).expect("tensors have different dims");
    assert!(diff < 1e-4, "tensors differ by {diff}");
}

fn branch_a() -> Convolution {
    Convolution::new(3, 4).activation(Activation::ReLU)
}

fn branch_b() -> DepthwiseConvolution {
    DepthwiseConvolution::new(3).channel_multiplier(2)
}

fn named(op: impl Into<Operation>, name: &str) -> Operation {
    op.into().named(name)
}

/// Evaluate `x -> a` (and optionally `-> after`) on its own.
fn standalone(with_after: bool) -> Tensor {
    let mut graph: Graph = Graph::default();
    let x = graph.input(SHAPE).unwrap();
    let a = graph.append(x, named(branch_a(), "a")).unwrap();
    if with_after {
        graph
            .append(a, named(Convolution::pointwise(2), "after"))
            .unwrap();
    }
    graph.compile(&mut params).unwrap();
    graph.evaluate(&image(), None).unwrap()
}

/// Evaluate `x -> ops...` on its own.
fn alone(ops: Vec<Operation>) -> Tensor {
    let mut graph: Graph = Graph::default();
    let x = graph.input(SHAPE).unwrap();
    graph.chain(x, ops).unwrap();
    graph.compile(&mut params).unwrap();
    graph.evaluate(&image(), None).unwrap()
}

fn standalone_b() -> Tensor {
    alone(vec![named(branch_b(), "b")])
}

fn two_branches(graph: &mut Graph) -> (NodeId, NodeId) {
    let x = graph.input(SHAPE).unwrap();
    let a = graph.append(x, named(branch_a(), "a")).unwrap();
    let b = graph.append(x, named(branch_b(), "b")).unwrap();
    (a, b)
}

#[test]
fn concatenate_matches_separate_branches() {
    let mut graph: Graph = Graph::default();
    let (a, b) = two_branches(&mut graph);
    graph.concatenate(&[a, b]).unwrap();
    graph.compile(&mut params).unwrap();

    let out = graph.evaluate(&image(), None).unwrap();
    assert_eq!(out.dims(), Dims::new(6, 5, 10));
    assert_close(&out.channels(0..4).unwrap(), &standalone(false));
    assert_close(&out.channels(4..10).unwrap(), &standalone_b());
}

#[test]
fn concatenate_of_three_matches_separate_branches() {
    let third = || named(Convolution::pointwise(3).activation(Activation::Sigmoid), "c");
    let mut graph: Graph = Graph::default();
    let (a, b) = two_branches(&mut graph);
    let x = graph.input_node().unwrap();
    let c = graph.append(x, third()).unwrap();
    graph.concatenate(&[a, b, c]).unwrap();
    graph.compile(&mut params).unwrap();

    let out = graph.evaluate(&image(), None).unwrap();
    assert_eq!(out.dims(), Dims::new(6, 5, 13));
    assert_close(&out.channels(0..4).unwrap(), &standalone(false));
    assert_close(&out.channels(4..10).unwrap(), &standalone_b());
    assert_close(&out.channels(10..13).unwrap(), &alone(vec![third()]));
}

#[test]
fn collect_matches_separate_branches() {
    let one_by_one = || named(Convolution::new(1, 4), "b");
    let mut graph: Graph = Graph::default();
    let x = graph.input(SHAPE).unwrap();
    let a = graph.append(x, named(branch_a(), "a")).unwrap();
    let b = graph.append(x, one_by_one()).unwrap();
    graph.collect(&[b, a]).unwrap();
    graph.compile(&mut params).unwrap();

    let out = graph.evaluate(&image(), None).unwrap();
    assert_eq!(out.dims(), Dims::new(6, 5, 4).with_images(2));
    assert_close(&out.image(0).unwrap(), &alone(vec![one_by_one()]));
    assert_close(&out.image(1).unwrap(), &standalone(false));
}

/// `wide` covers the whole 6x5 extent, `narrow` only its 3x2 top-left corner.
fn spatially_mismatched(decoy: bool, keep: bool) -> Tensor {
    let mut graph: Graph = Graph::default();
    let x = graph.input(SHAPE).unwrap();
    if decoy {
        let z = graph.append(x, named(Convolution::new(3, 3), "decoy")).unwrap();
        graph.append(z, Pooling::max(2, 2)).unwrap();
    }
    let wide = graph.append(x, named(Convolution::pointwise(2), "wide")).unwrap();
    let pooled = graph.append(x, Pooling::max(2, 2)).unwrap();
    let narrow = graph
        .append(pooled, named(Convolution::pointwise(1), "narrow"))
        .unwrap();
    let cat = graph.concatenate(&[wide, narrow]).unwrap();
    let out = graph
        .append(cat, Activation::Linear { a: 1.0, b: 0.0 })
        .unwrap();
    if keep {
        graph.keep(cat).unwrap();
    }
    graph
        .compile_with(&mut params, &CompileConfig::default().with_output(out))
        .unwrap();
    graph.evaluate(&image(), None).unwrap()
}

#[test]
fn concatenate_pads_smaller_inputs_with_zeros() {
    let wide = alone(vec![named(Convolution::pointwise(2), "wide")]);
    let narrow = alone(vec![
        Pooling::max(2, 2).into(),
        named(Convolution::pointwise(1), "narrow"),
    ]);
    assert_eq!(narrow.dims(), Dims::new(3, 2, 1));

    let plain = spatially_mismatched(false, false);
    assert_eq!(plain.dims(), Dims::new(6, 5, 3));
    assert_close(&plain.channels(0..2).unwrap(), &wide);
    for y in 0..5 {
        for x in 0..6 {
            let v = plain.get(0, y, x, 2);
            if x < 3 && y < 2 {
                assert!((v - narrow.get(0, y, x, 0)).abs() < 1e-4);
            } else {
                assert_eq!(v, 0.0, "stale value at ({x}, {y})");
            }
        }
    }

    for _ in 0..3 {
        assert_close(&spatially_mismatched(true, false), &plain);
    }
    assert_close(&spatially_mismatched(true, true), &plain);
}

#[test]
fn contributors_can_also_feed_later_operations() {
    let mut graph: Graph = Graph::default();
    let (a, b) = two_branches(&mut graph);
    let cat = graph.concatenate(&[a, b]).unwrap();
    let after = graph
        .append(a, named(Convolution::pointwise(2), "after"))
        .unwrap();
    graph.keep(cat).unwrap();
    graph
        .compile_with(
            &mut params,
            &CompileConfig::default().with_output(after),
        )
        .unwrap();

    let source = graph.device().upload(&image()).unwrap();
    let mut commands = graph.device().new_commands();
    let out = graph.encode(&mut commands, &source, 0, None).unwrap();
    graph.device().submit(commands).wait().unwrap();

    assert_close(&graph.read(&out).unwrap(), &standalone(true));
    let kept = graph.read(&graph.durable(cat, 0).unwrap()).unwrap();
    assert_close(&kept.channels(0..4).unwrap(), &standalone(false));
    assert_close(&kept.channels(4..10).unwrap(), &standalone_b());
}

#[test]
fn merge_reduces_image_slots() {
    let reference = standalone(false);
    let cases = [
        (MergeOp::Add, 2.0),
        (MergeOp::Average, 1.0),
        (MergeOp::Multiply, 1.0),
        (MergeOp::Maximum, 1.0),
    ];
    for (op, scale) in cases {
        let mut graph: Graph = Graph::default();
        let x = graph.input(SHAPE).unwrap();
        let a1 = graph.append(x, named(branch_a(), "a")).unwrap();
        let a2 = graph.append(x, named(branch_a(), "a")).unwrap();
        let both = graph.collect(&[a1, a2]).unwrap();
        graph.append(both, op).unwrap();
        graph.compile(&mut params).unwrap();
        let out = graph.evaluate(&image(), None).unwrap();

        let expected = match op {
            MergeOp::Multiply => Tensor::new(
                reference.dims(),
                reference.data().iter().map(|v| v * v).collect(),
            )
            .unwrap(),
            _ => Tensor::new(
                reference.dims(),
                reference.data().iter().map(|v| v * scale).collect(),
            )
            .unwrap(),
        };
        assert_close(&out, &expected);
    }
}

#[test]
fn pooling_after_collect_runs_per_image() {
    let mut graph: Graph = Graph::default();
    let x = graph.input(SHAPE).unwrap();
    let a = graph.append(x, named(branch_a(), "a")).unwrap();
    let a2 = graph.append(x, named(branch_a(), "a")).unwrap();
    let both = graph.collect(&[a, a2]).unwrap();
    graph.append(both, Pooling::max(2, 2)).unwrap();
    graph.compile(&mut params).unwrap();

    let out = graph.evaluate(&image(), None).unwrap();
    assert_eq!(out.dims(), Dims::new(3, 2, 4).with_images(2));
    assert_close(&out.image(0).unwrap(), &out.image(1).unwrap());
}
