use std::collections::HashMap;

use convgraph_core::{
    Activation, CompileConfig, Convolution, Dense, Error, Graph, MemoryParameters, NoParameters,
    Operation, ParameterKind, Pooling, RandomParameters, Shape, DEFAULT_INFLIGHT_SLOTS,
};

fn ramp(_: &str, count: usize, kind: ParameterKind) -> Option<Vec<f32>> {
    let scale = match kind {
        ParameterKind::Weights => 0.01,
        ParameterKind::Biases => 0.1,
    };
    Some((0..count).map(|i| (i % 13) as f32 * scale - 0.05).collect())
}

#[test]
fn concatenated_contributors_get_channel_offsets() {
    let mut graph: Graph = Graph::default();
    let x = graph.input(Shape::new(4, 4, 3)).unwrap();
    let a = graph.append(x, Convolution::new(3, 4)).unwrap();
    let b = graph.append(x, Convolution::new(3, 6)).unwrap();
    let cat = graph.concatenate(&[a, b]).unwrap();
    assert_eq!(graph.node(cat).unwrap().shape(), Shape::new(4, 4, 10));
    assert!(graph.node(cat).unwrap().is_marker());

    graph.compile(&mut ramp).unwrap();
    let (owner_a, view_a) = graph.placement(a).unwrap();
    let (owner_b, view_b) = graph.placement(b).unwrap();
    assert_eq!((owner_a, owner_b), (cat, cat));
    assert_eq!(view_a.channel_offset, 0);
    assert_eq!(view_b.channel_offset, 4);
    assert_eq!(view_b.dims.channels, 6);
    assert_eq!(view_b.extent.channels, 10);
    assert_eq!(graph.output(), Some(cat));
    // Both contributors write, nothing reads inside the frame.
    assert_eq!(graph.pending_count(cat), Some(2));
    assert_eq!(graph.placement(x), None);
}

#[test]
fn nested_markers_compose_offsets() {
    let mut graph: Graph = Graph::default();
    let x = graph.input(Shape::new(4, 4, 3)).unwrap();
    let a = graph.append(x, Convolution::pointwise(2)).unwrap();
    let b = graph.append(x, Convolution::pointwise(3)).unwrap();
    let inner = graph.concatenate(&[a, b]).unwrap();
    let c = graph.append(x, Convolution::pointwise(5)).unwrap();
    let d = graph.append(x, Convolution::pointwise(5)).unwrap();
    let stacked = graph.collect(&[c, inner, d]).unwrap();
    assert_eq!(
        graph.node(stacked).unwrap().shape(),
        Shape::new(4, 4, 5).with_images(3)
    );
    graph.compile(&mut ramp).unwrap();

    let (owner, view) = graph.placement(b).unwrap();
    assert_eq!(owner, stacked);
    assert_eq!((view.image_offset, view.channel_offset), (1, 2));
    let (_, view) = graph.placement(d).unwrap();
    assert_eq!((view.image_offset, view.channel_offset), (2, 0));
}

#[test]
fn compiling_twice_is_an_error() {
    let mut graph: Graph = Graph::default();
    let x = graph.input(Shape::new(4, 4, 1)).unwrap();
    graph.append(x, Pooling::max(2, 2)).unwrap();
    graph.compile(&mut NoParameters).unwrap();
    assert!(graph.is_compiled());
    assert!(matches!(
        graph.compile(&mut NoParameters),
        Err(Error::AlreadyCompiled)
    ));
    assert!(matches!(
        graph.append(x, Pooling::max(2, 2)),
        Err(Error::AlreadyCompiled)
    ));
}

#[test]
fn failed_compiles_stay_failed() {
    let mut graph: Graph = Graph::default();
    let x = graph.input(Shape::new(4, 4, 1)).unwrap();
    graph
        .append(x, Operation::from(Convolution::new(3, 2)).named("conv")).unwrap();

    let err = graph.compile(&mut NoParameters).unwrap_err();
    match err {
        Error::MissingParameters {
            operation,
            kind,
            expected,
        } => {
            assert_eq!(operation, "conv");
            assert_eq!(kind, ParameterKind::Weights);
            assert_eq!(expected, 18);
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(!graph.is_compiled());
    assert!(matches!(
        graph.compile(&mut ramp),
        Err(Error::CompileFailed(_))
    ));
    assert!(graph.summary().contains("Compile failed"));
}

#[test]
fn parameter_counts_are_checked() {
    let mut graph: Graph = Graph::default();
    let x = graph.input(Shape::new(4, 4, 2)).unwrap();
    graph
        .append(x, Operation::from(Convolution::new(1, 3)).named("mix")).unwrap();

    let mut params = MemoryParameters::new()
        .weights("mix", vec![0.5; 6])
        .biases("mix", vec![0.0; 2]);
    let err = graph.compile(&mut params).unwrap_err();
    assert!(
        matches!(
            err,
            Error::ParameterCount {
                kind: ParameterKind::Biases,
                expected: 3,
                actual: 2,
                ..
            }
        ),
        "{err}"
    );
}

#[test]
fn memory_parameters_are_looked_up_by_name() {
    let mut graph: Graph = Graph::default();
    let x = graph.input(Shape::new(4, 4, 2)).unwrap();
    graph
        .append(x, Operation::from(Convolution::new(1, 1).without_bias()).named("mix"))
        .unwrap();
    let mut params = MemoryParameters::new()
        .with_suffixes("/kernel", "/bias")
        .weights("mix", vec![1.0, -1.0]);
    graph.compile(&mut params).unwrap();
    assert_eq!(graph.total_params(), Some(2));
}

#[test]
fn unnamed_operations_get_generated_names() {
    let mut graph: Graph = Graph::default();
    let x = graph.input(Shape::new(4, 4, 2)).unwrap();
    let a = graph.append(x, Convolution::new(3, 4)).unwrap();
    let b = graph.append(a, Pooling::max(2, 2)).unwrap();
    graph
        .append(b, Operation::from(Dense::new(3)).named("head")).unwrap();

    let mut requested = Vec::new();
    graph
        .compile(&mut |name: &str, count: usize, kind: ParameterKind| {
            requested.push((name.to_string(), kind));
            Some(vec![0.0f32; count])
        })
        .unwrap();
    assert_eq!(
        requested,
        vec![
            ("__Conv_1__".to_string(), ParameterKind::Weights),
            ("__Conv_1__".to_string(), ParameterKind::Biases),
            ("head".to_string(), ParameterKind::Weights),
            ("head".to_string(), ParameterKind::Biases),
        ]
    );
    assert_eq!(graph.label(b), "__MaxPool_2__");
}

#[test]
fn reused_operations_load_parameters_once() {
    let mut graph: Graph = Graph::default();
    let x = graph.input(Shape::new(6, 6, 3)).unwrap();
    let shared = graph.add_operation(
        Operation::from(Convolution::new(3, 3).activation(Activation::ReLU)).named("shared"),
    );
    let a = graph.apply(x, shared).unwrap();
    let b = graph.apply(a, shared).unwrap();
    graph.apply(b, shared).unwrap();

    let mut loads: HashMap<String, usize> = HashMap::new();
    graph
        .compile(&mut |name: &str, count: usize, kind: ParameterKind| {
            *loads.entry(name.to_string()).or_default() += 1;
            ramp(name, count, kind)
        })
        .unwrap();
    assert_eq!(loads.get("shared"), Some(&2));
    assert_eq!(graph.total_params(), Some(3 * 3 * 3 * 3 + 3));
    assert!(graph.summary().contains("Total parameters: 84"));
}

#[test]
fn reused_operations_need_matching_shapes() {
    let mut graph: Graph = Graph::default();
    let x = graph.input(Shape::new(6, 6, 3)).unwrap();
    let shared = graph.add_operation(Convolution::new(3, 4));
    let a = graph.apply(x, shared).unwrap();
    graph.apply(a, shared).unwrap();
    let err = graph.compile(&mut RandomParameters::new(1)).unwrap_err();
    assert!(matches!(err, Error::Compile { .. }), "{err}");
}

#[test]
fn construction_errors() {
    let mut graph: Graph = Graph::default();
    let x = graph.input(Shape::new(4, 4, 3)).unwrap();
    assert!(matches!(
        graph.input(Shape::new(4, 4, 3)),
        Err(Error::Construction { .. })
    ));
    let a = graph.append(x, Convolution::pointwise(2)).unwrap();
    let b = graph.append(x, Convolution::pointwise(2)).unwrap();
    let two = graph.collect(&[a, b]).unwrap();
    let c = graph.append(x, Convolution::pointwise(2)).unwrap();

    let construction = |r: convgraph_core::Result<_>| matches!(r, Err(Error::Construction { .. }));
    assert!(construction(graph.concatenate(&[])));
    assert!(construction(graph.concatenate(&[c, c])));
    assert!(construction(graph.concatenate(&[x, c])));
    assert!(construction(graph.concatenate(&[a, c])));
    assert!(construction(graph.concatenate(&[two, c])));
    assert!(graph.keep(x).is_err());
    assert!(graph.concatenate(&[two]).is_ok());
}

#[test]
fn compile_config() {
    assert_eq!(CompileConfig::default().inflight_slots, DEFAULT_INFLIGHT_SLOTS);
    assert!(CompileConfig::default()
        .with_inflight_slots(0)
        .validate()
        .is_err());

    let mut graph: Graph = Graph::default();
    let x = graph.input(Shape::new(4, 4, 3)).unwrap();
    let a = graph.append(x, Pooling::max(2, 2)).unwrap();
    let b = graph.append(a, Pooling::max(2, 2)).unwrap();
    let config = CompileConfig::default()
        .with_inflight_slots(2)
        .with_output(a)
        .keep(b);
    graph.compile_with(&mut NoParameters, &config).unwrap();
    assert_eq!(graph.output(), Some(a));
    assert_eq!(graph.inflight_slots(), Some(2));
    assert!(graph.durable(b, 1).is_ok());
    assert!(matches!(
        graph.durable(b, 2),
        Err(Error::InvalidSlot { slot: 2, slots: 2 })
    ));
}

#[test]
fn unknown_nodes_in_config_are_rejected() {
    let mut other: Graph = Graph::default();
    let y = other.input(Shape::new(4, 4, 3)).unwrap();
    let foreign = other.append(y, Pooling::max(2, 2)).unwrap();
    let foreign = other.append(foreign, Pooling::max(2, 2)).unwrap();

    let mut graph: Graph = Graph::default();
    let x = graph.input(Shape::new(4, 4, 3)).unwrap();
    graph.append(x, Pooling::max(2, 2)).unwrap();
    let err = graph
        .compile_with(&mut NoParameters, &CompileConfig::default().keep(foreign))
        .unwrap_err();
    assert!(matches!(err, Error::UnknownNode(_)), "{err}");
}
