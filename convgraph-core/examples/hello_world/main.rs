use convgraph_core::{
    Activation, Convolution, Dense, Dims, Graph, Operation, Pooling, RandomParameters, Shape,
    Tensor,
};

fn main() {
    env_logger::init();

    let mut graph: Graph = Graph::default();
    let x = graph.input(Shape::new(32, 32, 3)).unwrap();
    let stem = graph
        .append(
            x,
            Operation::from(Convolution::new(3, 16).activation(Activation::ReLU)).named("stem"),
        )
        .unwrap();
    let left = graph.append(stem, Convolution::pointwise(8)).unwrap();
    let right = graph
        .chain(stem, [Convolution::new(3, 8), Convolution::new(3, 8)])
        .unwrap();
    let joined = graph.concatenate(&[left, right]).unwrap();
    let pooled = graph.append(joined, Pooling::max(2, 2)).unwrap();
    graph
        .append(pooled, Operation::from(Dense::new(10)).named("logits"))
        .unwrap();

    graph.compile(&mut RandomParameters::new(42)).unwrap();
    println!("{}", graph.summary());

    if let Err(e) = graph.visualize("graph.png") {
        println!("could not render graph.png: {e}");
    }

    let image = Tensor::from_fn(Dims::new(32, 32, 3), |_, y, x, c| {
        ((x + y * 2 + c) % 16) as f32 / 16.0
    });
    let out = graph.evaluate(&image, None).unwrap();
    println!("output {} checksum {:.6}", out.dims(), out.checksum());
    dbg!(out.data());
}
