use std::sync::{Arc, Mutex};

use polyflow::{
    Error,
    channel::SimpleChannel,
    evaluator::{BatchPolicy, EvaluationStrategy, EvaluationSummary, Evaluator},
    network::{BatchedNetwork, Network},
    node::OperationNode,
    operation::{Batch, EvaluationStatus, NativeOperation},
};
use proptest::prelude::*;

type Log = Arc<Mutex<Vec<usize>>>;

/// Records its id every time it is evaluated.
struct Tagged {
    id: usize,
    log: Log,
}

impl NativeOperation<()> for Tagged {
    type Output = usize;

    fn evaluate(
        &mut self,
        _round: usize,
        _pool: &mut (),
        _network: &mut dyn Network,
    ) -> Result<EvaluationStatus, Error> {
        self.log.lock().unwrap().push(self.id);
        Ok(EvaluationStatus::Done)
    }

    fn into_output(self) -> usize {
        self.id
    }
}

#[derive(Debug, Clone)]
enum Shape {
    Leaf,
    Seq(Vec<Shape>),
    Par(Vec<Shape>),
    Lazy(Box<Shape>),
}

impl Shape {
    fn leaves(&self) -> usize {
        match self {
            Shape::Leaf => 1,
            Shape::Seq(children) | Shape::Par(children) => children.iter().map(Shape::leaves).sum(),
            Shape::Lazy(inner) => inner.leaves(),
        }
    }

    /// Builds the tree, numbering the leaves from `first` in depth-first order.
    fn build(&self, first: usize, log: &Log) -> OperationNode<()> {
        match self {
            Shape::Leaf => {
                OperationNode::leaf(Tagged {
                    id: first,
                    log: Arc::clone(log),
                })
                .0
            }
            Shape::Seq(children) => OperationNode::sequential(Self::build_all(children, first, log)),
            Shape::Par(children) => OperationNode::parallel(Self::build_all(children, first, log)),
            Shape::Lazy(inner) => {
                let (inner, log) = ((**inner).clone(), Arc::clone(log));
                OperationNode::lazy(move || inner.build(first, &log))
            }
        }
    }

    fn build_all(children: &[Shape], mut first: usize, log: &Log) -> Vec<OperationNode<()>> {
        children
            .iter()
            .map(|child| {
                let node = child.build(first, log);
                first += child.leaves();
                node
            })
            .collect()
    }
}

fn shapes() -> impl Strategy<Value = Shape> {
    Just(Shape::Leaf).prop_recursive(4, 48, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Shape::Seq),
            prop::collection::vec(inner.clone(), 0..4).prop_map(Shape::Par),
            inner.prop_map(|shape| Shape::Lazy(Box::new(shape))),
        ]
    })
}

fn network() -> BatchedNetwork<SimpleChannel> {
    let channel = SimpleChannel::channels(1).pop().unwrap();
    BatchedNetwork::new(channel, 1, 1).unwrap()
}

fn evaluate(shape: &Shape, evaluator: &Evaluator) -> (EvaluationSummary, Vec<usize>) {
    let log = Log::default();
    let root = shape.build(0, &log);
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let summary = runtime
        .block_on(evaluator.eval(root, &mut (), &mut network()))
        .unwrap();
    let mut visited = log.lock().unwrap().clone();
    visited.sort_unstable();
    (summary, visited)
}

/// Drains a single pass and returns the ids of the drained operations, sorted.
fn first_pass(mut node: OperationNode<()>, log: &Log) -> Vec<usize> {
    log.lock().unwrap().clear();
    if !node.has_more() {
        return vec![];
    }
    let mut batch = Batch::new(None);
    node.drain_into(&mut batch);
    let mut network = network();
    for mut operation in batch {
        operation.evaluate(0, &mut (), &mut network).unwrap();
        operation.finish();
    }
    let mut ids = log.lock().unwrap().clone();
    ids.sort_unstable();
    ids
}

proptest! {
    #[test]
    fn every_leaf_is_evaluated_exactly_once(shape in shapes()) {
        let evaluator = Evaluator::with_strategy(EvaluationStrategy::Batched, BatchPolicy::OnePass);
        let (summary, visited) = evaluate(&shape, &evaluator);
        let leaves = shape.leaves();
        prop_assert_eq!(summary.operations, leaves);
        prop_assert_eq!(summary.rounds, 0);
        prop_assert_eq!(visited, (0..leaves).collect::<Vec<_>>());
    }

    #[test]
    fn batching_does_not_change_which_operations_run(shape in shapes(), cap in 1usize..4) {
        let reference = evaluate(
            &shape,
            &Evaluator::with_strategy(EvaluationStrategy::Batched, BatchPolicy::OnePass),
        );
        let capped = evaluate(
            &shape,
            &Evaluator::with_strategy(EvaluationStrategy::Batched, BatchPolicy::Capped(cap)),
        );
        let sequential = evaluate(
            &shape,
            &Evaluator::with_strategy(EvaluationStrategy::Sequential, BatchPolicy::OnePass),
        );
        prop_assert_eq!(&capped.1, &reference.1);
        prop_assert_eq!(&sequential.1, &reference.1);
        prop_assert!(capped.0.batches >= reference.0.batches);
        prop_assert_eq!(sequential.0.batches, reference.0.batches);
    }

    #[test]
    fn parallel_passes_are_the_union_of_their_children(
        children in prop::collection::vec(shapes(), 0..5)
    ) {
        let log = Log::default();
        let mut expected = vec![];
        let mut first = 0;
        for child in &children {
            expected.extend(first_pass(child.build(first, &log), &log));
            first += child.leaves();
        }
        expected.sort_unstable();
        let parallel = Shape::Par(children).build(0, &log);
        prop_assert_eq!(first_pass(parallel, &log), expected);
    }
}
