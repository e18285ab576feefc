//! Accumulates atomic operations and nested chains into an [`OperationNode`].

use crate::{
    chain::Chain,
    deferred::{Deferred, Value},
    node::OperationNode,
    operation::{LocalOperation, NativeOperation},
};

/// Collects the steps of a computation, either to run one after the other or side by side.
///
/// [`StepBuilder::build`] consumes the builder, a builder can therefore only be built once:
///
/// ```compile_fail
/// use polyflow::builder::StepBuilder;
///
/// let builder = StepBuilder::<()>::sequential();
/// let first = builder.build();
/// let second = builder.build();
/// ```
#[derive(Debug)]
pub struct StepBuilder<P> {
    parallel: bool,
    nodes: Vec<OperationNode<P>>,
}

impl<P: 'static> StepBuilder<P> {
    /// A builder whose steps run one after the other.
    pub fn sequential() -> Self {
        Self {
            parallel: false,
            nodes: vec![],
        }
    }

    /// A builder whose steps run side by side, sharing network rounds.
    pub fn parallel() -> Self {
        Self {
            parallel: true,
            nodes: vec![],
        }
    }

    /// Whether the steps of this builder run side by side.
    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    /// The number of steps appended so far.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no step has been appended yet.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Appends an atomic operation and returns the handle on its output, available once the
    /// operation has finished.
    pub fn append<O: NativeOperation<P>>(&mut self, operation: O) -> Deferred<O::Output> {
        let (node, output) = OperationNode::leaf(operation);
        self.nodes.push(node);
        output
    }

    /// Appends a local computation that runs once all previous steps of a sequential builder
    /// have finished.
    pub fn compute<T: Value>(&mut self, f: impl FnOnce() -> T + Send + 'static) -> Deferred<T> {
        self.append(LocalOperation::new(f))
    }

    /// Appends an already constructed node.
    pub fn append_node(&mut self, node: OperationNode<P>) {
        self.nodes.push(node);
    }

    /// Starts a nested chain whose first step runs `f` against a fresh sequential builder.
    ///
    /// The chain is materialized lazily at the position of this call, so it runs after all
    /// previously appended steps of a sequential builder.
    pub fn seq<T, F>(&mut self, f: F) -> Chain<'_, P, T>
    where
        T: Value,
        F: FnOnce(&mut StepBuilder<P>) -> Deferred<T> + Send + 'static,
    {
        self.chain(false, f)
    }

    /// Starts a nested chain whose first step runs `f` against a fresh parallel builder.
    pub fn par<T, F>(&mut self, f: F) -> Chain<'_, P, T>
    where
        T: Value,
        F: FnOnce(&mut StepBuilder<P>) -> Deferred<T> + Send + 'static,
    {
        self.chain(true, f)
    }

    /// Runs `f` and `g` side by side and joins their outputs.
    pub fn par_join<A, B, F, G>(&mut self, f: F, g: G) -> Chain<'_, P, (A, B)>
    where
        A: Value,
        B: Value,
        F: FnOnce(&mut StepBuilder<P>) -> Deferred<A> + Send + 'static,
        G: FnOnce(&mut StepBuilder<P>) -> Deferred<B> + Send + 'static,
    {
        self.par(move |par| {
            let a = par.seq(f).output();
            let b = par.seq(g).output();
            a.pair(&b)
        })
    }

    fn chain<T, F>(&mut self, parallel: bool, f: F) -> Chain<'_, P, T>
    where
        T: Value,
        F: FnOnce(&mut StepBuilder<P>) -> Deferred<T> + Send + 'static,
    {
        Chain::new(self, parallel, f)
    }

    /// Consumes the builder and returns the node of all its steps.
    pub fn build(self) -> OperationNode<P> {
        if self.parallel {
            OperationNode::parallel(self.nodes)
        } else {
            OperationNode::sequential(self.nodes)
        }
    }
}
