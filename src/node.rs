//! The tree of schedulable operations.
//!
//! An [`OperationNode`] is drained by the evaluator in passes. Each pass starts with
//! [`OperationNode::has_more`], which prunes exhausted children and materializes lazy children
//! whose predecessors have finished, followed by a single [`OperationNode::drain_into`] that moves
//! every atomic operation that is ready in this pass into a [`Batch`]. The evaluator runs the batch
//! to completion before the next pass starts, so a node that becomes reachable in pass `n + 1` may
//! read the outputs of everything drained in pass `n`.

use std::{collections::VecDeque, fmt, mem};

use tracing::debug;

use crate::{
    deferred::Deferred,
    operation::{Batch, NativeOperation, ScheduledOperation},
};

/// A node in the tree of schedulable operations.
pub enum OperationNode<P> {
    /// Children that run one after the other. A child is only drained once all of its
    /// predecessors are exhausted and their operations have finished.
    Sequential(VecDeque<OperationNode<P>>),
    /// Independent children whose operations share network rounds.
    Parallel(Vec<OperationNode<P>>),
    /// A node that is only constructed when it is first needed.
    Lazy(LazyNode<P>),
    /// A single atomic operation, `None` once it has been moved into a batch.
    Leaf(Option<ScheduledOperation<P>>),
    /// A data-dependent sequence of nodes that grows one node at a time, used for loops and
    /// step chains.
    Loop(Box<LoopNode<P>>),
}

impl<P: 'static> OperationNode<P> {
    /// A leaf for `operation`, together with the handle on its output.
    pub fn leaf<O: NativeOperation<P>>(operation: O) -> (Self, Deferred<O::Output>) {
        let (operation, output) = ScheduledOperation::new(operation);
        (OperationNode::Leaf(Some(operation)), output)
    }
}

impl<P> OperationNode<P> {
    /// Runs `children` one after the other.
    pub fn sequential(children: impl IntoIterator<Item = OperationNode<P>>) -> Self {
        OperationNode::Sequential(children.into_iter().collect())
    }

    /// Runs `children` side by side.
    pub fn parallel(children: impl IntoIterator<Item = OperationNode<P>>) -> Self {
        OperationNode::Parallel(children.into_iter().collect())
    }

    /// A node produced by `thunk` when it is first accessed.
    pub fn lazy(thunk: impl FnOnce() -> OperationNode<P> + Send + 'static) -> Self {
        OperationNode::Lazy(LazyNode(LazyState::Pending(Box::new(thunk))))
    }

    /// A loop driven by `driver`, which is asked for the next node each time the previous one is
    /// exhausted.
    pub fn looping(driver: impl LoopDriver<P> + 'static) -> Self {
        OperationNode::Loop(Box::new(LoopNode {
            state: LoopState::Checking,
            iterations: 0,
            driver: Box::new(driver),
        }))
    }

    /// A node without any operations.
    pub fn empty() -> Self {
        OperationNode::Sequential(VecDeque::new())
    }

    /// Whether any operation reachable from this node has not been drained yet.
    ///
    /// Prunes exhausted children and forces lazy nodes that are next in line, so this must only
    /// be called between passes, i.e. when all previously drained operations have finished.
    pub fn has_more(&mut self) -> bool {
        match self {
            OperationNode::Sequential(children) => {
                while let Some(current) = children.front_mut() {
                    if current.has_more() {
                        return true;
                    }
                    children.pop_front();
                }
                false
            }
            OperationNode::Parallel(children) => {
                children.retain_mut(OperationNode::has_more);
                !children.is_empty()
            }
            OperationNode::Lazy(lazy) => lazy.force().has_more(),
            OperationNode::Leaf(operation) => operation.is_some(),
            OperationNode::Loop(node) => node.has_more(),
        }
    }

    /// Moves all atomic operations that are ready in this pass into `batch`, stopping early once
    /// the batch is full.
    ///
    /// # Panics
    ///
    /// Panics if the node is exhausted.
    pub fn drain_into(&mut self, batch: &mut Batch<P>) {
        assert!(
            self.has_more(),
            "drain_into called on an exhausted operation node"
        );
        self.drain(batch);
    }

    /// Same as [`Self::drain_into`], for a node whose `has_more` was checked in this pass.
    fn drain(&mut self, batch: &mut Batch<P>) {
        match self {
            OperationNode::Sequential(children) => {
                if let Some(current) = children.front_mut() {
                    current.drain(batch);
                }
            }
            OperationNode::Parallel(children) => {
                for child in children.iter_mut() {
                    if batch.is_full() {
                        break;
                    }
                    child.drain(batch);
                }
            }
            OperationNode::Lazy(lazy) => lazy.force().drain(batch),
            OperationNode::Leaf(operation) => {
                if let Some(operation) = operation.take() {
                    batch.push(operation);
                }
            }
            OperationNode::Loop(node) => node.drain(batch),
        }
    }
}

impl<P> fmt::Debug for OperationNode<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationNode::Sequential(children) => {
                f.debug_tuple("Sequential").field(children).finish()
            }
            OperationNode::Parallel(children) => f.debug_tuple("Parallel").field(children).finish(),
            OperationNode::Lazy(lazy) => match &lazy.0 {
                LazyState::Pending(_) => f.write_str("Lazy(<pending>)"),
                LazyState::Ready(node) => f.debug_tuple("Lazy").field(node).finish(),
            },
            OperationNode::Leaf(Some(_)) => f.write_str("Leaf"),
            OperationNode::Leaf(None) => f.write_str("Leaf(<drained>)"),
            OperationNode::Loop(node) => f
                .debug_struct("Loop")
                .field("iterations", &node.iterations)
                .finish_non_exhaustive(),
        }
    }
}

type Thunk<P> = Box<dyn FnOnce() -> OperationNode<P> + Send>;

/// A node that is constructed on first access and cached afterwards.
pub struct LazyNode<P>(LazyState<P>);

enum LazyState<P> {
    Pending(Thunk<P>),
    Ready(Box<OperationNode<P>>),
}

impl<P> LazyNode<P> {
    fn force(&mut self) -> &mut OperationNode<P> {
        if let LazyState::Pending(_) = self.0 {
            let placeholder = LazyState::Ready(Box::new(OperationNode::empty()));
            if let LazyState::Pending(thunk) = mem::replace(&mut self.0, placeholder) {
                self.0 = LazyState::Ready(Box::new(thunk()));
            }
        }
        match &mut self.0 {
            LazyState::Ready(node) => &mut **node,
            LazyState::Pending(_) => unreachable!("lazy node was forced above"),
        }
    }
}

/// What a loop does after its previous iteration has finished.
pub enum LoopStep<P> {
    /// Run another iteration.
    Iterate(OperationNode<P>),
    /// Leave the loop and continue with the given node.
    Exit(OperationNode<P>),
}

/// Decides between another iteration and leaving the loop, once the previous iteration finished.
pub trait LoopDriver<P>: Send {
    /// Called exactly once after each finished iteration (and once before the first), until it
    /// returns [`LoopStep::Exit`]; never called again afterwards.
    fn next(&mut self) -> LoopStep<P>;
}

/// The state machine behind [`OperationNode::Loop`].
pub struct LoopNode<P> {
    state: LoopState<P>,
    iterations: usize,
    driver: Box<dyn LoopDriver<P>>,
}

enum LoopState<P> {
    /// The previous iteration finished, the driver has to decide how to go on.
    Checking,
    /// An iteration is being drained.
    Running(Box<OperationNode<P>>),
    /// The loop is left, what remains is the rest of the enclosing computation.
    Delegating(Box<OperationNode<P>>),
    /// Terminal, the loop never runs again.
    Done,
}

impl<P> LoopNode<P> {
    fn has_more(&mut self) -> bool {
        loop {
            match &mut self.state {
                LoopState::Checking => {
                    self.state = match self.driver.next() {
                        LoopStep::Iterate(body) => {
                            self.iterations += 1;
                            debug!(iteration = self.iterations, "starting loop iteration");
                            LoopState::Running(Box::new(body))
                        }
                        LoopStep::Exit(remainder) => {
                            debug!(iterations = self.iterations, "leaving loop");
                            LoopState::Delegating(Box::new(remainder))
                        }
                    }
                }
                LoopState::Running(body) => {
                    if body.has_more() {
                        return true;
                    }
                    self.state = LoopState::Checking;
                }
                LoopState::Delegating(remainder) => {
                    if remainder.has_more() {
                        return true;
                    }
                    self.state = LoopState::Done;
                }
                LoopState::Done => return false,
            }
        }
    }

    fn drain(&mut self, batch: &mut Batch<P>) {
        match &mut self.state {
            LoopState::Running(node) | LoopState::Delegating(node) => node.drain(batch),
            LoopState::Checking | LoopState::Done => {
                unreachable!("loop drained without checking for more work")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use super::{LoopDriver, LoopStep, OperationNode};
    use crate::{
        network::{self, Network, PartyId},
        operation::{Batch, EvaluationStatus, LocalOperation},
    };

    /// A network for operations that never communicate.
    struct Offline;

    impl Network for Offline {
        fn send(&mut self, party: PartyId, _data: Vec<u8>) -> Result<(), network::Error> {
            Err(network::Error::InvalidParty { party, parties: 0 })
        }

        fn receive(&mut self, party: PartyId) -> Result<Vec<u8>, network::Error> {
            Err(network::Error::InvalidParty { party, parties: 0 })
        }

        fn party_count(&self) -> usize {
            1
        }

        fn my_id(&self) -> PartyId {
            1
        }
    }

    fn leaf() -> OperationNode<()> {
        OperationNode::leaf(LocalOperation::new(|| ())).0
    }

    /// Drains one pass and finishes every drained operation, returning the batch size.
    fn pass(root: &mut OperationNode<()>, capacity: Option<usize>) -> usize {
        let mut batch = Batch::new(capacity);
        root.drain_into(&mut batch);
        let len = batch.len();
        for mut operation in batch {
            let status = operation.evaluate(0, &mut (), &mut Offline).unwrap();
            assert_eq!(status, EvaluationStatus::Done);
            operation.finish();
        }
        len
    }

    fn passes(mut root: OperationNode<()>, capacity: Option<usize>) -> Vec<usize> {
        let mut sizes = vec![];
        while root.has_more() {
            sizes.push(pass(&mut root, capacity));
        }
        sizes
    }

    #[test]
    fn sequential_forces_lazy_children_after_predecessors() {
        let forced = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&forced);
        let mut root = OperationNode::sequential([
            leaf(),
            OperationNode::lazy(move || {
                flag.store(true, Ordering::SeqCst);
                leaf()
            }),
        ]);
        assert!(root.has_more());
        assert!(!forced.load(Ordering::SeqCst));
        assert_eq!(pass(&mut root, None), 1);
        assert!(!forced.load(Ordering::SeqCst));
        assert!(root.has_more());
        assert!(forced.load(Ordering::SeqCst));
        assert_eq!(pass(&mut root, None), 1);
        assert!(!root.has_more());
    }

    #[test]
    fn parallel_children_share_a_pass() {
        let root = OperationNode::parallel([
            leaf(),
            leaf(),
            OperationNode::sequential([leaf(), leaf(), leaf()]),
            OperationNode::empty(),
        ]);
        assert_eq!(passes(root, None), vec![3, 1, 1]);
    }

    #[test]
    fn capped_batches_resume_where_they_stopped() {
        let root = OperationNode::parallel((0..5).map(|_| leaf()));
        assert_eq!(passes(root, Some(2)), vec![2, 2, 1]);
    }

    #[test]
    fn lazy_nodes_are_forced_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let root = OperationNode::lazy(move || {
            counted.fetch_add(1, Ordering::SeqCst);
            OperationNode::parallel([leaf(), leaf()])
        });
        assert_eq!(passes(root, None), vec![2]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "exhausted operation node")]
    fn draining_an_exhausted_node_panics() {
        let mut root = OperationNode::<()>::sequential([OperationNode::empty()]);
        root.drain_into(&mut Batch::new(None));
    }

    struct Countdown {
        remaining: usize,
        checks: Arc<AtomicUsize>,
    }

    impl LoopDriver<()> for Countdown {
        fn next(&mut self) -> LoopStep<()> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            if self.remaining == 0 {
                LoopStep::Exit(OperationNode::parallel([leaf(), leaf()]))
            } else {
                self.remaining -= 1;
                LoopStep::Iterate(leaf())
            }
        }
    }

    #[test]
    fn loops_grow_one_iteration_per_pass() {
        let checks = Arc::new(AtomicUsize::new(0));
        let root = OperationNode::sequential([
            leaf(),
            OperationNode::looping(Countdown {
                remaining: 3,
                checks: Arc::clone(&checks),
            }),
            leaf(),
        ]);
        assert_eq!(passes(root, None), vec![1, 1, 1, 1, 2, 1]);
        assert_eq!(checks.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn finished_loops_stay_done() {
        let checks = Arc::new(AtomicUsize::new(0));
        let mut root = OperationNode::looping(Countdown {
            remaining: 0,
            checks: Arc::clone(&checks),
        });
        assert_eq!(pass(&mut root, None), 2);
        assert!(!root.has_more());
        assert!(!root.has_more());
        assert_eq!(checks.load(Ordering::SeqCst), 1);
    }
}
