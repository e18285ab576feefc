//! Atomic operations, the smallest schedulable unit of work, and the batches in which the
//! evaluator hands them to a [`BatchStrategy`](crate::evaluator::BatchStrategy).

use std::{fmt, marker::PhantomData};

use crate::{
    Error,
    deferred::{Deferred, Value},
    network::Network,
};

/// Whether an atomic operation needs further rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationStatus {
    /// The operation must be evaluated again after the next network exchange.
    HasMoreRounds,
    /// The operation is finished, its output is available.
    Done,
}

/// An atomic operation supplied by a protocol suite, e.g. "multiply two shares".
///
/// The evaluator calls [`NativeOperation::evaluate`] with `round = 0, 1, 2, ...` until it returns
/// [`EvaluationStatus::Done`]. Messages sent in round `r` are received in round `r + 1`. Once the
/// operation is done it is never evaluated again and [`NativeOperation::into_output`] is called
/// exactly once.
pub trait NativeOperation<P>: Send + 'static {
    /// The result of the operation.
    type Output: Value;

    /// Runs one round of the operation.
    fn evaluate(
        &mut self,
        round: usize,
        pool: &mut P,
        network: &mut dyn Network,
    ) -> Result<EvaluationStatus, Error>;

    /// Extracts the result once the operation is done.
    fn into_output(self) -> Self::Output
    where
        Self: Sized;
}

/// An operation that computes its output locally in a single round, without any communication.
pub struct LocalOperation<F, T> {
    compute: Option<F>,
    output: Option<T>,
}

impl<F, T> LocalOperation<F, T> {
    /// Wraps a local computation.
    pub fn new(compute: F) -> Self {
        Self {
            compute: Some(compute),
            output: None,
        }
    }
}

impl<P, F, T> NativeOperation<P> for LocalOperation<F, T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Value,
{
    type Output = T;

    fn evaluate(
        &mut self,
        _round: usize,
        _pool: &mut P,
        _network: &mut dyn Network,
    ) -> Result<EvaluationStatus, Error> {
        if let Some(compute) = self.compute.take() {
            self.output = Some(compute());
        }
        Ok(EvaluationStatus::Done)
    }

    fn into_output(self) -> T {
        match self.output {
            Some(output) => output,
            None => panic!("local operation finished without being evaluated"),
        }
    }
}

/// The object-safe view of a native operation together with the slot of its output.
trait Erased<P>: Send {
    fn evaluate(
        &mut self,
        round: usize,
        pool: &mut P,
        network: &mut dyn Network,
    ) -> Result<EvaluationStatus, Error>;

    fn finish(self: Box<Self>);
}

struct WithOutput<O: NativeOperation<P>, P> {
    operation: O,
    output: Deferred<O::Output>,
    _pool: PhantomData<fn(&mut P)>,
}

impl<P: 'static, O: NativeOperation<P>> Erased<P> for WithOutput<O, P> {
    fn evaluate(
        &mut self,
        round: usize,
        pool: &mut P,
        network: &mut dyn Network,
    ) -> Result<EvaluationStatus, Error> {
        self.operation.evaluate(round, pool, network)
    }

    fn finish(self: Box<Self>) {
        let WithOutput {
            operation, output, ..
        } = *self;
        output.set(operation.into_output());
    }
}

/// A native operation that has been scheduled for evaluation.
pub struct ScheduledOperation<P> {
    inner: Box<dyn Erased<P>>,
}

impl<P: 'static> ScheduledOperation<P> {
    /// Schedules `operation` and returns the handle on its output.
    pub(crate) fn new<O: NativeOperation<P>>(operation: O) -> (Self, Deferred<O::Output>) {
        let output = Deferred::pending();
        let inner = Box::new(WithOutput {
            operation,
            output: output.clone(),
            _pool: PhantomData,
        });
        (Self { inner }, output)
    }

    /// Runs one round of the operation.
    pub fn evaluate(
        &mut self,
        round: usize,
        pool: &mut P,
        network: &mut dyn Network,
    ) -> Result<EvaluationStatus, Error> {
        self.inner.evaluate(round, pool, network)
    }

    /// Publishes the output of a finished operation to its deferred handle.
    ///
    /// # Panics
    ///
    /// Panics if the operation did not produce an output.
    pub fn finish(self) {
        self.inner.finish()
    }
}

impl<P> fmt::Debug for ScheduledOperation<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ScheduledOperation")
    }
}

/// The atomic operations collected during one pass over the operation tree.
#[derive(Debug)]
pub struct Batch<P> {
    operations: Vec<ScheduledOperation<P>>,
    capacity: Option<usize>,
}

impl<P> Batch<P> {
    /// An empty batch holding at most `capacity` operations (`None` for no limit).
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            operations: vec![],
            capacity,
        }
    }

    /// Whether no further operation fits into the batch.
    pub fn is_full(&self) -> bool {
        self.capacity
            .is_some_and(|capacity| self.operations.len() >= capacity)
    }

    /// The number of operations in the batch.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Whether the batch contains no operations.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub(crate) fn push(&mut self, operation: ScheduledOperation<P>) {
        debug_assert!(!self.is_full(), "operation pushed into a full batch");
        self.operations.push(operation);
    }

    /// The operations in the order they were collected.
    pub fn into_operations(self) -> Vec<ScheduledOperation<P>> {
        self.operations
    }
}

impl<P> IntoIterator for Batch<P> {
    type Item = ScheduledOperation<P>;
    type IntoIter = std::vec::IntoIter<ScheduledOperation<P>>;

    fn into_iter(self) -> Self::IntoIter {
        self.operations.into_iter()
    }
}
