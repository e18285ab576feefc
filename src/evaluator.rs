//! Drives an operation tree to completion, batch by batch and round by round.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::{Level, debug, instrument};

use crate::{
    Error,
    builder::StepBuilder,
    channel::Channel,
    config::EvaluatorConfig,
    deferred::{Deferred, Value},
    network::BatchedNetwork,
    node::OperationNode,
    operation::{Batch, EvaluationStatus, ScheduledOperation},
};

/// How many atomic operations the evaluator collects before running them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchPolicy {
    /// One pass over all operations that are currently ready.
    #[default]
    OnePass,
    /// One pass, stopping after the given number of operations.
    Capped(usize),
}

impl BatchPolicy {
    fn capacity(self) -> Option<usize> {
        match self {
            BatchPolicy::OnePass => None,
            BatchPolicy::Capped(n) => Some(n),
        }
    }
}

/// Runs the atomic operations of a batch to completion.
pub trait BatchStrategy<P> {
    /// Evaluates every operation of `batch` until it is done, publishes the outputs and returns
    /// the number of network exchanges it took.
    fn process_batch<C: Channel + Send>(
        &self,
        batch: Batch<P>,
        pool: &mut P,
        network: &mut BatchedNetwork<C>,
    ) -> impl Future<Output = Result<usize, Error>> + Send;
}

/// The batch strategies that come with the crate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvaluationStrategy {
    /// Runs the operations of a batch one at a time, each over all of its rounds.
    Sequential,
    /// Advances all operations of a batch together, sharing one network exchange per round.
    #[default]
    Batched,
}

impl<P: Send + 'static> BatchStrategy<P> for EvaluationStrategy {
    async fn process_batch<C: Channel + Send>(
        &self,
        batch: Batch<P>,
        pool: &mut P,
        network: &mut BatchedNetwork<C>,
    ) -> Result<usize, Error> {
        match self {
            EvaluationStrategy::Batched => {
                run_rounds(batch.into_operations(), pool, network).await
            }
            EvaluationStrategy::Sequential => {
                let mut exchanges = 0;
                for operation in batch {
                    exchanges += run_rounds(vec![operation], pool, network).await?;
                }
                Ok(exchanges)
            }
        }
    }
}

/// Evaluates `operations` round by round, with one network exchange between two rounds, until
/// all of them are done.
///
/// Fails if the operations leave messages behind that were sent but never exchanged, or exchanged
/// but never received.
pub async fn run_rounds<P, C: Channel>(
    mut operations: Vec<ScheduledOperation<P>>,
    pool: &mut P,
    network: &mut BatchedNetwork<C>,
) -> Result<usize, Error>
where
    P: 'static,
{
    let mut round = 0;
    loop {
        let mut pending = Vec::with_capacity(operations.len());
        for mut operation in operations {
            match operation.evaluate(round, pool, network)? {
                EvaluationStatus::Done => operation.finish(),
                EvaluationStatus::HasMoreRounds => pending.push(operation),
            }
        }
        if pending.is_empty() {
            network.ensure_flushed()?;
            network.ensure_drained()?;
            return Ok(round);
        }
        network.exchange().await?;
        operations = pending;
        round += 1;
    }
}

/// Statistics about a finished evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvaluationSummary {
    /// The number of batches collected from the operation tree.
    pub batches: usize,
    /// The number of atomic operations evaluated.
    pub operations: usize,
    /// The number of network exchanges.
    pub rounds: usize,
}

/// A computation described against a root [`StepBuilder`].
pub trait Application<P> {
    /// The result of the computation.
    type Output: Value;

    /// Appends the computation to `builder` and returns the handle on its result.
    fn build(self, builder: &mut StepBuilder<P>) -> Deferred<Self::Output>;
}

impl<P, T, F> Application<P> for F
where
    T: Value,
    F: FnOnce(&mut StepBuilder<P>) -> Deferred<T>,
{
    type Output = T;

    fn build(self, builder: &mut StepBuilder<P>) -> Deferred<T> {
        self(builder)
    }
}

/// Evaluates operation trees using a [`BatchStrategy`] and a [`BatchPolicy`].
#[derive(Debug, Clone)]
pub struct Evaluator<S = EvaluationStrategy> {
    strategy: S,
    policy: BatchPolicy,
}

impl Evaluator {
    /// An evaluator using the strategy and batch size of `config`.
    pub fn new(config: &EvaluatorConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self::with_strategy(config.strategy, config.batch_policy()))
    }
}

impl<S> Evaluator<S> {
    /// An evaluator using a custom batch strategy.
    ///
    /// # Panics
    ///
    /// Panics if `policy` caps batches at zero operations.
    pub fn with_strategy(strategy: S, policy: BatchPolicy) -> Self {
        assert_ne!(
            policy,
            BatchPolicy::Capped(0),
            "batches must hold at least one operation"
        );
        Self { strategy, policy }
    }

    /// The batch strategy.
    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// The batch policy.
    pub fn policy(&self) -> BatchPolicy {
        self.policy
    }

    /// Evaluates `root` until it is exhausted.
    ///
    /// Every batch is run to completion before the next one is collected, so operations that
    /// become reachable later can rely on the outputs of all earlier batches.
    #[instrument(level = Level::DEBUG, skip_all, err)]
    pub async fn eval<P, C>(
        &self,
        mut root: OperationNode<P>,
        pool: &mut P,
        network: &mut BatchedNetwork<C>,
    ) -> Result<EvaluationSummary, Error>
    where
        S: BatchStrategy<P> + Sync,
        P: Send + 'static,
        C: Channel + Send,
    {
        let mut summary = EvaluationSummary::default();
        while root.has_more() {
            let mut batch = Batch::new(self.policy.capacity());
            root.drain_into(&mut batch);
            assert!(
                !batch.is_empty(),
                "operation tree reported more work but yielded an empty batch"
            );
            summary.batches += 1;
            summary.operations += batch.len();
            debug!(
                batch = summary.batches,
                operations = batch.len(),
                "evaluating batch"
            );
            summary.rounds += self.strategy.process_batch(batch, pool, network).await?;
        }
        debug!(
            batches = summary.batches,
            operations = summary.operations,
            rounds = summary.rounds,
            "evaluation finished"
        );
        Ok(summary)
    }

    /// Builds `app` against a root sequential builder, evaluates it and returns its result.
    ///
    /// # Panics
    ///
    /// Panics if the handle returned by `app` is not computed by the steps it appended.
    pub async fn run<P, C, A>(
        &self,
        app: A,
        pool: &mut P,
        network: &mut BatchedNetwork<C>,
    ) -> Result<A::Output, Error>
    where
        S: BatchStrategy<P> + Sync,
        P: Send + 'static,
        C: Channel + Send,
        A: Application<P>,
    {
        let mut builder = StepBuilder::sequential();
        let output = app.build(&mut builder);
        self.eval(builder.build(), pool, network).await?;
        Ok(output.resolve())
    }
}
