//! Fluent chains of steps whose structure unfolds as their inputs become available.
//!
//! A chain is an owned list of steps. Each step receives the output of the previous one and
//! returns the [`OperationNode`] computing its own output. The whole chain runs as one loop node
//! that materializes a step only once the output of the previous step is known, so neither the
//! construction nor the evaluation of a chain nests deeper as the chain grows.
//!
//! ```
//! use polyflow::{builder::StepBuilder, deferred::Deferred};
//!
//! fn count_to_three(builder: &mut StepBuilder<()>) -> Deferred<u32> {
//!     builder
//!         .seq(|b| b.compute(|| 0u32))
//!         .while_loop(|i| *i < 3, |b, i| b.compute(move || i + 1))
//!         .seq(|_, i| Deferred::ready(i * 10))
//!         .output()
//! }
//! ```

use std::{any::Any, marker::PhantomData, mem, vec};

use crate::{
    builder::StepBuilder,
    deferred::{Deferred, Value},
    node::{LoopDriver, LoopStep, OperationNode},
};

/// The output of a step, erased so that steps of different types fit into one list.
type Erased = Box<dyn Any + Send>;

/// Reads the output of a materialized step once its node is exhausted.
type Output = Box<dyn FnOnce() -> Erased + Send>;

/// Consumes the output of the previous step and materializes the next one.
type Step<P> = Box<dyn FnOnce(Erased) -> Stage<P> + Send>;

/// Receives the output of the last step.
type Finish = Box<dyn FnOnce(Erased) + Send>;

struct Stage<P> {
    node: OperationNode<P>,
    output: Output,
}

fn erase<T: Value>(output: Deferred<T>) -> Output {
    Box::new(move || Box::new(output.resolve()) as Erased)
}

fn unerase<T: 'static>(value: Erased) -> T {
    match value.downcast::<T>() {
        Ok(value) => *value,
        Err(_) => unreachable!("steps are typed by the chain linking them"),
    }
}

/// Runs `f` against a fresh builder.
fn stage<P: 'static, T: Value>(
    parallel: bool,
    f: impl FnOnce(&mut StepBuilder<P>) -> Deferred<T>,
) -> Stage<P> {
    let mut builder = if parallel {
        StepBuilder::parallel()
    } else {
        StepBuilder::sequential()
    };
    let output = f(&mut builder);
    Stage {
        node: builder.build(),
        output: erase(output),
    }
}

/// A chain of steps registered with the builder that started it.
///
/// The chain ends with [`Chain::output`]. A chain that is dropped without calling `output` still
/// runs, its final value is discarded.
pub struct Chain<'b, P: 'static, T: Value> {
    builder: Option<&'b mut StepBuilder<P>>,
    steps: Vec<Step<P>>,
    output: PhantomData<fn() -> T>,
}

impl<'b, P: 'static, T: Value> Chain<'b, P, T> {
    pub(crate) fn new<F>(builder: &'b mut StepBuilder<P>, parallel: bool, f: F) -> Self
    where
        F: FnOnce(&mut StepBuilder<P>) -> Deferred<T> + Send + 'static,
    {
        let first: Step<P> = Box::new(move |_: Erased| stage(parallel, f));
        Self {
            builder: Some(builder),
            steps: vec![first],
            output: PhantomData,
        }
    }

    fn push<U: Value>(mut self, step: Step<P>) -> Chain<'b, P, U> {
        let mut steps = mem::take(&mut self.steps);
        steps.push(step);
        Chain {
            builder: self.builder.take(),
            steps,
            output: PhantomData,
        }
    }

    fn then<U, F>(self, parallel: bool, f: F) -> Chain<'b, P, U>
    where
        U: Value,
        F: FnOnce(&mut StepBuilder<P>, T) -> Deferred<U> + Send + 'static,
    {
        self.push(Box::new(move |input: Erased| {
            let value: T = unerase(input);
            stage(parallel, move |b| f(b, value))
        }))
    }

    /// Continues with `f`, run against a fresh sequential builder once the previous output is
    /// available.
    pub fn seq<U, F>(self, f: F) -> Chain<'b, P, U>
    where
        U: Value,
        F: FnOnce(&mut StepBuilder<P>, T) -> Deferred<U> + Send + 'static,
    {
        self.then(false, f)
    }

    /// Continues with `f`, run against a fresh parallel builder once the previous output is
    /// available.
    pub fn par<U, F>(self, f: F) -> Chain<'b, P, U>
    where
        U: Value,
        F: FnOnce(&mut StepBuilder<P>, T) -> Deferred<U> + Send + 'static,
    {
        self.then(true, f)
    }

    /// Continues with `f` and `g` side by side, both on the previous output, and joins their
    /// outputs into a pair.
    pub fn par_join<A, B, F, G>(self, f: F, g: G) -> Chain<'b, P, (A, B)>
    where
        A: Value,
        B: Value,
        F: FnOnce(&mut StepBuilder<P>, T) -> Deferred<A> + Send + 'static,
        G: FnOnce(&mut StepBuilder<P>, T) -> Deferred<B> + Send + 'static,
    {
        self.par(move |par, value| {
            let left = value.clone();
            let a = par.seq(move |b| f(b, left)).output();
            let b = par.seq(move |b| g(b, value)).output();
            a.pair(&b)
        })
    }

    /// Runs `body` for as long as `predicate` holds for the current value, then continues with
    /// the final value.
    ///
    /// Each iteration gets a fresh sequential builder and starts only once the previous one has
    /// finished, so the predicate may depend on values that required network rounds. If the
    /// predicate does not hold for the initial value, `body` never runs and the value is passed
    /// on unchanged.
    pub fn while_loop<C, B>(self, predicate: C, body: B) -> Chain<'b, P, T>
    where
        C: FnMut(&T) -> bool + Send + 'static,
        B: FnMut(&mut StepBuilder<P>, T) -> Deferred<T> + Send + 'static,
    {
        self.push(Box::new(move |input: Erased| {
            let output = Deferred::pending();
            let node = OperationNode::looping(WhileLoop {
                current: Deferred::ready(unerase::<T>(input)),
                predicate,
                body,
                output: output.clone(),
            });
            Stage {
                node,
                output: erase(output),
            }
        }))
    }

    /// Ends the chain and returns the handle on its final value.
    pub fn output(mut self) -> Deferred<T> {
        let output = Deferred::pending();
        let slot = output.clone();
        self.finish(Box::new(move |value: Erased| slot.set(unerase::<T>(value))));
        output
    }

    fn finish(&mut self, finish: Finish) {
        if let Some(builder) = self.builder.take() {
            builder.append_node(OperationNode::looping(StepRunner {
                steps: mem::take(&mut self.steps).into_iter(),
                previous: None,
                finish: Some(finish),
            }));
        }
    }
}

impl<P: 'static, T: Value> Drop for Chain<'_, P, T> {
    fn drop(&mut self) {
        self.finish(Box::new(|_: Erased| {}));
    }
}

/// Materializes the steps of a chain one after the other.
struct StepRunner<P> {
    steps: vec::IntoIter<Step<P>>,
    previous: Option<Output>,
    finish: Option<Finish>,
}

impl<P: 'static> LoopDriver<P> for StepRunner<P> {
    fn next(&mut self) -> LoopStep<P> {
        let input: Erased = match self.previous.take() {
            Some(output) => output(),
            None => Box::new(()),
        };
        if let Some(step) = self.steps.next() {
            let stage = step(input);
            self.previous = Some(stage.output);
            return LoopStep::Iterate(stage.node);
        }
        match self.finish.take() {
            Some(finish) => finish(input),
            None => unreachable!("chain resumed after its last step"),
        }
        LoopStep::Exit(OperationNode::empty())
    }
}

struct WhileLoop<T, C, B> {
    current: Deferred<T>,
    predicate: C,
    body: B,
    output: Deferred<T>,
}

impl<P, T, C, B> LoopDriver<P> for WhileLoop<T, C, B>
where
    P: 'static,
    T: Value,
    C: FnMut(&T) -> bool + Send,
    B: FnMut(&mut StepBuilder<P>, T) -> Deferred<T> + Send,
{
    fn next(&mut self) -> LoopStep<P> {
        let value = self.current.resolve();
        if (self.predicate)(&value) {
            let mut builder = StepBuilder::sequential();
            self.current = (self.body)(&mut builder, value);
            LoopStep::Iterate(builder.build())
        } else {
            self.output.set(value);
            LoopStep::Exit(OperationNode::empty())
        }
    }
}
