//! Handles on values that only exist once the operations computing them have been evaluated.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
};

/// Values that can flow through [`Deferred`] handles and step chains.
pub trait Value: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Value for T {}

/// A value that becomes available once the operations computing it have been evaluated.
///
/// A deferred value is either a set-once slot (filled in by the evaluator when the atomic
/// operation producing it finishes) or derived from other deferred values by a pure function.
/// Derivations of values that are already available are computed right away. All others are
/// computed on first successful resolution and cached afterwards, at which point they let go of
/// their sources.
///
/// Cloning a deferred value clones the handle, not the value.
pub struct Deferred<T>(Repr<T>);

enum Repr<T> {
    Slot(Arc<OnceLock<T>>),
    Derived(Arc<Derived<T>>),
}

struct Derived<T> {
    value: OnceLock<T>,
    /// `None` once the value is cached.
    inputs: Mutex<Option<Inputs<T>>>,
}

struct Inputs<T> {
    sources: Vec<Arc<dyn Source>>,
    compute: Box<dyn Fn() -> Option<T> + Send>,
}

/// The untyped view of a deferred value, used to walk derivations without recursion.
trait Source: Send + Sync {
    fn is_known(&self) -> bool;

    /// The sources of a derived value, `None` for slots.
    fn sources(&self) -> Option<Vec<Arc<dyn Source>>>;

    /// Computes and caches a derived value whose sources are all known.
    fn compute(&self);

    /// Drops the computation and hands out the sources it held on to.
    fn release(&self) -> Vec<Arc<dyn Source>>;
}

impl<T: Send + Sync> Source for OnceLock<T> {
    fn is_known(&self) -> bool {
        self.get().is_some()
    }

    fn sources(&self) -> Option<Vec<Arc<dyn Source>>> {
        None
    }

    fn compute(&self) {}

    fn release(&self) -> Vec<Arc<dyn Source>> {
        vec![]
    }
}

impl<T> Derived<T> {
    fn inputs(&self) -> MutexGuard<'_, Option<Inputs<T>>> {
        self.inputs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Send + Sync> Source for Derived<T> {
    fn is_known(&self) -> bool {
        self.value.get().is_some()
    }

    fn sources(&self) -> Option<Vec<Arc<dyn Source>>> {
        let inputs = self.inputs();
        Some(inputs.as_ref().map(|i| i.sources.clone()).unwrap_or_default())
    }

    fn compute(&self) {
        let mut inputs = self.inputs();
        if let Some(value) = inputs.as_ref().and_then(|i| (i.compute)()) {
            self.value.get_or_init(|| value);
            *inputs = None;
        }
    }

    fn release(&self) -> Vec<Arc<dyn Source>> {
        self.inputs().take().map(|i| i.sources).unwrap_or_default()
    }
}

impl<T> Drop for Derived<T> {
    // Unwinds long derivations iteratively instead of through nested destructors.
    fn drop(&mut self) {
        let inputs = self.inputs.get_mut().unwrap_or_else(PoisonError::into_inner);
        let Some(Inputs { sources, compute }) = inputs.take() else {
            return;
        };
        drop(compute);
        let mut sources = sources;
        while let Some(source) = sources.pop() {
            if Arc::strong_count(&source) == 1 {
                sources.extend(source.release());
            }
        }
    }
}

/// Computes every derived value `root` depends on, innermost first. Returns whether `root` is
/// known afterwards, which is not the case if it depends on a slot that is still empty.
fn settle(root: Arc<dyn Source>) -> bool {
    let mut stack = vec![(root, false)];
    while let Some((node, expanded)) = stack.pop() {
        if node.is_known() {
            continue;
        }
        if expanded {
            node.compute();
            if !node.is_known() {
                return false;
            }
            continue;
        }
        let Some(sources) = node.sources() else {
            return false;
        };
        stack.push((node, true));
        stack.extend(sources.into_iter().filter(|s| !s.is_known()).map(|s| (s, false)));
    }
    true
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        match &self.0 {
            Repr::Slot(slot) => Deferred(Repr::Slot(Arc::clone(slot))),
            Repr::Derived(derived) => Deferred(Repr::Derived(Arc::clone(derived))),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.known() {
            Some(value) => f.debug_tuple("Deferred").field(value).finish(),
            None => f.write_str("Deferred(<pending>)"),
        }
    }
}

impl<T> Deferred<T> {
    /// A deferred value that is available right away.
    pub fn ready(value: T) -> Self {
        Deferred(Repr::Slot(Arc::new(OnceLock::from(value))))
    }

    /// An empty slot, to be filled exactly once via [`Deferred::set`].
    pub(crate) fn pending() -> Self {
        Deferred(Repr::Slot(Arc::new(OnceLock::new())))
    }

    /// Fills the slot.
    ///
    /// # Panics
    ///
    /// Panics if the slot is already filled or if this is a derived value.
    pub(crate) fn set(&self, value: T) {
        let Repr::Slot(slot) = &self.0 else {
            panic!("derived deferred values cannot be set");
        };
        if slot.set(value).is_err() {
            panic!("deferred value set twice");
        }
    }

    /// The value if it is cached, without computing anything.
    fn known(&self) -> Option<&T> {
        match &self.0 {
            Repr::Slot(slot) => slot.get(),
            Repr::Derived(derived) => derived.value.get(),
        }
    }
}

impl<T: Value> Deferred<T> {
    /// Returns the value if it is already available.
    pub fn try_resolve(&self) -> Option<T> {
        if let Some(value) = self.known() {
            return Some(value.clone());
        }
        if settle(self.source()) {
            self.known().cloned()
        } else {
            None
        }
    }

    /// Returns the value.
    ///
    /// # Panics
    ///
    /// Panics if the operations computing the value have not been evaluated yet. Reading a value
    /// before the evaluator has drained its producers is a bug in the surrounding composition.
    pub fn resolve(&self) -> T {
        match self.try_resolve() {
            Some(value) => value,
            None => panic!("deferred value resolved before the operations computing it finished"),
        }
    }

    /// Whether the value is available.
    pub fn is_ready(&self) -> bool {
        self.known().is_some() || settle(self.source())
    }

    /// A deferred value computed from this one by `f`.
    pub fn map<U: Value>(&self, f: impl Fn(T) -> U + Send + Sync + 'static) -> Deferred<U> {
        if let Some(value) = self.known() {
            return Deferred::ready(f(value.clone()));
        }
        let source = self.clone();
        Deferred::derived(vec![self.source()], move || {
            source.known().map(|value| f(value.clone()))
        })
    }

    /// A deferred pair of this value and `other`.
    pub fn pair<U: Value>(&self, other: &Deferred<U>) -> Deferred<(T, U)> {
        if let (Some(left), Some(right)) = (self.known(), other.known()) {
            return Deferred::ready((left.clone(), right.clone()));
        }
        let (left, right) = (self.clone(), other.clone());
        Deferred::derived(vec![self.source(), other.source()], move || {
            Some((left.known()?.clone(), right.known()?.clone()))
        })
    }

    /// A deferred vector of all `items`, in order.
    pub fn collect(items: Vec<Deferred<T>>) -> Deferred<Vec<T>> {
        let known: Option<Vec<T>> = items.iter().map(|i| i.known().cloned()).collect();
        if let Some(values) = known {
            return Deferred::ready(values);
        }
        let sources = items.iter().map(Deferred::source).collect();
        Deferred::derived(sources, move || {
            items.iter().map(|i| i.known().cloned()).collect()
        })
    }

    fn derived(
        sources: Vec<Arc<dyn Source>>,
        compute: impl Fn() -> Option<T> + Send + 'static,
    ) -> Self {
        Deferred(Repr::Derived(Arc::new(Derived {
            value: OnceLock::new(),
            inputs: Mutex::new(Some(Inputs {
                sources,
                compute: Box::new(compute),
            })),
        })))
    }

    fn source(&self) -> Arc<dyn Source> {
        match &self.0 {
            Repr::Slot(slot) => Arc::clone(slot) as Arc<dyn Source>,
            Repr::Derived(derived) => Arc::clone(derived) as Arc<dyn Source>,
        }
    }
}

impl<T> From<T> for Deferred<T> {
    fn from(value: T) -> Self {
        Deferred::ready(value)
    }
}
