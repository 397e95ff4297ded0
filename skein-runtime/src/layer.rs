//! # Layers
//!
//! A [`Layer`] is a recipe for building services into a [`Context`]. Building
//! is driven by a [`MemoMap`], which guarantees that a layer reachable from
//! several places in a dependency graph is built at most once per map:
//!
//! ```text
//!            app = left.merge(right)
//!              ┌──────┴──────┐
//!     left.provide(base)   right.provide(base)
//!              └──────┬──────┘
//!                   base          built once, shared
//! ```
//!
//! Each memoized layer gets a scope of its own. Consumers that observe the
//! layer register a release finalizer in their scope; the layer's scope is
//! closed when the last of them closes.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::context::{Context, Tag};
use crate::deferred::DeferredCell;
use crate::effect::{Effect, Never};
use crate::erased::Data;
use crate::exit::{Exit, ScopeExit};
use crate::scope::{ExecutionStrategy, Scope};

type Build<E> = Arc<dyn Fn(&MemoMap, &Scope) -> Effect<Context, E> + Send + Sync>;

static NEXT_LAYER_ID: AtomicU64 = AtomicU64::new(1);

fn next_layer_id() -> u64 {
    NEXT_LAYER_ID.fetch_add(1, Ordering::Relaxed)
}

/// A recipe for constructing services.
pub struct Layer<E = Never> {
    id: u64,
    build: Build<E>,
    memoize: bool,
}

impl<E> Clone for Layer<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            build: self.build.clone(),
            memoize: self.memoize,
        }
    }
}

impl<E> fmt::Debug for Layer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("id", &self.id)
            .field("memoize", &self.memoize)
            .finish()
    }
}

impl<E: Data> Layer<E> {
    fn from_build<F>(build: F) -> Self
    where
        F: Fn(&MemoMap, &Scope) -> Effect<Context, E> + Send + Sync + 'static,
    {
        Self {
            id: next_layer_id(),
            build: Arc::new(build),
            memoize: true,
        }
    }

    /// Identity used as the memoization key.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// A layer providing a ready-made service.
    pub fn succeed<S: Data>(tag: Tag<S>, service: S) -> Self {
        Self::context(Context::make(tag, service))
    }

    /// A layer providing every service in `context`.
    pub fn context(context: Context) -> Self {
        Self::from_build(move |_, _| Effect::succeed(context.clone()))
    }

    /// A layer providing nothing.
    pub fn empty() -> Self {
        Self::context(Context::empty())
    }

    /// A layer computing its service with a side effect.
    pub fn sync<S, F>(tag: Tag<S>, make: F) -> Self
    where
        S: Data,
        F: Fn() -> S + Send + Sync + 'static,
    {
        Self::effect(tag, Effect::sync(make))
    }

    /// A layer whose service is produced by an effect.
    pub fn effect<S: Data>(tag: Tag<S>, effect: Effect<S, E>) -> Self {
        Self::from_build(move |_, _| effect.clone().map(move |service| Context::make(tag, service)))
    }

    /// A layer whose service is acquired in the layer's own scope, so
    /// finalizers it registers run when the layer is released.
    pub fn scoped<S: Data>(tag: Tag<S>, effect: Effect<S, E>) -> Self {
        Self::from_build(move |_, scope| {
            scope
                .extend(effect.clone())
                .map(move |service| Context::make(tag, service))
        })
    }

    /// The same recipe, built again wherever it is used instead of being
    /// shared.
    pub fn fresh(self) -> Self {
        Self {
            id: next_layer_id(),
            build: self.build,
            memoize: false,
        }
    }

    /// Transform the layer's failure.
    pub fn map_error<E2, F>(self, f: F) -> Layer<E2>
    where
        E2: Data,
        F: Fn(E) -> E2 + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Layer::from_build(move |memo, scope| {
            let f = f.clone();
            memo.get_or_else_memoize(&self, scope)
                .map_error(move |error| f(error))
        })
    }

    /// Feed `dependency`'s services into this layer. The result provides
    /// only this layer's services.
    pub fn provide(self, dependency: Layer<E>) -> Self {
        Layer::from_build(move |memo, scope| {
            let (memo, scope, layer) = (memo.clone(), scope.clone(), self.clone());
            memo.get_or_else_memoize(&dependency, &scope)
                .flat_map(move |input| {
                    memo.get_or_else_memoize(&layer, &scope)
                        .provide_context(input)
                })
        })
    }

    /// Like [`Layer::provide`], but the result also provides
    /// `dependency`'s services.
    pub fn provide_merge(self, dependency: Layer<E>) -> Self {
        Layer::from_build(move |memo, scope| {
            let (memo, scope, layer) = (memo.clone(), scope.clone(), self.clone());
            memo.get_or_else_memoize(&dependency, &scope)
                .flat_map(move |input| {
                    let merged = input.clone();
                    memo.get_or_else_memoize(&layer, &scope)
                        .provide_context(input)
                        .map(move |output| merged.merge(&output))
                })
        })
    }

    /// Provide the services of both layers. On overlapping tags `other`
    /// wins.
    pub fn merge(self, other: Layer<E>) -> Self {
        Self::merge_all([self, other])
    }

    /// Provide the services of every layer. On overlapping tags later
    /// layers win.
    pub fn merge_all(layers: impl IntoIterator<Item = Layer<E>>) -> Self {
        let layers: Arc<Vec<Layer<E>>> = Arc::new(layers.into_iter().collect());
        Layer::from_build(move |memo, scope| {
            let (memo, scope) = (memo.clone(), scope.clone());
            Effect::for_each(layers.iter().cloned().collect::<Vec<_>>(), move |layer| {
                memo.get_or_else_memoize(&layer, &scope)
            })
            .map(|contexts| {
                contexts
                    .iter()
                    .fold(Context::empty(), |merged, context| merged.merge(context))
            })
        })
    }

    /// Build in the current scope with a fresh memo map.
    pub fn build(&self) -> Effect<Context, E> {
        let layer = self.clone();
        Effect::<Scope, E>::scope().flat_map(move |scope| layer.build_with_scope(&scope))
    }

    /// Build with a fresh memo map; resources are released when `scope`
    /// closes.
    pub fn build_with_scope(&self, scope: &Scope) -> Effect<Context, E> {
        let (layer, scope) = (self.clone(), scope.clone());
        Effect::suspend(move || layer.build_with_memo_map(&MemoMap::new(), &scope))
    }

    /// Build through an existing memo map, sharing any layer it has already
    /// built.
    pub fn build_with_memo_map(&self, memo: &MemoMap, scope: &Scope) -> Effect<Context, E> {
        memo.get_or_else_memoize(self, scope)
    }
}

impl<A: Data, E: Data> Effect<A, E> {
    /// Build `layer` in a fresh scope, run this effect with its services,
    /// then release the layer.
    pub fn provide_layer(self, layer: Layer<E>) -> Self {
        Effect::acquire_use_release(
            Scope::make(ExecutionStrategy::Sequential).widen::<E>(),
            move |scope| {
                let body = self.clone();
                layer
                    .build_with_scope(&scope)
                    .flat_map(move |context| body.clone().provide_context(context))
            },
            |scope, exit| scope.close(exit.to_scope_exit()).as_unit(),
        )
    }
}

// ============================================================================
// Memo map
// ============================================================================

#[derive(Clone)]
struct MemoEntry {
    built: Arc<DeferredCell>,
    observers: Arc<AtomicUsize>,
    scope: Scope,
}

impl MemoEntry {
    /// Finalizer for a consumer scope. The last consumer to close releases
    /// the layer.
    fn release(&self, layer_id: u64) -> impl Fn(&ScopeExit) -> Effect<(), Never> + Send + Sync {
        let entry = self.clone();
        move |exit: &ScopeExit| {
            let entry = entry.clone();
            let exit = exit.clone();
            Effect::suspend(move || {
                if entry.observers.fetch_sub(1, Ordering::SeqCst) == 1 {
                    debug!(layer_id, scope_id = entry.scope.id(), "releasing layer");
                    entry.scope.close(exit.clone()).as_unit()
                } else {
                    Effect::unit()
                }
            })
        }
    }
}

/// Per-build cache ensuring each layer is constructed at most once.
#[derive(Clone, Default)]
pub struct MemoMap {
    entries: Arc<Mutex<HashMap<u64, MemoEntry>>>,
}

impl fmt::Debug for MemoMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoMap")
            .field("layers", &self.entries.lock().len())
            .finish()
    }
}

impl MemoMap {
    /// An empty memo map.
    pub fn new() -> Self {
        Self::default()
    }

    /// An effect creating an empty memo map.
    pub fn make() -> Effect<MemoMap, Never> {
        Effect::sync(MemoMap::new)
    }

    /// Number of layers built or being built through this map.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True if nothing has been built through this map.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build `layer`, or wait for the build already started through this
    /// map, and register the release of the layer on `scope`.
    pub fn get_or_else_memoize<E: Data>(&self, layer: &Layer<E>, scope: &Scope) -> Effect<Context, E> {
        if !layer.memoize {
            return (layer.build)(self, scope);
        }
        let (memo, layer, scope) = (self.clone(), layer.clone(), scope.clone());
        Effect::suspend(move || {
            let (entry, first) = {
                let mut entries = memo.entries.lock();
                match entries.get(&layer.id) {
                    Some(entry) => (entry.clone(), false),
                    None => {
                        let entry = MemoEntry {
                            built: DeferredCell::new(),
                            observers: Arc::new(AtomicUsize::new(0)),
                            scope: Scope::new(ExecutionStrategy::Sequential),
                        };
                        entries.insert(layer.id, entry.clone());
                        (entry, true)
                    }
                }
            };
            if first {
                memo.build_entry(&layer, entry, &scope)
            } else {
                trace!(layer_id = layer.id, "layer already built");
                observe(entry, layer.id, &scope)
            }
        })
    }

    fn build_entry<E: Data>(&self, layer: &Layer<E>, entry: MemoEntry, consumer: &Scope) -> Effect<Context, E> {
        let (memo, layer, consumer) = (self.clone(), layer.clone(), consumer.clone());
        Effect::uninterruptible_mask(move |restore| {
            debug!(layer_id = layer.id, scope_id = entry.scope.id(), "building layer");
            let (entry, consumer, layer_id) = (entry.clone(), consumer.clone(), layer.id);
            restore
                .apply((layer.build)(&memo, &entry.scope))
                .exit()
                .widen::<E>()
                .flat_map(move |exit| {
                    entry.built.complete(exit.clone().erase());
                    match exit {
                        Exit::Success(context) => {
                            debug!(layer_id, services = context.len(), "layer built");
                            entry.observers.fetch_add(1, Ordering::SeqCst);
                            consumer
                                .add_finalizer(entry.release(layer_id))
                                .as_value(context)
                                .widen::<E>()
                        }
                        Exit::Failure(cause) => {
                            debug!(layer_id, "layer build failed");
                            entry
                                .scope
                                .close(Exit::<Context, E>::Failure(cause.clone()).to_scope_exit())
                                .widen::<E>()
                                .then(Effect::fail_cause(cause))
                        }
                    }
                })
        })
    }
}

/// Wait for a build started elsewhere and register as one more consumer.
fn observe<E: Data>(entry: MemoEntry, layer_id: u64, scope: &Scope) -> Effect<Context, E> {
    let scope = scope.clone();
    Effect::<Context, E>::from_prim(entry.built.wait()).flat_map(move |context| {
        entry.observers.fetch_add(1, Ordering::SeqCst);
        scope
            .add_finalizer(entry.release(layer_id))
            .as_value(context)
            .widen::<E>()
    })
}
