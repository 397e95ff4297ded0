//! # Effects
//!
//! An [`Effect<A, E>`] is an immutable description of a computation that
//! succeeds with an `A` or fails with a [`Cause<E>`]. Building an effect does
//! no work; a fiber interprets it (see [`crate::interpreter`]).
//!
//! Internally an effect is a tree of [`Primitive`] nodes over erased values.
//! The typed methods here only wrap user closures so that values are erased
//! on the way in and recovered on the way out.
//!
//! ## Interruption
//!
//! Fibers are interruptible by default. [`Effect::uninterruptible`] and
//! [`Effect::uninterruptible_mask`] open regions in which interruption is
//! deferred until the region ends. Finalizers installed by
//! [`Effect::on_exit`] and friends always run uninterruptibly.

use std::convert::Infallible;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cause::{Cause, Defect};
use crate::context::{Context, Reference, Tag};
use crate::erased::{erase, unerase, unit, AnyValue, Data};
use crate::exit::Exit;
use crate::fiber::{FiberId, FiberInner, FiberState, Resume};
use crate::interpreter::Frame;

/// Error type of effects that cannot fail.
pub type Never = Infallible;

pub(crate) type Prim = Arc<Primitive>;
pub(crate) type RawCause = Cause<AnyValue>;
pub(crate) type RawExit = Exit<AnyValue, AnyValue>;
pub(crate) type Cont = Arc<dyn Fn(AnyValue) -> Prim + Send + Sync>;
pub(crate) type Handler = Arc<dyn Fn(RawCause) -> Prim + Send + Sync>;
pub(crate) type FiberFn = Arc<dyn Fn(&mut FiberState, &Arc<FiberInner>) -> Prim + Send + Sync>;

/// Node kinds understood by the interpreter.
pub(crate) enum Primitive {
    /// A pure value.
    Succeed(AnyValue),
    /// A failure.
    Failure(RawCause),
    /// A synchronous side effect.
    Sync(Arc<dyn Fn() -> Result<AnyValue, RawCause> + Send + Sync>),
    /// Lazily construct the next node.
    Suspend(Arc<dyn Fn() -> Prim + Send + Sync>),
    /// Register a callback and suspend until it fires.
    ///
    /// The registration may return a canceler, run when the fiber is
    /// interrupted while waiting.
    Async(Arc<dyn Fn(Resume) -> Option<Prim> + Send + Sync>),
    /// Continue with a value.
    OnSuccess(Prim, Cont),
    /// Recover from a failure.
    OnFailure(Prim, Handler),
    /// Continue with either outcome.
    OnSuccessAndFailure(Prim, Handler, Cont),
    /// Read or update the running fiber.
    WithFiber(FiberFn),
    /// Run the body with the interruptible flag set to the given value.
    SetInterruptible(bool, Prim),
    /// Give up the current scheduler turn.
    Yield,
}

pub(crate) fn prim(primitive: Primitive) -> Prim {
    Arc::new(primitive)
}

pub(crate) fn succeed_raw(value: AnyValue) -> Prim {
    prim(Primitive::Succeed(value))
}

pub(crate) fn fail_raw(cause: RawCause) -> Prim {
    if cause.is_empty() {
        prim(Primitive::Failure(Cause::die_message("empty cause")))
    } else {
        prim(Primitive::Failure(cause))
    }
}

pub(crate) fn from_raw_exit(exit: RawExit) -> Prim {
    match exit {
        Exit::Success(value) => succeed_raw(value),
        Exit::Failure(cause) => fail_raw(cause),
    }
}

/// Retype a cause of an infallible effect.
pub fn absurd<E>(cause: Cause<Never>) -> Cause<E> {
    cause.map(|never| match never {})
}

/// An immutable description of a computation.
pub struct Effect<A, E = Never> {
    pub(crate) prim: Prim,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Effect<A, E> {
    fn clone(&self) -> Self {
        Self {
            prim: self.prim.clone(),
            _marker: PhantomData,
        }
    }
}

/// Restores the interruptibility that was in effect outside an
/// [`Effect::uninterruptible_mask`] region.
#[derive(Debug, Clone, Copy)]
pub struct Restore {
    interruptible: bool,
}

impl Restore {
    /// Run `effect` with the outer interruptibility.
    pub fn apply<A: Data, E: Data>(&self, effect: Effect<A, E>) -> Effect<A, E> {
        Effect::from_prim(prim(Primitive::SetInterruptible(
            self.interruptible,
            effect.prim,
        )))
    }
}

/// One-shot completion handle given to [`Effect::async_callback`].
///
/// Only the first completion is honored; later calls are ignored.
pub struct Callback<A, E> {
    resume: Resume,
    _marker: PhantomData<fn(A, E)>,
}

impl<A, E> Clone for Callback<A, E> {
    fn clone(&self) -> Self {
        Self {
            resume: self.resume.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A: Data, E: Data> Callback<A, E> {
    /// Resume the waiting fiber with a value.
    pub fn succeed(&self, value: A) {
        self.resume.resume(succeed_raw(erase(value)));
    }

    /// Resume the waiting fiber with a typed failure.
    pub fn fail(&self, error: E) {
        self.resume.resume(fail_raw(Cause::fail(error).erase()));
    }

    /// Resume the waiting fiber with a failure cause.
    pub fn fail_cause(&self, cause: Cause<E>) {
        self.resume.resume(fail_raw(cause.erase()));
    }

    /// Resume the waiting fiber with an exit.
    pub fn done(&self, exit: Exit<A, E>) {
        self.resume.resume(from_raw_exit(exit.erase()));
    }

    /// Resume the waiting fiber by running another effect.
    pub fn resume(&self, effect: Effect<A, E>) {
        self.resume.resume(effect.prim);
    }

    /// True once the callback has been used.
    pub fn is_completed(&self) -> bool {
        self.resume.is_used()
    }
}

/// Raw access to the running fiber.
pub(crate) fn with_fiber<A, E, F>(f: F) -> Effect<A, E>
where
    F: Fn(&mut FiberState, &Arc<FiberInner>) -> Effect<A, E> + Send + Sync + 'static,
{
    Effect::from_prim(prim(Primitive::WithFiber(Arc::new(
        move |state: &mut FiberState, fiber: &Arc<FiberInner>| f(state, fiber).prim,
    ))))
}

impl<A, E> Effect<A, E> {
    pub(crate) fn from_prim(prim: Prim) -> Self {
        Self {
            prim,
            _marker: PhantomData,
        }
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl<A: Data, E: Data> Effect<A, E> {
    /// An effect that succeeds with `value`.
    pub fn succeed(value: A) -> Self {
        Self::from_prim(succeed_raw(erase(value)))
    }

    /// An effect that fails with `error`.
    pub fn fail(error: E) -> Self {
        Self::fail_cause(Cause::fail(error))
    }

    /// An effect that fails with `cause`.
    pub fn fail_cause(cause: Cause<E>) -> Self {
        Self::from_prim(fail_raw(cause.erase()))
    }

    /// An effect that dies with `defect`.
    pub fn die(defect: Defect) -> Self {
        Self::fail_cause(Cause::die(defect))
    }

    /// An effect that dies with a message.
    pub fn die_message(message: impl Into<String>) -> Self {
        Self::fail_cause(Cause::die_message(message))
    }

    /// An effect that replays `exit`.
    pub fn from_exit(exit: Exit<A, E>) -> Self {
        Self::from_prim(from_raw_exit(exit.erase()))
    }

    /// An effect that succeeds or fails according to `result`.
    pub fn from_result(result: Result<A, E>) -> Self {
        Self::from_exit(result.into())
    }

    /// Run a synchronous side effect. A panic becomes a defect.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn() -> A + Send + Sync + 'static,
    {
        Self::from_prim(prim(Primitive::Sync(Arc::new(move || Ok(erase(f()))))))
    }

    /// Run a fallible synchronous side effect.
    pub fn try_sync<F>(f: F) -> Self
    where
        F: Fn() -> Result<A, E> + Send + Sync + 'static,
    {
        Self::from_prim(prim(Primitive::Sync(Arc::new(move || match f() {
            Ok(value) => Ok(erase(value)),
            Err(error) => Err(Cause::fail(error).erase()),
        }))))
    }

    /// Build the effect lazily, each time it runs.
    pub fn suspend<F>(f: F) -> Self
    where
        F: Fn() -> Effect<A, E> + Send + Sync + 'static,
    {
        Self::from_prim(prim(Primitive::Suspend(Arc::new(move || f().prim))))
    }

    /// Suspend until `register`'s callback is completed.
    pub fn async_callback<F>(register: F) -> Self
    where
        F: Fn(Callback<A, E>) + Send + Sync + 'static,
    {
        Self::async_interrupt(move |callback| {
            register(callback);
            None
        })
    }

    /// Suspend until `register`'s callback is completed. The returned
    /// canceler runs if the fiber is interrupted while waiting.
    pub fn async_interrupt<F>(register: F) -> Self
    where
        F: Fn(Callback<A, E>) -> Option<Effect<(), Never>> + Send + Sync + 'static,
    {
        Self::from_prim(prim(Primitive::Async(Arc::new(move |resume| {
            let callback = Callback {
                resume,
                _marker: PhantomData,
            };
            register(callback).map(|canceler| canceler.prim)
        }))))
    }

    /// An effect that never completes unless interrupted.
    pub fn never() -> Self {
        Self::from_prim(prim(Primitive::Async(Arc::new(|_resume| None))))
    }

    /// Fail with an interruption attributed to the running fiber.
    pub fn interrupt() -> Self {
        with_fiber(|_, fiber| Effect::fail_cause(Cause::interrupt(Some(fiber.id()))))
    }

    /// Run every effect in order, collecting the results.
    pub fn all(effects: impl IntoIterator<Item = Effect<A, E>>) -> Effect<Vec<A>, E> {
        let effects: Vec<_> = effects.into_iter().collect();
        Effect::for_each(effects, |effect| effect)
    }
}

fn for_each_step<T, B, E, F>(
    items: Arc<Vec<T>>,
    f: Arc<F>,
    index: usize,
    out: Arc<Mutex<Vec<B>>>,
) -> Effect<Vec<B>, E>
where
    T: Data,
    B: Data,
    E: Data,
    F: Fn(T) -> Effect<B, E> + Send + Sync + 'static,
{
    match items.get(index) {
        None => Effect::sync(move || std::mem::take(&mut *out.lock())),
        Some(item) => f(item.clone()).flat_map(move |value| {
            out.lock().push(value);
            for_each_step(items.clone(), f.clone(), index + 1, out.clone())
        }),
    }
}

impl<E: Data> Effect<(), E> {
    /// Apply `f` to every item in order, collecting the results.
    ///
    /// The first failure stops the traversal.
    pub fn for_each<T, B, F>(items: impl IntoIterator<Item = T>, f: F) -> Effect<Vec<B>, E>
    where
        T: Data,
        B: Data,
        F: Fn(T) -> Effect<B, E> + Send + Sync + 'static,
    {
        let items: Arc<Vec<T>> = Arc::new(items.into_iter().collect());
        let f = Arc::new(f);
        Effect::suspend(move || {
            let out = Arc::new(Mutex::new(Vec::with_capacity(items.len())));
            for_each_step(items.clone(), f.clone(), 0, out)
        })
    }

    /// The unit effect.
    pub fn unit() -> Self {
        Self::from_prim(succeed_raw(unit()))
    }

    /// Yield the scheduler turn to other fibers.
    pub fn yield_now() -> Self {
        Self::from_prim(prim(Primitive::Yield))
    }
}

impl<E: Data> Effect<FiberId, E> {
    /// The id of the running fiber.
    pub fn fiber_id() -> Self {
        with_fiber(|_, fiber| Effect::succeed(fiber.id()))
    }
}

impl<E: Data> Effect<Context, E> {
    /// The running fiber's context.
    pub fn context() -> Self {
        with_fiber(|state, _| Effect::succeed(state.context.clone()))
    }
}

// ============================================================================
// Services
// ============================================================================

impl<S: Data, E: Data> Effect<S, E> {
    /// Look up a service; a missing service is a defect.
    pub fn service(tag: Tag<S>) -> Self {
        with_fiber(move |state, _| match state.context.get(tag) {
            Some(service) => Effect::succeed(service),
            None => Effect::die_message(format!("service not found: {}", tag.key())),
        })
    }

    /// Look up a service or its reference default.
    pub fn service_or_default(reference: &'static Reference<S>) -> Self {
        with_fiber(move |state, _| Effect::succeed(state.context.get_or_default(reference)))
    }
}

impl<S: Data, E: Data> Effect<Option<S>, E> {
    /// Look up a service that may be absent.
    pub fn service_option(tag: Tag<S>) -> Self {
        with_fiber(move |state, _| Effect::succeed(state.context.get(tag)))
    }
}

// ============================================================================
// Combinators
// ============================================================================

impl<A: Data, E: Data> Effect<A, E> {
    /// Transform the success value.
    pub fn map<B, F>(self, f: F) -> Effect<B, E>
    where
        B: Data,
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        Effect::from_prim(prim(Primitive::OnSuccess(
            self.prim,
            Arc::new(move |value| succeed_raw(erase(f(unerase::<A>(value))))),
        )))
    }

    /// Replace the success value.
    pub fn as_value<B: Data>(self, value: B) -> Effect<B, E> {
        self.map(move |_| value.clone())
    }

    /// Discard the success value.
    pub fn as_unit(self) -> Effect<(), E> {
        self.map(|_| ())
    }

    /// Continue with another effect built from the success value.
    pub fn flat_map<B, F>(self, f: F) -> Effect<B, E>
    where
        B: Data,
        F: Fn(A) -> Effect<B, E> + Send + Sync + 'static,
    {
        Effect::from_prim(prim(Primitive::OnSuccess(
            self.prim,
            Arc::new(move |value| f(unerase::<A>(value)).prim),
        )))
    }

    /// Run `next` after this effect, keeping its value.
    pub fn then<B: Data>(self, next: Effect<B, E>) -> Effect<B, E> {
        self.flat_map(move |_| next.clone())
    }

    /// Run both effects in order, pairing the results.
    pub fn zip<B: Data>(self, other: Effect<B, E>) -> Effect<(A, B), E> {
        self.flat_map(move |a| other.clone().map(move |b| (a.clone(), b)))
    }

    /// Run a side effect on the success value, keeping the value.
    pub fn tap<X, F>(self, f: F) -> Self
    where
        X: Data,
        F: Fn(&A) -> Effect<X, E> + Send + Sync + 'static,
    {
        self.flat_map(move |a| f(&a).as_value(a))
    }

    /// Transform the typed error.
    pub fn map_error<E2, F>(self, f: F) -> Effect<A, E2>
    where
        E2: Data,
        F: Fn(E) -> E2 + Send + Sync + 'static,
    {
        Effect::from_prim(prim(Primitive::OnFailure(
            self.prim,
            Arc::new(move |cause| fail_raw(cause.unerase::<E>().map(&f).erase())),
        )))
    }

    /// Recover from a typed failure. Defects and interruptions pass through.
    pub fn catch_all<E2, F>(self, f: F) -> Effect<A, E2>
    where
        E2: Data,
        F: Fn(E) -> Effect<A, E2> + Send + Sync + 'static,
    {
        Effect::from_prim(prim(Primitive::OnFailure(
            self.prim,
            Arc::new(move |cause| match cause.unerase::<E>().failure_or_cause() {
                Ok(error) => f(error).prim,
                Err(rest) => fail_raw(rest.strip_failures::<E2>().erase()),
            }),
        )))
    }

    /// Recover from any failure.
    pub fn catch_all_cause<E2, F>(self, f: F) -> Effect<A, E2>
    where
        E2: Data,
        F: Fn(Cause<E>) -> Effect<A, E2> + Send + Sync + 'static,
    {
        Effect::from_prim(prim(Primitive::OnFailure(
            self.prim,
            Arc::new(move |cause| f(cause.unerase::<E>()).prim),
        )))
    }

    /// Continue with either outcome.
    pub fn match_cause_effect<B, E2, F, S>(self, on_failure: F, on_success: S) -> Effect<B, E2>
    where
        B: Data,
        E2: Data,
        F: Fn(Cause<E>) -> Effect<B, E2> + Send + Sync + 'static,
        S: Fn(A) -> Effect<B, E2> + Send + Sync + 'static,
    {
        Effect::from_prim(prim(Primitive::OnSuccessAndFailure(
            self.prim,
            Arc::new(move |cause| on_failure(cause.unerase::<E>()).prim),
            Arc::new(move |value| on_success(unerase::<A>(value)).prim),
        )))
    }

    /// Capture the outcome as a value.
    pub fn exit(self) -> Effect<Exit<A, E>, Never> {
        self.match_cause_effect(
            |cause| Effect::succeed(Exit::Failure(cause)),
            |value| Effect::succeed(Exit::Success(value)),
        )
    }

    /// Capture typed failures as `Err`. Defects and interruptions pass through.
    pub fn result(self) -> Effect<Result<A, E>, Never> {
        self.map(Ok).catch_all(|error| Effect::succeed(Err(error)))
    }

    /// Turn typed failures into defects.
    pub fn or_die(self) -> Effect<A, Never> {
        Effect::from_prim(prim(Primitive::OnFailure(
            self.prim,
            Arc::new(move |cause| {
                let cause: Cause<Never> = cause
                    .unerase::<E>()
                    .into_defects(|error| Defect::with_payload("unhandled typed failure", error));
                fail_raw(cause.erase())
            }),
        )))
    }

    /// Retry on typed failure, at most `times` more times.
    pub fn retry_n(self, times: usize) -> Self {
        let this = self.clone();
        self.catch_all(move |error| {
            if times == 0 {
                Effect::fail(error)
            } else {
                this.clone().retry_n(times - 1)
            }
        })
    }

    /// Retry on typed failure while `predicate` holds.
    pub fn retry_while<P>(self, predicate: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        let predicate: Arc<dyn Fn(&E) -> bool + Send + Sync> = Arc::new(predicate);
        retry_while_inner(self, predicate)
    }

    /// Run the effect, then repeat it `times` more times. Yields the last
    /// value; the first failure stops the repetition.
    pub fn repeat_n(self, times: usize) -> Self {
        let this = self.clone();
        self.flat_map(move |value| {
            if times == 0 {
                Effect::succeed(value)
            } else {
                this.clone().repeat_n(times - 1)
            }
        })
    }

    // ------------------------------------------------------------------------
    // Interruption
    // ------------------------------------------------------------------------

    /// Run with interruption deferred until the effect completes.
    pub fn uninterruptible(self) -> Self {
        Self::from_prim(prim(Primitive::SetInterruptible(false, self.prim)))
    }

    /// Run with interruption enabled, even inside an uninterruptible region.
    pub fn interruptible(self) -> Self {
        Self::from_prim(prim(Primitive::SetInterruptible(true, self.prim)))
    }

    /// Run `f` uninterruptibly, giving it a way to restore the outer
    /// interruptibility for selected sub-effects.
    pub fn uninterruptible_mask<F>(f: F) -> Self
    where
        F: Fn(Restore) -> Effect<A, E> + Send + Sync + 'static,
    {
        with_fiber(move |state, _| {
            let restore = Restore {
                interruptible: state.interruptible,
            };
            f(restore).uninterruptible()
        })
    }

    /// Run `cleanup` with the outcome once this effect finishes, however it
    /// finishes. The cleanup is uninterruptible; its failure is appended to
    /// the effect's cause.
    pub fn on_exit<F>(self, cleanup: F) -> Self
    where
        F: Fn(&Exit<A, E>) -> Effect<(), Never> + Send + Sync + 'static,
    {
        let cleanup = Arc::new(cleanup);
        Effect::uninterruptible_mask(move |restore| {
            let cleanup = cleanup.clone();
            restore
                .apply(self.clone())
                .exit()
                .widen::<E>()
                .flat_map(move |exit| {
                    cleanup(&exit)
                        .exit()
                        .widen::<E>()
                        .flat_map(move |finalized| match (exit.clone(), finalized) {
                            (exit, Exit::Success(())) => Effect::from_exit(exit),
                            (Exit::Success(_), Exit::Failure(cause)) => {
                                Effect::fail_cause(absurd(cause))
                            }
                            (Exit::Failure(first), Exit::Failure(then)) => {
                                Effect::fail_cause(first.sequential(absurd(then)))
                            }
                        })
                })
        })
    }

    /// Run `finalizer` after this effect, however it finishes.
    pub fn ensuring(self, finalizer: Effect<(), Never>) -> Self {
        self.on_exit(move |_| finalizer.clone())
    }

    /// Run `cleanup` only if the effect is interrupted.
    pub fn on_interrupt<F>(self, cleanup: F) -> Self
    where
        F: Fn(Vec<FiberId>) -> Effect<(), Never> + Send + Sync + 'static,
    {
        self.on_exit(move |exit| match exit {
            Exit::Failure(cause) if cause.is_interrupted_only() => cleanup(cause.interruptors()),
            _ => Effect::unit(),
        })
    }

    // ------------------------------------------------------------------------
    // Environment
    // ------------------------------------------------------------------------

    /// Run with the services in `context` added to the fiber's context.
    pub fn provide_context(self, context: Context) -> Self {
        let body = self.prim;
        Self::from_prim(prim(Primitive::WithFiber(Arc::new(
            move |state: &mut FiberState, _: &Arc<FiberInner>| {
                let previous = state.context.clone();
                state.context = previous.merge(&context);
                state.stack.push(Frame::RestoreContext(previous));
                body.clone()
            },
        ))))
    }

    /// Run with one service added to the fiber's context.
    pub fn provide_service<S: Data>(self, tag: Tag<S>, service: S) -> Self {
        self.provide_context(Context::make(tag, service))
    }

    /// Run inside a tracing span named `name`, nested under the fiber's
    /// current span.
    pub fn with_span(self, name: impl Into<String>) -> Self {
        let name: Arc<str> = Arc::from(name.into());
        let body = self.prim;
        Self::from_prim(prim(Primitive::WithFiber(Arc::new(
            move |state: &mut FiberState, fiber: &Arc<FiberInner>| {
                let previous = state.span.clone();
                let span = match &previous {
                    Some(parent) => tracing::debug_span!(
                        parent: parent,
                        "skein.span",
                        name = %name,
                        fiber_id = %fiber.id()
                    ),
                    None => tracing::debug_span!("skein.span", name = %name, fiber_id = %fiber.id()),
                };
                state.span = Some(span);
                state.stack.push(Frame::RestoreSpan(previous));
                body.clone()
            },
        ))))
    }
}

fn retry_while_inner<A: Data, E: Data>(
    effect: Effect<A, E>,
    predicate: Arc<dyn Fn(&E) -> bool + Send + Sync>,
) -> Effect<A, E> {
    let again = effect.clone();
    effect.catch_all(move |error| {
        if predicate(&error) {
            retry_while_inner(again.clone(), predicate.clone())
        } else {
            Effect::fail(error)
        }
    })
}

impl<A: Data> Effect<A, Never> {
    /// View an infallible effect as one with any error type.
    pub fn widen<E: Data>(self) -> Effect<A, E> {
        Effect::from_prim(self.prim)
    }
}
