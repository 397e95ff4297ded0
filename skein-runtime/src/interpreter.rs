//! # Effect Interpreter
//!
//! A trampoline that drives a [`Primitive`] tree on a fiber.
//!
//! Continuations live on an explicit frame stack owned by the fiber, so a
//! chain of a million `flat_map`s uses heap, not host stack. Each turn of the
//! loop:
//!
//! 1. checks for a pending interruption (unless the fiber is uninterruptible
//!    or already unwinding a failure)
//! 2. counts one op against the fairness budget, yielding when it is spent
//! 3. evaluates one node
//!
//! User closures run under [`catch_defect`]; a panic becomes a `Die` and
//! unwinds like any other failure.

use std::sync::Arc;

use tracing::Span;

use crate::cause::Cause;
use crate::context::Context;
use crate::effect::{fail_raw, prim, Cont, Handler, Prim, Primitive, RawCause, RawExit};
use crate::erased::{unit, AnyValue};
use crate::exit::Exit;
use crate::fiber::{FiberInner, FiberState, Resume, Suspension};
use crate::panic::catch_defect;

/// A pending continuation or a dynamically scoped setting to restore.
pub(crate) enum Frame {
    /// Continue with the success value.
    OnSuccess(Cont),
    /// Recover from a failure.
    OnFailure(Handler),
    /// Continue with either outcome.
    OnSuccessAndFailure(Handler, Cont),
    /// Leave an interruptibility region.
    RestoreInterruptible(bool),
    /// Leave a `provide_context` region.
    RestoreContext(Context),
    /// Leave a `with_span` region.
    RestoreSpan(Option<Span>),
}

/// Why the interpreter handed control back.
pub(crate) enum Step {
    /// The effect finished.
    Done(RawExit),
    /// Waiting on an async callback.
    Suspended,
    /// The fairness budget ran out or the effect yielded; continue with the
    /// contained node on a later turn.
    Yielded(Prim),
}

/// Run `current` on the fiber until it completes, suspends, or yields.
pub(crate) fn run_loop(state: &mut FiberState, fiber: &Arc<FiberInner>, mut current: Prim) -> Step {
    let max_ops = fiber.max_ops_before_yield();
    let mut entered = state.span.clone().map(Span::entered);

    loop {
        if state.interruptible
            && fiber.is_interrupt_requested()
            && !matches!(*current, Primitive::Failure(_))
        {
            current = fail_raw(fiber.interrupt_cause());
        }

        state.ops += 1;
        if state.ops > max_ops {
            state.ops = 0;
            return Step::Yielded(current);
        }

        let next = match &*current {
            Primitive::Succeed(value) => unwind_success(state, value.clone()),
            Primitive::Failure(cause) => unwind_failure(state, fiber, cause.clone()),
            Primitive::Sync(thunk) => match catch_defect(|| thunk()) {
                Ok(Ok(value)) => unwind_success(state, value),
                Ok(Err(cause)) => unwind_failure(state, fiber, cause),
                Err(defect) => unwind_failure(state, fiber, Cause::die(defect)),
            },
            Primitive::Suspend(make) => Ok(guard(|| make())),
            Primitive::Async(register) => {
                state.async_epoch += 1;
                let epoch = state.async_epoch;
                let resume = Resume::new(fiber.clone(), epoch);
                match catch_defect(|| register(resume)) {
                    Ok(canceler) => {
                        state.suspension = Some(Suspension { epoch, canceler });
                        return Step::Suspended;
                    }
                    Err(defect) => Ok(fail_raw(Cause::die(defect))),
                }
            }
            Primitive::OnSuccess(first, k) => {
                state.stack.push(Frame::OnSuccess(k.clone()));
                Ok(first.clone())
            }
            Primitive::OnFailure(first, h) => {
                state.stack.push(Frame::OnFailure(h.clone()));
                Ok(first.clone())
            }
            Primitive::OnSuccessAndFailure(first, h, k) => {
                state
                    .stack
                    .push(Frame::OnSuccessAndFailure(h.clone(), k.clone()));
                Ok(first.clone())
            }
            Primitive::WithFiber(f) => Ok(guard(|| f(state, fiber))),
            Primitive::SetInterruptible(flag, body) => {
                if *flag != state.interruptible {
                    state
                        .stack
                        .push(Frame::RestoreInterruptible(state.interruptible));
                    state.interruptible = *flag;
                }
                Ok(body.clone())
            }
            Primitive::Yield => {
                state.ops = 0;
                return Step::Yielded(prim(Primitive::Succeed(unit())));
            }
        };

        match next {
            Ok(node) => current = node,
            Err(exit) => return Step::Done(exit),
        }
        sync_span(state, &mut entered);
    }
}

/// Call a user closure that produces the next node.
fn guard(f: impl FnOnce() -> Prim) -> Prim {
    catch_defect(f).unwrap_or_else(|defect| fail_raw(Cause::die(defect)))
}

/// Pop frames until one accepts a value. An empty stack completes the
/// fiber.
fn unwind_success(state: &mut FiberState, value: AnyValue) -> Result<Prim, RawExit> {
    while let Some(frame) = state.stack.pop() {
        match frame {
            Frame::OnSuccess(k) | Frame::OnSuccessAndFailure(_, k) => {
                return Ok(guard(|| k(value)));
            }
            Frame::OnFailure(_) => {}
            frame => restore(state, frame),
        }
    }
    Err(Exit::Success(value))
}

/// Pop frames until one handles the failure. Handlers are skipped while
/// the fiber is interruptible and an interruption is pending.
fn unwind_failure(
    state: &mut FiberState,
    fiber: &Arc<FiberInner>,
    cause: RawCause,
) -> Result<Prim, RawExit> {
    while let Some(frame) = state.stack.pop() {
        match frame {
            Frame::OnFailure(h) | Frame::OnSuccessAndFailure(h, _) => {
                if state.interruptible && fiber.is_interrupt_requested() {
                    continue;
                }
                return Ok(guard(|| h(cause)));
            }
            Frame::OnSuccess(_) => {}
            frame => restore(state, frame),
        }
    }
    Err(Exit::Failure(cause))
}

fn restore(state: &mut FiberState, frame: Frame) {
    match frame {
        Frame::RestoreInterruptible(flag) => state.interruptible = flag,
        Frame::RestoreContext(context) => state.context = context,
        Frame::RestoreSpan(span) => state.span = span,
        Frame::OnSuccess(_) | Frame::OnFailure(_) | Frame::OnSuccessAndFailure(..) => {}
    }
}

/// Re-enter the fiber's span if a region changed it.
fn sync_span(state: &FiberState, entered: &mut Option<tracing::span::EnteredSpan>) {
    let current = entered.as_ref().and_then(|span| span.id());
    let wanted = state.span.as_ref().and_then(|span| span.id());
    if current != wanted {
        drop(entered.take());
        *entered = state.span.clone().map(Span::entered);
    }
}
