// Copyright 2025 Sprint Lens Contributors
// SPDX-License-Identifier: Apache-2.0

//! The context store: "which trace and span are active right now".
//!
//! Storage is resolved per caller. Inside a Tokio task the context lives in
//! a table keyed by the task's [`tokio::task::Id`], so a task that migrates
//! between workers keeps its state and two tasks sharing a worker never see
//! each other's state. Everywhere else (plain threads, `block_on`) each
//! thread owns a current [`Context`] slot.
//!
//! A future wrapped with [`FutureExt::with_context`] carries its own
//! `Context`: every time it is polled the carried context is swapped into the
//! caller's storage, and when the poll returns (or unwinds) the
//! possibly-modified context is swapped back out into the future and the
//! previous context is restored.
//!
//! Consequences:
//!
//! - state set inside a task or a wrapped future survives its suspension
//!   points, even when a multi-threaded runtime resumes it on another worker;
//! - tasks and wrapped futures never observe each other's state, even when
//!   they are interleaved on the same thread;
//! - a newly spawned task or thread starts empty unless the caller carries a
//!   snapshot over explicitly ([`FutureExt::in_current_context`],
//!   [`Context::attach`]).
//!
//! A task's table entry is dropped as soon as its context becomes empty.
//! Tasks that set state through [`set_current_trace`] or [`push_span`]
//! without a scope should [`clear`] it before they return.
//!
//! All reads return a safe default when nothing is active.

use crate::span::Span;
use crate::trace::Trace;
use once_cell::sync::Lazy;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::Poll;
use tokio::task;

thread_local! {
    static CURRENT: RefCell<Context> = RefCell::new(Context::default());
}

static TASKS: Lazy<Mutex<HashMap<task::Id, Context>>> = Lazy::new(Default::default);

fn tasks() -> MutexGuard<'static, HashMap<task::Id, Context>> {
    TASKS.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Where the caller's context is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Thread,
    Task(task::Id),
}

impl Slot {
    fn current() -> Self {
        task::try_id().map_or(Slot::Thread, Slot::Task)
    }

    fn read<R>(self, f: impl FnOnce(&Context) -> R) -> Option<R> {
        match self {
            Slot::Thread => CURRENT.try_with(|slot| f(&slot.borrow())).ok(),
            Slot::Task(id) => Some(match tasks().get(&id) {
                Some(cx) => f(cx),
                None => f(&Context::default()),
            }),
        }
    }

    // Callers must hand displaced values back out of `f` so they are
    // dropped after the slot is released.
    fn write<R>(self, f: impl FnOnce(&mut Context) -> R) -> Option<R> {
        match self {
            Slot::Thread => CURRENT.try_with(|slot| f(&mut slot.borrow_mut())).ok(),
            Slot::Task(id) => {
                let mut tasks = tasks();
                let cx = tasks.entry(id).or_default();
                let out = f(cx);
                if cx.is_empty() {
                    tasks.remove(&id);
                }
                Some(out)
            }
        }
    }
}

/// Snapshot of the active trace and span stack.
///
/// Cloning is cheap: traces and spans are reference-counted handles.
#[derive(Clone, Default)]
pub struct Context {
    trace: Option<Trace>,
    spans: Vec<Span>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("trace", &self.trace.as_ref().map(|t| t.id().to_string()))
            .field(
                "spans",
                &self.spans.iter().map(|s| s.id().to_string()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Context {
    /// An empty context: no trace, no spans.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trace(&self) -> Option<&Trace> {
        self.trace.as_ref()
    }

    /// Top of the span stack.
    pub fn span(&self) -> Option<&Span> {
        self.spans.last()
    }

    /// Active spans, outermost first.
    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    pub fn is_empty(&self) -> bool {
        self.trace.is_none() && self.spans.is_empty()
    }

    /// Copy of this context with a different current trace.
    pub fn with_trace(mut self, trace: Option<Trace>) -> Self {
        self.trace = trace;
        self
    }

    /// Copy of this context with `span` pushed on the stack.
    pub fn with_span(mut self, span: Span) -> Self {
        self.spans.push(span);
        self
    }

    /// Make this the current context of the calling thread (or task) until
    /// the returned guard is dropped.
    pub fn attach(self) -> ContextGuard {
        let slot = Slot::current();
        ContextGuard {
            previous: Some(replace_in(slot, self)),
            slot,
            _not_send: PhantomData,
        }
    }
}

/// Restores the previously current context when dropped.
///
/// Guards must be dropped in reverse order of creation on the thread that
/// created them, which the `!Send` marker enforces across threads.
#[must_use = "the context is detached as soon as the guard is dropped"]
pub struct ContextGuard {
    previous: Option<Context>,
    slot: Slot,
    _not_send: PhantomData<*const ()>,
}

impl fmt::Debug for ContextGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextGuard").finish_non_exhaustive()
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            let replaced = replace_in(self.slot, previous);
            drop(replaced);
        }
    }
}

/// Swap `cx` into `slot`, returning what was there.
fn replace_in(slot: Slot, cx: Context) -> Context {
    slot.write(|current| std::mem::replace(current, cx)).unwrap_or_default()
}

fn with_current<R>(f: impl FnOnce(&Context) -> R) -> Option<R> {
    Slot::current().read(f)
}

fn with_current_mut<R>(f: impl FnOnce(&mut Context) -> R) -> Option<R> {
    Slot::current().write(f)
}

/// Snapshot of the calling thread's (or task's) context.
pub fn current() -> Context {
    with_current(Context::clone).unwrap_or_default()
}

pub fn current_trace() -> Option<Trace> {
    with_current(|cx| cx.trace.clone()).flatten()
}

pub fn set_current_trace(trace: Option<Trace>) {
    let previous = with_current_mut(|cx| std::mem::replace(&mut cx.trace, trace));
    drop(previous);
}

/// The innermost active span, if any.
pub fn current_span() -> Option<Span> {
    with_current(|cx| cx.spans.last().cloned()).flatten()
}

pub fn push_span(span: Span) {
    with_current_mut(|cx| cx.spans.push(span));
}

/// Pop the innermost span. A no-op returning `None` on an empty stack.
pub fn pop_span() -> Option<Span> {
    with_current_mut(|cx| cx.spans.pop()).flatten()
}

/// Forget the current trace and every active span.
///
/// Meant for top-level teardown, e.g. before handing a pooled thread back.
pub fn clear() {
    let previous = with_current_mut(std::mem::take);
    drop(previous);
}

/// Future wrapper that runs the inner future inside a carried [`Context`].
#[must_use = "futures do nothing unless polled"]
pub struct WithContext<F> {
    inner: Pin<Box<F>>,
    cx: Option<Context>,
}

impl<F> fmt::Debug for WithContext<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WithContext").field("cx", &self.cx).finish()
    }
}

impl<F> WithContext<F> {
    pub fn new(inner: F, cx: Context) -> Self {
        Self {
            inner: Box::pin(inner),
            cx: Some(cx),
        }
    }
}

// Puts the carried context back into the future and restores the caller's
// previous context, also when the inner poll unwinds.
struct SwapBack<'a> {
    carried: &'a mut Option<Context>,
    outer: Option<Context>,
    slot: Slot,
}

impl Drop for SwapBack<'_> {
    fn drop(&mut self) {
        let outer = self.outer.take().unwrap_or_default();
        *self.carried = Some(replace_in(self.slot, outer));
    }
}

impl<F: Future> Future for WithContext<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, task: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let carried = this.cx.take().unwrap_or_default();
        let slot = Slot::current();
        let _swap = SwapBack {
            outer: Some(replace_in(slot, carried)),
            carried: &mut this.cx,
            slot,
        };
        this.inner.as_mut().poll(task)
    }
}

/// Context propagation for futures.
pub trait FutureExt: Future + Sized {
    /// Run this future inside `cx`.
    fn with_context(self, cx: Context) -> WithContext<Self> {
        WithContext::new(self, cx)
    }

    /// Run this future inside a snapshot of the caller's current context.
    ///
    /// Use this before `tokio::spawn` to continue the caller's trace in the
    /// spawned task.
    fn in_current_context(self) -> WithContext<Self> {
        WithContext::new(self, current())
    }
}

impl<F: Future> FutureExt for F {}
