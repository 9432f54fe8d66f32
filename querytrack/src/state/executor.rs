// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Listener and continuation dispatch
//!
//! Every listener notification and the transaction commit continuation run
//! on an [`Executor`] supplied by the embedding layer. Nothing in this
//! crate ever invokes a listener inline from a mutating call; that keeps
//! slow listeners off the hot mutation paths and rules out re-entrant
//! deadlocks.

use std::future::Future;
use std::pin::Pin;

/// A unit of work scheduled onto an executor
pub type BoxedTask = Box<dyn FnOnce() + Send + 'static>;

/// A future scheduled onto an executor
pub type BoxedFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Dispatch surface for listener notification and async continuations
///
/// Implementations must run tasks on a thread other than the caller's
/// current stack frame. Cross-task ordering is not guaranteed and callers
/// must not rely on it.
pub trait Executor: Send + Sync {
    /// Schedule a closure for execution
    fn execute(&self, task: BoxedTask);

    /// Schedule a future for execution
    fn spawn(&self, future: BoxedFuture);
}

/// Executor backed by a tokio runtime handle
pub struct TokioExecutor {
    handle: tokio::runtime::Handle,
}

impl TokioExecutor {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Bind to the runtime of the calling context
    ///
    /// Panics outside a tokio runtime, same as `Handle::current`.
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, task: BoxedTask) {
        self.handle.spawn(async move { task() });
    }

    fn spawn(&self, future: BoxedFuture) {
        self.handle.spawn(future);
    }
}
