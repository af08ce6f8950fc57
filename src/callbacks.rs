// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Callback Registry
//!
//! Typed before/around/after hook chains wrapped around one event (`publish`,
//! `republish`, `rpc`).
//!
//! ## Execution order
//!
//! 1. every applicable `before` hook, in registration order
//! 2. the `around` hooks, first registered outermost, each handed a [`Next`]
//!    continuation wrapping the rest of the chain and finally the operation
//! 3. every applicable `after` hook, in registration order, with the result
//!
//! Every hook may carry a filter evaluated at call time; a filtered-out hook is
//! skipped without affecting the others. A failing hook aborts the remaining
//! chain and the operation.
//!
//! ## Example
//!
//! ```
//! use rabbitmq_publisher::{callbacks::Callbacks, message::MessageEnvelope};
//!
//! let mut callbacks: Callbacks<MessageEnvelope, ()> = Callbacks::new("publish");
//! callbacks
//!     .around(|_envelope, next| Box::pin(async move { next.run().await }))
//!     .unwrap()
//!     .after(|envelope, _| {
//!         println!("sent {} bytes", envelope.payload.len());
//!         Ok(())
//!     })
//!     .unwrap();
//! ```

use crate::errors::AmqpError;
use futures_util::future::BoxFuture;
use std::{fmt, sync::Arc};

/// The phases an event can define.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Before,
    Around,
    After,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Before => write!(f, "before"),
            Phase::Around => write!(f, "around"),
            Phase::After => write!(f, "after"),
        }
    }
}

const ALL_PHASES: [Phase; 3] = [Phase::Before, Phase::Around, Phase::After];

/// The rest of an around chain.
///
/// Calling [`Next::run`] executes the inner around hooks and then the guarded
/// operation. Dropping it without running means the operation does not happen.
pub struct Next<'a, T> {
    inner: Box<dyn FnOnce() -> BoxFuture<'a, Result<T, AmqpError>> + Send + 'a>,
}

impl<'a, T: 'a> Next<'a, T> {
    /// Wraps the rest of the chain.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() -> BoxFuture<'a, Result<T, AmqpError>> + Send + 'a,
    {
        Next { inner: Box::new(f) }
    }

    /// Runs the inner hooks and the operation.
    pub fn run(self) -> BoxFuture<'a, Result<T, AmqpError>> {
        (self.inner)()
    }
}

type Filter<A> = Arc<dyn Fn(&A) -> bool + Send + Sync>;
type BeforeFn<A> = Arc<dyn Fn(&A) -> Result<(), AmqpError> + Send + Sync>;
type AfterFn<A, T> = Arc<dyn Fn(&A, &T) -> Result<(), AmqpError> + Send + Sync>;
type AroundFn<A, T> = Arc<
    dyn for<'a> Fn(&'a A, Next<'a, T>) -> BoxFuture<'a, Result<T, AmqpError>> + Send + Sync,
>;

struct Gated<H, A> {
    hook: H,
    filter: Option<Filter<A>>,
}

impl<H: Clone, A> Clone for Gated<H, A> {
    fn clone(&self) -> Self {
        Gated {
            hook: self.hook.clone(),
            filter: self.filter.clone(),
        }
    }
}

impl<H, A> Gated<H, A> {
    fn applies(&self, args: &A) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(args))
    }
}

/// Hook chains of one event.
///
/// `A` is what every hook sees, `T` is the result of the guarded operation
/// handed to the `after` hooks.
pub struct Callbacks<A, T> {
    event: String,
    phases: Vec<Phase>,
    before: Vec<Gated<BeforeFn<A>, A>>,
    around: Vec<Gated<AroundFn<A, T>, A>>,
    after: Vec<Gated<AfterFn<A, T>, A>>,
}

impl<A, T> Callbacks<A, T>
where
    A: Send + Sync + 'static,
    T: Send + 'static,
{
    /// An event defining all three phases.
    pub fn new(event: impl Into<String>) -> Self {
        Self::with_phases(event, &ALL_PHASES)
    }

    /// An event defining only `phases`; registering a hook for any other phase
    /// fails.
    pub fn with_phases(event: impl Into<String>, phases: &[Phase]) -> Self {
        Callbacks {
            event: event.into(),
            phases: phases.to_vec(),
            before: Vec::new(),
            around: Vec::new(),
            after: Vec::new(),
        }
    }

    /// Name of the event these hooks belong to, e.g. `publish`.
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Whether no hook is registered in any phase.
    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.around.is_empty() && self.after.is_empty()
    }

    /// Registers a hook that runs before the operation.
    pub fn before<F>(&mut self, hook: F) -> Result<&mut Self, AmqpError>
    where
        F: Fn(&A) -> Result<(), AmqpError> + Send + Sync + 'static,
    {
        self.defines(Phase::Before)?;
        self.push_before(Arc::new(hook), None);
        Ok(self)
    }

    /// Registers a `before` hook that only runs when `filter` accepts the
    /// arguments.
    pub fn before_if<P, F>(&mut self, filter: P, hook: F) -> Result<&mut Self, AmqpError>
    where
        P: Fn(&A) -> bool + Send + Sync + 'static,
        F: Fn(&A) -> Result<(), AmqpError> + Send + Sync + 'static,
    {
        self.defines(Phase::Before)?;
        self.push_before(Arc::new(hook), Some(Arc::new(filter)));
        Ok(self)
    }

    /// Registers a hook wrapping the operation. The hook must run the given
    /// [`Next`] for the operation to happen.
    pub fn around<F>(&mut self, hook: F) -> Result<&mut Self, AmqpError>
    where
        F: for<'a> Fn(&'a A, Next<'a, T>) -> BoxFuture<'a, Result<T, AmqpError>>
            + Send
            + Sync
            + 'static,
    {
        self.defines(Phase::Around)?;
        self.push_around(Arc::new(hook), None);
        Ok(self)
    }

    /// Registers an `around` hook gated by `filter`. Rejected arguments go
    /// straight to the next hook.
    ///
    /// # Parameters
    /// * `filter` - Decides per call whether the hook applies
    /// * `hook` - Wraps the rest of the chain
    ///
    /// # Returns
    /// Self for method chaining, or `UndefinedCallbackPhase` when the event has
    /// no around phase
    pub fn around_if<P, F>(&mut self, filter: P, hook: F) -> Result<&mut Self, AmqpError>
    where
        P: Fn(&A) -> bool + Send + Sync + 'static,
        F: for<'a> Fn(&'a A, Next<'a, T>) -> BoxFuture<'a, Result<T, AmqpError>>
            + Send
            + Sync
            + 'static,
    {
        self.defines(Phase::Around)?;
        self.push_around(Arc::new(hook), Some(Arc::new(filter)));
        Ok(self)
    }

    /// Registers a hook that runs after the operation with its result.
    pub fn after<F>(&mut self, hook: F) -> Result<&mut Self, AmqpError>
    where
        F: Fn(&A, &T) -> Result<(), AmqpError> + Send + Sync + 'static,
    {
        self.defines(Phase::After)?;
        self.push_after(Arc::new(hook), None);
        Ok(self)
    }

    /// Registers an `after` hook that only runs when `filter` accepts the
    /// arguments.
    pub fn after_if<P, F>(&mut self, filter: P, hook: F) -> Result<&mut Self, AmqpError>
    where
        P: Fn(&A) -> bool + Send + Sync + 'static,
        F: Fn(&A, &T) -> Result<(), AmqpError> + Send + Sync + 'static,
    {
        self.defines(Phase::After)?;
        self.push_after(Arc::new(hook), Some(Arc::new(filter)));
        Ok(self)
    }

    /// Runs the applicable `before` hooks in order, stopping at the first error.
    pub fn run_before(&self, args: &A) -> Result<(), AmqpError> {
        self.before
            .iter()
            .filter(|gated| gated.applies(args))
            .try_for_each(|gated| (gated.hook)(args))
    }

    /// Runs `body` wrapped by the around hooks.
    pub fn run_around<'a, F>(&'a self, args: &'a A, body: F) -> BoxFuture<'a, Result<T, AmqpError>>
    where
        F: FnOnce() -> BoxFuture<'a, Result<T, AmqpError>> + Send + 'a,
    {
        self.around_from(0, args, Next::new(body))
    }

    /// Runs the applicable `after` hooks with the operation's result.
    pub fn run_after(&self, args: &A, result: &T) -> Result<(), AmqpError> {
        self.after
            .iter()
            .filter(|gated| gated.applies(args))
            .try_for_each(|gated| (gated.hook)(args, result))
    }

    /// Runs the whole chain around `body`.
    pub async fn run<'a, F>(&'a self, args: &'a A, body: F) -> Result<T, AmqpError>
    where
        F: FnOnce() -> BoxFuture<'a, Result<T, AmqpError>> + Send + 'a,
    {
        self.run_before(args)?;
        let result = self.run_around(args, body).await?;
        self.run_after(args, &result)?;
        Ok(result)
    }

    pub(crate) fn push_before(&mut self, hook: BeforeFn<A>, filter: Option<Filter<A>>) {
        self.before.push(Gated { hook, filter });
    }

    pub(crate) fn push_around(&mut self, hook: AroundFn<A, T>, filter: Option<Filter<A>>) {
        self.around.push(Gated { hook, filter });
    }

    pub(crate) fn push_after(&mut self, hook: AfterFn<A, T>, filter: Option<Filter<A>>) {
        self.after.push(Gated { hook, filter });
    }

    fn defines(&self, phase: Phase) -> Result<(), AmqpError> {
        if self.phases.contains(&phase) {
            Ok(())
        } else {
            Err(AmqpError::UndefinedCallbackPhase {
                event: self.event.clone(),
                phase: phase.to_string(),
            })
        }
    }

    fn around_from<'a>(
        &'a self,
        index: usize,
        args: &'a A,
        body: Next<'a, T>,
    ) -> BoxFuture<'a, Result<T, AmqpError>> {
        let found = self
            .around
            .iter()
            .enumerate()
            .skip(index)
            .find(|(_, gated)| gated.applies(args));

        match found {
            None => body.run(),
            Some((position, gated)) => {
                let next = Next::new(move || self.around_from(position + 1, args, body));
                (gated.hook)(args, next)
            }
        }
    }
}

impl<A, T> Clone for Callbacks<A, T> {
    fn clone(&self) -> Self {
        Callbacks {
            event: self.event.clone(),
            phases: self.phases.clone(),
            before: self.before.clone(),
            around: self.around.clone(),
            after: self.after.clone(),
        }
    }
}

impl<A, T> fmt::Debug for Callbacks<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("event", &self.event)
            .field("phases", &self.phases)
            .field("before", &self.before.len())
            .field("around", &self.around.len())
            .field("after", &self.after.len())
            .finish()
    }
}
