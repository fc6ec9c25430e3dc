//! Side effects bound to states
//!
//! An effect starts when its state is entered and is told to stop, through
//! its cancellation token, when the state is exited. While running it may
//! emit any number of events; its final result becomes the state's
//! `done.invoke.*` or `error.invoke.*` event.

mod poll;

pub use poll::{PollPolicy, poll_until};

use crate::error::EffectResult;
use crate::state_machine::{ActivationId, Event};
use async_trait::async_trait;
use std::future::Future;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Asynchronous unit of work bound to entering a state
#[async_trait]
pub trait Effect<C>: Send + Sync {
    /// Run one activation of the effect
    async fn run(&self, scope: EffectScope<C>) -> EffectResult;
}

/// Messages processed by an interpreter mailbox
pub(crate) enum Signal {
    Dispatch(Event),
    Emit(ActivationId, Event),
    Settle(ActivationId, EffectResult),
    Stop,
}

#[derive(Clone)]
enum Sink {
    Interpreter(WeakUnboundedSender<Signal>),
    Channel(UnboundedSender<Event>),
}

/// Handle an effect uses to feed events back into its instance
#[derive(Clone)]
pub struct Emitter {
    activation: ActivationId,
    sink: Sink,
}

impl Emitter {
    pub(crate) fn new(activation: ActivationId, tx: WeakUnboundedSender<Signal>) -> Self {
        Self {
            activation,
            sink: Sink::Interpreter(tx),
        }
    }

    pub fn activation(&self) -> ActivationId {
        self.activation
    }

    /// Emit an event. Returns false once the instance is gone.
    pub fn emit(&self, event: impl Into<Event>) -> bool {
        let event = event.into();
        match &self.sink {
            Sink::Interpreter(tx) => match tx.upgrade() {
                Some(tx) => tx.send(Signal::Emit(self.activation, event)).is_ok(),
                None => false,
            },
            Sink::Channel(tx) => tx.send(event).is_ok(),
        }
    }
}

/// Everything an effect activation gets to work with
pub struct EffectScope<C> {
    /// Context at the moment the state was entered
    pub context: C,
    /// Event that caused the state to be entered
    pub event: Event,
    emitter: Emitter,
    cancel: CancellationToken,
}

impl<C> EffectScope<C> {
    pub(crate) fn new(context: C, event: Event, emitter: Emitter, cancel: CancellationToken) -> Self {
        Self {
            context,
            event,
            emitter,
            cancel,
        }
    }

    /// A scope outside any interpreter; emitted events land in the returned receiver.
    pub fn standalone(context: C) -> (Self, UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scope = Self {
            context,
            event: Event::new(crate::state_machine::INIT_EVENT),
            emitter: Emitter {
                activation: ActivationId::detached(),
                sink: Sink::Channel(tx),
            },
            cancel: CancellationToken::new(),
        };
        (scope, rx)
    }

    pub fn emit(&self, event: impl Into<Event>) -> bool {
        self.emitter.emit(event)
    }

    pub fn emitter(&self) -> Emitter {
        self.emitter.clone()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the owning state has been exited
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

/// Effect backed by an async closure
pub struct FnEffect<F>(F);

/// Wrap an async closure as an [`Effect`]
pub fn effect_fn<C, F, Fut>(f: F) -> FnEffect<F>
where
    F: Fn(EffectScope<C>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = EffectResult> + Send + 'static,
{
    FnEffect(f)
}

#[async_trait]
impl<C, F, Fut> Effect<C> for FnEffect<F>
where
    C: Send + 'static,
    F: Fn(EffectScope<C>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = EffectResult> + Send + 'static,
{
    async fn run(&self, scope: EffectScope<C>) -> EffectResult {
        (self.0)(scope).await
    }
}
