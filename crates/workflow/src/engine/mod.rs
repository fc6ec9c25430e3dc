//! Workflow engine implementation
//!
//! Every started instance is driven by its own task. User events, events
//! emitted by effects and effect completions share one mailbox, so they are
//! processed strictly one at a time in arrival order.

use crate::effect::{EffectScope, Emitter, Signal};
use crate::error::{WorkflowError, WorkflowResult};
use crate::state_machine::{
    Activation, ActivationId, Event, Instance, Machine, MachineBuilder, MachineContext, Snapshot,
    StatePath, Step,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span};
use uuid::Uuid;

/// Unique identifier of a running instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Build `definition` and start an instance with `context`
pub fn create<C: MachineContext>(
    definition: MachineBuilder<C>,
    context: C,
) -> WorkflowResult<Interpreter<C>> {
    let machine = definition.build()?;
    Ok(Interpreter::start(Arc::new(machine), context))
}

/// Handle to a running workflow instance.
///
/// Dropping the last handle stops the instance and cancels its effects.
pub struct Interpreter<C: MachineContext> {
    id: InstanceId,
    machine_id: String,
    tx: UnboundedSender<Signal>,
    snapshot: watch::Receiver<Snapshot<C>>,
}

impl<C: MachineContext> Interpreter<C> {
    /// Start an instance of `machine`. Must be called within a tokio runtime.
    pub fn start(machine: Arc<Machine<C>>, context: C) -> Self {
        let id = InstanceId::new();
        let machine_id = machine.id().to_string();
        let (instance, step) = Instance::new(machine, context);
        let (tx, rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(instance.snapshot());

        info!(instance = %id, machine = %machine_id, state = %instance.state(), "Started workflow instance");

        let runner = Runner {
            id,
            instance,
            rx,
            tx: tx.downgrade(),
            snapshot: snapshot_tx,
            tokens: HashMap::new(),
        };
        let span = info_span!("workflow", instance = %id, machine = %machine_id);
        tokio::spawn(runner.run(step).instrument(span));

        Self {
            id,
            machine_id,
            tx,
            snapshot: snapshot_rx,
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    /// Dispatch an event. Never blocks and never fails; events sent after the
    /// instance stopped are dropped.
    pub fn send(&self, event: impl Into<Event>) {
        let event = event.into();
        if self.tx.send(Signal::Dispatch(event)).is_err() {
            debug!(instance = %self.id, "Dropping event for stopped instance");
        }
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Snapshot<C> {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> StatePath {
        self.snapshot.borrow().value.clone()
    }

    /// Receiver notified on every published snapshot
    pub fn watch(&self) -> watch::Receiver<Snapshot<C>> {
        self.snapshot.clone()
    }

    /// Call `listener` with every snapshot published from now on
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Snapshot<C>) + Send + Sync + 'static,
    {
        let mut rx = self.snapshot.clone();
        rx.mark_unchanged();
        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let snapshot = rx.borrow_and_update().clone();
                listener(&snapshot);
            }
        });
        Subscription { handle }
    }

    /// Wait until a snapshot satisfies `predicate`
    pub async fn wait_for<F>(&self, mut predicate: F) -> WorkflowResult<Snapshot<C>>
    where
        F: FnMut(&Snapshot<C>) -> bool,
    {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(|snapshot| predicate(snapshot))
            .await
            .map_err(|_| WorkflowError::Stopped(self.id.to_string()))?
            .clone();
        Ok(snapshot)
    }

    /// Wait until the instance is in `pattern` or one of its descendants
    pub async fn wait_for_state(&self, pattern: &str) -> WorkflowResult<Snapshot<C>> {
        self.wait_for(|snapshot| snapshot.matches(pattern)).await
    }

    /// Stop the instance and cancel running effects
    pub fn stop(&self) {
        let _ = self.tx.send(Signal::Stop);
    }

    pub fn is_stopped(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Listener registration returned by [`Interpreter::subscribe`]; dropping it unsubscribes.
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct Runner<C: MachineContext> {
    id: InstanceId,
    instance: Instance<C>,
    rx: UnboundedReceiver<Signal>,
    tx: WeakUnboundedSender<Signal>,
    snapshot: watch::Sender<Snapshot<C>>,
    tokens: HashMap<ActivationId, CancellationToken>,
}

impl<C: MachineContext> Runner<C> {
    async fn run(mut self, initial: Step<C>) {
        self.apply(initial);

        while !self.instance.is_done() {
            let Some(signal) = self.rx.recv().await else {
                break;
            };
            let step = match signal {
                Signal::Dispatch(event) => {
                    debug!(event = %event.name, state = %self.instance.state(), "Dispatch");
                    self.instance.send(&event)
                }
                Signal::Emit(activation, event) => self.instance.deliver(activation, event),
                Signal::Settle(activation, outcome) => {
                    self.tokens.remove(&activation);
                    self.instance.resolve(activation, outcome)
                }
                Signal::Stop => break,
            };
            self.apply(step);
        }

        let step = self.instance.stop();
        self.apply(step);
        for (_, token) in self.tokens.drain() {
            token.cancel();
        }
        self.rx.close();
        info!(instance = %self.id, state = %self.instance.state(), done = self.instance.is_done(), "Workflow instance stopped");
    }

    fn apply(&mut self, step: Step<C>) {
        let Step {
            changed,
            started,
            stopped,
        } = step;

        for activation in stopped {
            if let Some(token) = self.tokens.remove(&activation) {
                debug!(%activation, "Cancelling effect");
                token.cancel();
            }
        }
        for activation in started {
            self.spawn(activation);
        }
        if changed {
            self.snapshot.send_replace(self.instance.snapshot());
        }
    }

    fn spawn(&mut self, activation: Activation<C>) {
        let Activation {
            id,
            state,
            name,
            effect,
            event,
        } = activation;

        let token = CancellationToken::new();
        self.tokens.insert(id, token.clone());
        let scope = EffectScope::new(
            self.instance.context().clone(),
            event,
            Emitter::new(id, self.tx.clone()),
            token,
        );
        let tx = self.tx.clone();
        let span = info_span!("effect", effect = %name, state = %state, activation = %id);

        tokio::spawn(
            async move {
                debug!("Effect started");
                let outcome = effect.run(scope).await;
                if let Some(tx) = tx.upgrade() {
                    let _ = tx.send(Signal::Settle(id, outcome));
                }
            }
            .instrument(span),
        );
    }
}
