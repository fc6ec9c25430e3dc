//! Running instances of a machine

use super::{Event, INIT_EVENT, Machine, MachineContext, NodeKind, ROOT, Resolved, StateId, StatePath};
use crate::effect::Effect;
use crate::error::EffectError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Identifier of one activation of an invoked effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActivationId(u64);

impl ActivationId {
    pub(crate) fn detached() -> Self {
        ActivationId(u64::MAX)
    }
}

impl fmt::Display for ActivationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A committed state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub event: String,
    pub from: StatePath,
    pub to: StatePath,
    pub at: DateTime<Utc>,
}

/// Observable state of an instance
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot<C> {
    pub value: StatePath,
    pub context: C,
    pub done: bool,
    pub history: Vec<TransitionRecord>,
}

impl<C> Snapshot<C> {
    pub fn matches(&self, pattern: &str) -> bool {
        self.value.matches(pattern)
    }

    /// States entered so far, oldest first
    pub fn visited(&self) -> impl Iterator<Item = &StatePath> {
        self.history.iter().map(|record| &record.to)
    }
}

/// An effect that must be started because its state was entered
pub struct Activation<C: MachineContext> {
    pub id: ActivationId,
    pub state: StatePath,
    pub name: String,
    pub(crate) effect: Arc<dyn Effect<C>>,
    pub(crate) event: Event,
}

impl<C: MachineContext> fmt::Debug for Activation<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activation")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("name", &self.name)
            .finish()
    }
}

/// Result of processing one event
pub struct Step<C: MachineContext> {
    pub(crate) changed: bool,
    pub(crate) started: Vec<Activation<C>>,
    pub(crate) stopped: Vec<ActivationId>,
}

impl<C: MachineContext> Default for Step<C> {
    fn default() -> Self {
        Self {
            changed: false,
            started: Vec::new(),
            stopped: Vec::new(),
        }
    }
}

impl<C: MachineContext> Step<C> {
    /// Whether the state or context may have changed
    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn started(&self) -> &[Activation<C>] {
        &self.started
    }

    pub fn stopped(&self) -> &[ActivationId] {
        &self.stopped
    }
}

/// A running instantiation of a [`Machine`].
///
/// This is the synchronous core: it computes transitions and reports which
/// effects to start or cancel, but never runs them itself.
pub struct Instance<C: MachineContext> {
    machine: Arc<Machine<C>>,
    leaf: StateId,
    context: C,
    activations: Vec<(StateId, ActivationId)>,
    next_activation: u64,
    history: VecDeque<TransitionRecord>,
    done: bool,
}

impl<C: MachineContext> Instance<C> {
    /// Enter the initial configuration
    pub fn new(machine: Arc<Machine<C>>, context: C) -> (Self, Step<C>) {
        let mut instance = Self {
            machine,
            leaf: ROOT,
            context,
            activations: Vec::new(),
            next_activation: 0,
            history: VecDeque::new(),
            done: false,
        };
        let mut step = Step::default();
        let init = Event::new(INIT_EVENT);
        instance.enter(ROOT, ROOT, &init, &mut step);
        instance.record(&init, StatePath::root());
        step.changed = true;
        (instance, step)
    }

    pub fn machine(&self) -> &Arc<Machine<C>> {
        &self.machine
    }

    /// Current leaf state
    pub fn state(&self) -> &StatePath {
        &self.machine.node(self.leaf).path
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn is_active(&self, activation: ActivationId) -> bool {
        self.activations.iter().any(|(_, id)| *id == activation)
    }

    /// Activations whose states are still entered
    pub fn active_activations(&self) -> Vec<ActivationId> {
        self.activations.iter().map(|(_, id)| *id).collect()
    }

    pub fn history(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.history.iter()
    }

    pub fn snapshot(&self) -> Snapshot<C> {
        Snapshot {
            value: self.state().clone(),
            context: self.context.clone(),
            done: self.done,
            history: self.history.iter().cloned().collect(),
        }
    }

    /// Apply an event. Unknown events and events whose guards all fail are no-ops.
    pub fn send(&mut self, event: &Event) -> Step<C> {
        let mut step = Step::default();
        if self.done {
            trace!(event = %event.name, "Ignoring event for finished instance");
            return step;
        }

        let machine = Arc::clone(&self.machine);
        match machine.select(self.leaf, &self.context, event) {
            Some((source, resolved)) => self.apply(source, resolved, event, &mut step),
            None => trace!(event = %event.name, state = %self.state(), "No transition"),
        }
        step
    }

    /// Settle an activation with the outcome of its effect.
    ///
    /// Outcomes of activations whose state was already exited are discarded.
    pub fn resolve(
        &mut self,
        activation: ActivationId,
        outcome: Result<Value, EffectError>,
    ) -> Step<C> {
        let mut step = Step::default();
        let Some(position) = self.activations.iter().position(|(_, id)| *id == activation) else {
            debug!(%activation, "Discarding stale effect completion");
            return step;
        };
        if self.done {
            return step;
        }
        let (source, _) = self.activations.remove(position);

        let machine = Arc::clone(&self.machine);
        let node = machine.node(source);
        let (event, candidates) = match outcome {
            Ok(data) => (Event::done(&node.path, data), &node.on_done),
            Err(err) => {
                debug!(state = %node.path, error = %err, "Effect failed");
                (Event::failure(&node.path, &err), &node.on_error)
            }
        };

        if let Some(resolved) = candidates
            .iter()
            .find(|resolved| resolved.transition.allows(&self.context, &event))
        {
            self.apply(source, resolved, &event, &mut step);
        }
        step
    }

    /// Deliver an event emitted by a running effect
    pub fn deliver(&mut self, activation: ActivationId, event: Event) -> Step<C> {
        if !self.is_active(activation) {
            debug!(%activation, event = %event.name, "Discarding event from stale effect");
            return Step::default();
        }
        self.send(&event)
    }

    /// Cancel every live activation
    pub fn stop(&mut self) -> Step<C> {
        let mut step = Step::default();
        step.stopped = self.activations.drain(..).map(|(_, id)| id).collect();
        step
    }

    fn apply(&mut self, source: StateId, resolved: &Resolved<C>, event: &Event, step: &mut Step<C>) {
        step.changed = true;
        let Some(target) = resolved.target else {
            resolved.transition.run_actions(&mut self.context, event);
            return;
        };

        let from = self.state().clone();
        let domain = self.machine.domain(source, target);
        self.exit_until(domain, event, step);
        resolved.transition.run_actions(&mut self.context, event);
        self.enter(domain, target, event, step);
        debug!(event = %event.name, from = %from, to = %self.state(), "Transition");
        self.record(event, from);
    }

    fn exit_until(&mut self, domain: StateId, event: &Event, step: &mut Step<C>) {
        let machine = Arc::clone(&self.machine);
        for id in machine.ancestors(self.leaf) {
            if id == domain {
                break;
            }
            if let Some(position) = self.activations.iter().position(|(state, _)| *state == id) {
                let (_, activation) = self.activations.remove(position);
                step.stopped.push(activation);
            }
            for action in &machine.node(id).exit {
                action(&mut self.context, event);
            }
        }
    }

    fn enter(&mut self, domain: StateId, target: StateId, event: &Event, step: &mut Step<C>) {
        let machine = Arc::clone(&self.machine);
        let mut chain: Vec<StateId> = machine
            .ancestors(target)
            .into_iter()
            .take_while(|id| *id != domain)
            .collect();
        chain.reverse();
        for id in chain {
            self.enter_state(id, event, step);
        }

        let mut cursor = target;
        while let NodeKind::Compound { initial } = machine.node(cursor).kind {
            self.enter_state(initial, event, step);
            cursor = initial;
        }
        self.leaf = cursor;
        if machine.node(cursor).kind == NodeKind::Final {
            debug!(machine = %machine.id(), state = %machine.node(cursor).path, "Reached final state");
            self.done = true;
        }
    }

    fn enter_state(&mut self, id: StateId, event: &Event, step: &mut Step<C>) {
        let machine = Arc::clone(&self.machine);
        let node = machine.node(id);
        for action in &node.entry {
            action(&mut self.context, event);
        }
        if let Some(invoke) = &node.invoke {
            let activation = ActivationId(self.next_activation);
            self.next_activation += 1;
            self.activations.push((id, activation));
            step.started.push(Activation {
                id: activation,
                state: node.path.clone(),
                name: invoke.name.clone(),
                effect: Arc::clone(&invoke.effect),
                event: event.clone(),
            });
        }
    }

    fn record(&mut self, event: &Event, from: StatePath) {
        let limit = self.machine.history_limit();
        if limit == 0 {
            return;
        }
        self.history.push_back(TransitionRecord {
            event: event.name.clone(),
            from,
            to: self.state().clone(),
            at: Utc::now(),
        });
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::{EffectScope, effect_fn};
    use crate::state_machine::{State, Transition};
    use serde_json::json;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Counter {
        count: u32,
        log: Vec<String>,
    }

    fn machine() -> Arc<Machine<Counter>> {
        let machine = Machine::builder("counter")
            .initial("idle")
            .state(
                "idle",
                State::atomic()
                    .on("INC", Transition::internal().assign(|c: &mut Counter, _| c.count += 1))
                    .on("LOAD", Transition::to("loading")),
            )
            .state(
                "loading",
                State::atomic()
                    .entry(|c: &mut Counter, _| c.log.push("enter loading".into()))
                    .exit(|c: &mut Counter, _| c.log.push("exit loading".into()))
                    .invoke("load")
                    .on("CANCEL", Transition::to("idle"))
                    .on_done(Transition::to("loaded").assign(|c: &mut Counter, e| {
                        c.count = e.field("count").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                    }))
                    .on_error(Transition::to("failure")),
            )
            .state("loaded", State::atomic().on("FINISH", Transition::to("finished")))
            .state("failure", State::atomic().on("RETRY", Transition::to("loading")))
            .state("finished", State::terminal())
            .effect(
                "load",
                effect_fn(|_scope: EffectScope<Counter>| async { Ok(json!({ "count": 7 })) }),
            )
            .build()
            .unwrap();
        Arc::new(machine)
    }

    #[test]
    fn unmatched_event_is_a_noop() {
        let (mut instance, _) = Instance::new(machine(), Counter::default());
        let before = instance.snapshot();
        let step = instance.send(&Event::new("UNKNOWN"));
        assert!(!step.changed());
        assert_eq!(instance.state(), &before.value);
        assert_eq!(instance.context(), &before.context);
    }

    #[test]
    fn internal_transition_keeps_state() {
        let (mut instance, _) = Instance::new(machine(), Counter::default());
        instance.send(&Event::new("INC"));
        instance.send(&Event::new("INC"));
        assert_eq!(instance.state(), "idle");
        assert_eq!(instance.context().count, 2);
    }

    #[test]
    fn entering_invoking_state_starts_activation() {
        let (mut instance, initial) = Instance::new(machine(), Counter::default());
        assert!(initial.started().is_empty());

        let step = instance.send(&Event::new("LOAD"));
        assert_eq!(step.started().len(), 1);
        let activation = step.started()[0].id;
        assert_eq!(step.started()[0].name, "load");
        assert!(instance.is_active(activation));

        let step = instance.resolve(activation, Ok(json!({ "count": 3 })));
        assert!(step.changed());
        assert_eq!(instance.state(), "loaded");
        assert_eq!(instance.context().count, 3);
        assert_eq!(instance.context().log, vec!["enter loading", "exit loading"]);
    }

    #[test]
    fn stale_completion_is_discarded() {
        let (mut instance, _) = Instance::new(machine(), Counter::default());
        let activation = instance.send(&Event::new("LOAD")).started()[0].id;

        let step = instance.send(&Event::new("CANCEL"));
        assert_eq!(step.stopped(), &[activation]);
        assert_eq!(instance.state(), "idle");

        let before = instance.context().clone();
        let step = instance.resolve(activation, Ok(json!({ "count": 99 })));
        assert!(!step.changed());
        assert_eq!(instance.state(), "idle");
        assert_eq!(instance.context(), &before);

        let step = instance.deliver(activation, Event::new("LOAD"));
        assert!(!step.changed());
    }

    #[test]
    fn retry_restarts_effect_once() {
        let (mut instance, _) = Instance::new(machine(), Counter::default());
        let first = instance.send(&Event::new("LOAD")).started()[0].id;
        instance.resolve(first, Err(EffectError::failed("offline")));
        assert_eq!(instance.state(), "failure");

        let step = instance.send(&Event::new("RETRY"));
        assert_eq!(step.started().len(), 1);
        assert_ne!(step.started()[0].id, first);
        assert_eq!(instance.state(), "loading");
    }

    #[test]
    fn final_state_stops_processing() {
        let (mut instance, _) = Instance::new(machine(), Counter::default());
        let activation = instance.send(&Event::new("LOAD")).started()[0].id;
        instance.resolve(activation, Ok(json!({ "count": 1 })));
        instance.send(&Event::new("FINISH"));
        assert!(instance.is_done());
        assert!(instance.snapshot().done);

        let step = instance.send(&Event::new("INC"));
        assert!(!step.changed());
        assert_eq!(instance.state(), "finished");
    }

    #[test]
    fn history_is_bounded() {
        let machine = Machine::builder("ping")
            .initial("a")
            .state("a", State::atomic().on("FLIP", Transition::to("b")))
            .state("b", State::atomic().on("FLIP", Transition::to("a")))
            .history_limit(3)
            .build()
            .unwrap();
        let (mut instance, _) = Instance::new(Arc::new(machine), ());
        for _ in 0..10 {
            instance.send(&Event::new("FLIP"));
        }
        let history: Vec<_> = instance.history().collect();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].to, "a");
        assert_eq!(history[2].from, "b");
    }
}
