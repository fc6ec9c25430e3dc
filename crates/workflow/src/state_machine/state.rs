//! State descriptors

use super::{Action, Event, Transition};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StateKind {
    Atomic,
    Compound(String),
    Final,
}

/// A state in the workflow state tree.
///
/// States are plain descriptors; targets and effect names are resolved when
/// the owning machine is built.
pub struct State<C> {
    pub(crate) kind: StateKind,
    pub(crate) children: Vec<(String, State<C>)>,
    pub(crate) on: Vec<(String, Transition<C>)>,
    pub(crate) entry: Vec<Action<C>>,
    pub(crate) exit: Vec<Action<C>>,
    pub(crate) invoke: Option<String>,
    pub(crate) on_done: Vec<Transition<C>>,
    pub(crate) on_error: Vec<Transition<C>>,
}

impl<C> State<C> {
    fn with_kind(kind: StateKind) -> Self {
        Self {
            kind,
            children: Vec::new(),
            on: Vec::new(),
            entry: Vec::new(),
            exit: Vec::new(),
            invoke: None,
            on_done: Vec::new(),
            on_error: Vec::new(),
        }
    }

    /// A leaf state
    pub fn atomic() -> Self {
        Self::with_kind(StateKind::Atomic)
    }

    /// A state with children, entering `initial` when entered itself
    pub fn compound(initial: impl Into<String>) -> Self {
        Self::with_kind(StateKind::Compound(initial.into()))
    }

    /// A top-level terminal state
    pub fn terminal() -> Self {
        Self::with_kind(StateKind::Final)
    }

    pub fn child(mut self, name: impl Into<String>, state: State<C>) -> Self {
        self.children.push((name.into(), state));
        self
    }

    /// Add a transition for `event`. Handlers for the same event are tried in order.
    pub fn on(mut self, event: impl Into<String>, transition: Transition<C>) -> Self {
        self.on.push((event.into(), transition));
        self
    }

    pub fn entry<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut C, &Event) + Send + Sync + 'static,
    {
        self.entry.push(Arc::new(f));
        self
    }

    pub fn exit<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut C, &Event) + Send + Sync + 'static,
    {
        self.exit.push(Arc::new(f));
        self
    }

    /// Bind a registered effect to this state
    pub fn invoke(mut self, effect: impl Into<String>) -> Self {
        self.invoke = Some(effect.into());
        self
    }

    pub fn on_done(mut self, transition: Transition<C>) -> Self {
        self.on_done.push(transition);
        self
    }

    pub fn on_error(mut self, transition: Transition<C>) -> Self {
        self.on_error.push(transition);
        self
    }

    pub fn is_final(&self) -> bool {
        self.kind == StateKind::Final
    }
}
