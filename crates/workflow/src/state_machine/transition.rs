//! Transition logic for state machines

use super::Event;
use std::sync::Arc;

/// Synchronous context update run on entry, exit or while transitioning
pub type Action<C> = Arc<dyn Fn(&mut C, &Event) + Send + Sync>;

/// A transition to a target state, optionally guarded
pub struct Transition<C> {
    pub(crate) target: Option<String>,
    pub(crate) guard: Option<Guard<C>>,
    pub(crate) actions: Vec<Action<C>>,
}

impl<C> Transition<C> {
    /// Create a transition to `target`.
    ///
    /// `#a.b` is resolved from the machine root, anything else from the
    /// parent of the state declaring the transition.
    pub fn to(target: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            guard: None,
            actions: Vec::new(),
        }
    }

    /// A targetless transition: runs its actions without leaving the current state
    pub fn internal() -> Self {
        Self {
            target: None,
            guard: None,
            actions: Vec::new(),
        }
    }

    /// Add a guard condition to this transition
    pub fn with_guard(mut self, guard: Guard<C>) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Shorthand for [`Transition::with_guard`] from a closure
    pub fn when<F>(self, f: F) -> Self
    where
        F: Fn(&C, &Event) -> bool + Send + Sync + 'static,
    {
        self.with_guard(Guard::new(f))
    }

    /// Append an action updating the context
    pub fn assign<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut C, &Event) + Send + Sync + 'static,
    {
        self.actions.push(Arc::new(f));
        self
    }

    /// Get the raw target
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn is_guarded(&self) -> bool {
        self.guard.is_some()
    }

    /// Check if the guard passes for the given context and event
    pub fn allows(&self, ctx: &C, event: &Event) -> bool {
        match &self.guard {
            Some(guard) => guard.check(ctx, event),
            None => true,
        }
    }

    pub(crate) fn run_actions(&self, ctx: &mut C, event: &Event) {
        for action in &self.actions {
            action(ctx, event);
        }
    }
}

impl<C> Clone for Transition<C> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            guard: self.guard.clone(),
            actions: self.actions.clone(),
        }
    }
}

impl<C> std::fmt::Debug for Transition<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transition")
            .field("target", &self.target)
            .field("guarded", &self.guard.is_some())
            .field("actions", &self.actions.len())
            .finish()
    }
}

/// Guard condition for transitions
pub struct Guard<C> {
    check_fn: Arc<dyn Fn(&C, &Event) -> bool + Send + Sync>,
}

impl<C> Guard<C> {
    /// Create a new guard from a function
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&C, &Event) -> bool + Send + Sync + 'static,
    {
        Self {
            check_fn: Arc::new(f),
        }
    }

    /// Check if the guard passes for the given context
    pub fn check(&self, ctx: &C, event: &Event) -> bool {
        (self.check_fn)(ctx, event)
    }
}

impl<C> Clone for Guard<C> {
    fn clone(&self) -> Self {
        Self {
            check_fn: Arc::clone(&self.check_fn),
        }
    }
}

impl<C> std::fmt::Debug for Guard<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guard").finish()
    }
}
