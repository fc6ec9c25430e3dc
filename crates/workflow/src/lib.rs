//! Hierarchical state machines with effect-driven transitions.
//!
//! A [`Machine`] is an immutable, validated definition. An [`Instance`] is
//! the synchronous core that applies events to it, and an [`Interpreter`]
//! drives an instance on the tokio runtime, running the effects its states
//! invoke.

pub mod effect;
pub mod engine;
pub mod error;
pub mod state_machine;

pub use effect::{Effect, EffectScope, Emitter, FnEffect, PollPolicy, effect_fn, poll_until};
pub use engine::{InstanceId, Interpreter, Subscription, create};
pub use error::{
    DefinitionError, DefinitionResult, EffectError, EffectResult, WorkflowError, WorkflowResult,
};
pub use state_machine::{
    ActivationId, Event, Instance, Machine, MachineBuilder, MachineContext, OutlineEntry, Snapshot,
    State, StatePath, Transition, TransitionRecord,
};
