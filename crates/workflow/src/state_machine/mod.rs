//! State machine implementation for workflows

mod event;
mod instance;
mod path;
mod state;
mod transition;

pub use event::{DONE_PREFIX, ERROR_PREFIX, Event, INIT_EVENT};
pub use instance::{Activation, ActivationId, Instance, Snapshot, Step, TransitionRecord};
pub use path::StatePath;
pub use state::State;
pub use transition::{Action, Guard, Transition};

use crate::effect::Effect;
use crate::error::{DefinitionError, DefinitionResult};
use state::StateKind;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Bounds every machine context satisfies
pub trait MachineContext: Clone + Send + Sync + 'static {}

impl<T> MachineContext for T where T: Clone + Send + Sync + 'static {}

const DEFAULT_HISTORY_LIMIT: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct StateId(usize);

pub(crate) const ROOT: StateId = StateId(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeKind {
    Atomic,
    Compound { initial: StateId },
    Final,
}

pub(crate) struct Resolved<C> {
    pub(crate) target: Option<StateId>,
    pub(crate) transition: Transition<C>,
}

pub(crate) struct Invoke<C: MachineContext> {
    pub(crate) name: String,
    pub(crate) effect: Arc<dyn Effect<C>>,
}

pub(crate) struct Node<C: MachineContext> {
    pub(crate) path: StatePath,
    pub(crate) parent: Option<StateId>,
    pub(crate) kind: NodeKind,
    pub(crate) children: Vec<StateId>,
    pub(crate) on: Vec<(String, Resolved<C>)>,
    pub(crate) entry: Vec<Action<C>>,
    pub(crate) exit: Vec<Action<C>>,
    pub(crate) invoke: Option<Invoke<C>>,
    pub(crate) on_done: Vec<Resolved<C>>,
    pub(crate) on_error: Vec<Resolved<C>>,
}

/// One line of a machine outline, used for describing definitions
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct OutlineEntry {
    pub path: StatePath,
    pub kind: &'static str,
    pub initial: Option<String>,
    pub invoke: Option<String>,
    pub events: Vec<String>,
}

/// Immutable, validated workflow definition
pub struct Machine<C: MachineContext> {
    id: String,
    nodes: Vec<Node<C>>,
    history_limit: usize,
}

impl<C: MachineContext> Machine<C> {
    /// Create a new builder for constructing a state machine
    pub fn builder(id: impl Into<String>) -> MachineBuilder<C> {
        MachineBuilder::new(id)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    /// Whether `path` names a state of this machine
    pub fn contains(&self, path: &StatePath) -> bool {
        self.nodes.iter().any(|node| &node.path == path)
    }

    /// Paths of every leaf state
    pub fn leaf_states(&self) -> Vec<StatePath> {
        self.nodes
            .iter()
            .skip(1)
            .filter(|node| !matches!(node.kind, NodeKind::Compound { .. }))
            .map(|node| node.path.clone())
            .collect()
    }

    /// Every event name handled anywhere in the machine
    pub fn events(&self) -> Vec<String> {
        let mut events: Vec<String> = self
            .nodes
            .iter()
            .flat_map(|node| node.on.iter().map(|(event, _)| event.clone()))
            .collect();
        events.sort();
        events.dedup();
        events
    }

    /// Depth-first outline of the state tree
    pub fn outline(&self) -> Vec<OutlineEntry> {
        let mut entries = Vec::new();
        let mut stack = vec![ROOT];
        while let Some(id) = stack.pop() {
            let node = self.node(id);
            if id != ROOT {
                let mut events: Vec<String> = node.on.iter().map(|(e, _)| e.clone()).collect();
                events.dedup();
                entries.push(OutlineEntry {
                    path: node.path.clone(),
                    kind: match node.kind {
                        NodeKind::Atomic => "atomic",
                        NodeKind::Compound { .. } => "compound",
                        NodeKind::Final => "final",
                    },
                    initial: match node.kind {
                        NodeKind::Compound { initial } => {
                            self.node(initial).path.leaf().map(str::to_string)
                        }
                        _ => None,
                    },
                    invoke: node.invoke.as_ref().map(|invoke| invoke.name.clone()),
                    events,
                });
            }
            stack.extend(node.children.iter().rev().copied());
        }
        entries
    }

    pub(crate) fn node(&self, id: StateId) -> &Node<C> {
        &self.nodes[id.0]
    }

    /// `id` followed by each of its ancestors up to and including the root
    pub(crate) fn ancestors(&self, id: StateId) -> Vec<StateId> {
        let mut chain = vec![id];
        let mut cursor = id;
        while let Some(parent) = self.node(cursor).parent {
            chain.push(parent);
            cursor = parent;
        }
        chain
    }

    /// Whether `id` equals `ancestor` or lies below it
    pub(crate) fn is_within(&self, id: StateId, ancestor: StateId) -> bool {
        self.ancestors(id).contains(&ancestor)
    }

    /// Deepest state left untouched by a transition from `source` to `target`
    pub(crate) fn domain(&self, source: StateId, target: StateId) -> StateId {
        if source == ROOT {
            return ROOT;
        }
        self.ancestors(source)
            .into_iter()
            .skip(1)
            .find(|candidate| *candidate != target && self.is_within(target, *candidate))
            .unwrap_or(ROOT)
    }

    /// First enabled transition for `event`, searching from `leaf` towards the root
    pub(crate) fn select(
        &self,
        leaf: StateId,
        ctx: &C,
        event: &Event,
    ) -> Option<(StateId, &Resolved<C>)> {
        self.ancestors(leaf).into_iter().find_map(|id| {
            self.node(id)
                .on
                .iter()
                .find(|(name, resolved)| {
                    *name == event.name && resolved.transition.allows(ctx, event)
                })
                .map(|(_, resolved)| (id, resolved))
        })
    }
}

impl<C: MachineContext> std::fmt::Debug for Machine<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("id", &self.id)
            .field("states", &self.nodes.len())
            .finish()
    }
}

/// Builder for [`Machine`]
pub struct MachineBuilder<C: MachineContext> {
    id: String,
    initial: Option<String>,
    states: Vec<(String, State<C>)>,
    on: Vec<(String, Transition<C>)>,
    effects: HashMap<String, Arc<dyn Effect<C>>>,
    history_limit: usize,
}

impl<C: MachineContext> MachineBuilder<C> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            initial: None,
            states: Vec::new(),
            on: Vec::new(),
            effects: HashMap::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn initial(mut self, state: impl Into<String>) -> Self {
        self.initial = Some(state.into());
        self
    }

    /// Add a top-level state
    pub fn state(mut self, name: impl Into<String>, state: State<C>) -> Self {
        self.states.push((name.into(), state));
        self
    }

    /// Add a machine-level transition, available from every state
    pub fn on(mut self, event: impl Into<String>, transition: Transition<C>) -> Self {
        self.on.push((event.into(), transition));
        self
    }

    /// Register an effect that states may bind with [`State::invoke`]
    pub fn effect<E>(mut self, name: impl Into<String>, effect: E) -> Self
    where
        E: Effect<C> + 'static,
    {
        self.effects.insert(name.into(), Arc::new(effect));
        self
    }

    pub fn history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Validate the definition and resolve every target and effect
    pub fn build(self) -> DefinitionResult<Machine<C>> {
        let MachineBuilder {
            id,
            initial,
            states,
            on,
            effects,
            history_limit,
        } = self;

        if states.is_empty() {
            return Err(DefinitionError::Empty(id));
        }
        let initial = initial.ok_or_else(|| DefinitionError::MissingInitial { state: id.clone() })?;

        let mut root = State::compound(initial);
        root.children = states;
        root.on = on;

        let mut nodes = Vec::new();
        let mut pending = Vec::new();
        flatten(&mut nodes, &mut pending, None, StatePath::root(), root)?;

        for (index, unresolved) in pending.into_iter().enumerate() {
            let source = StateId(index);
            let path = nodes[index].path.to_string();

            check_handlers(&path, &unresolved.on)?;
            check_ordered(&path, "done", &unresolved.on_done)?;
            check_ordered(&path, "error", &unresolved.on_error)?;

            let mut on = Vec::with_capacity(unresolved.on.len());
            for (event, transition) in unresolved.on {
                let target = resolve_target(&nodes, &id, source, transition.target())?;
                on.push((event, Resolved { target, transition }));
            }
            let on_done = resolve_all(&nodes, &id, source, unresolved.on_done)?;
            let on_error = resolve_all(&nodes, &id, source, unresolved.on_error)?;

            let invoke = match unresolved.invoke {
                Some(name) => {
                    let effect = effects.get(&name).cloned().ok_or_else(|| {
                        DefinitionError::MissingEffect {
                            state: path.clone(),
                            effect: name.clone(),
                        }
                    })?;
                    if on_error.is_empty() {
                        return Err(DefinitionError::MissingErrorHandler { state: path });
                    }
                    Some(Invoke { name, effect })
                }
                None if !on_done.is_empty() || !on_error.is_empty() => {
                    return Err(DefinitionError::OrphanCompletion { state: path });
                }
                None => None,
            };

            let node = &mut nodes[index];
            node.on = on;
            node.on_done = on_done;
            node.on_error = on_error;
            node.invoke = invoke;
        }

        check_reachable(&nodes)?;

        tracing::debug!(machine = %id, states = nodes.len() - 1, "Built workflow definition");
        Ok(Machine {
            id,
            nodes,
            history_limit,
        })
    }
}

struct Unresolved<C> {
    on: Vec<(String, Transition<C>)>,
    invoke: Option<String>,
    on_done: Vec<Transition<C>>,
    on_error: Vec<Transition<C>>,
}

fn flatten<C: MachineContext>(
    nodes: &mut Vec<Node<C>>,
    pending: &mut Vec<Unresolved<C>>,
    parent: Option<StateId>,
    path: StatePath,
    state: State<C>,
) -> DefinitionResult<StateId> {
    let id = StateId(nodes.len());
    let State {
        kind,
        children,
        on,
        entry,
        exit,
        invoke,
        on_done,
        on_error,
    } = state;

    if kind == StateKind::Final
        && (parent != Some(ROOT) || !children.is_empty() || !on.is_empty() || invoke.is_some())
    {
        return Err(DefinitionError::InvalidFinal {
            state: path.to_string(),
        });
    }
    if kind == StateKind::Atomic && !children.is_empty() {
        return Err(DefinitionError::MissingInitial {
            state: path.to_string(),
        });
    }

    nodes.push(Node {
        path: path.clone(),
        parent,
        kind: NodeKind::Atomic,
        children: Vec::new(),
        on: Vec::new(),
        entry,
        exit,
        invoke: None,
        on_done: Vec::new(),
        on_error: Vec::new(),
    });
    pending.push(Unresolved {
        on,
        invoke,
        on_done,
        on_error,
    });

    let mut seen = HashSet::new();
    for (name, child) in children {
        if name.is_empty() || name.contains('.') || name.starts_with('#') {
            return Err(DefinitionError::InvalidName { name });
        }
        if !seen.insert(name.clone()) {
            return Err(DefinitionError::DuplicateState {
                path: path.child(&name).to_string(),
            });
        }
        let child_id = flatten(nodes, pending, Some(id), path.child(&name), child)?;
        nodes[id.0].children.push(child_id);
    }

    nodes[id.0].kind = match kind {
        StateKind::Atomic => NodeKind::Atomic,
        StateKind::Final => NodeKind::Final,
        StateKind::Compound(initial) => {
            let initial_id = nodes[id.0]
                .children
                .iter()
                .copied()
                .find(|child| nodes[child.0].path.leaf() == Some(initial.as_str()))
                .ok_or_else(|| DefinitionError::UnknownInitial {
                    state: path.to_string(),
                    initial,
                })?;
            NodeKind::Compound {
                initial: initial_id,
            }
        }
    };

    Ok(id)
}

fn resolve_target<C: MachineContext>(
    nodes: &[Node<C>],
    machine_id: &str,
    source: StateId,
    target: Option<&str>,
) -> DefinitionResult<Option<StateId>> {
    let Some(raw) = target else {
        return Ok(None);
    };
    let unknown = || DefinitionError::UnknownTarget {
        state: nodes[source.0].path.to_string(),
        target: raw.to_string(),
    };

    let (mut cursor, relative) = match raw.strip_prefix('#') {
        Some(absolute) => {
            let without_id = absolute
                .strip_prefix(machine_id)
                .and_then(|rest| {
                    if rest.is_empty() {
                        Some(rest)
                    } else {
                        rest.strip_prefix('.')
                    }
                })
                .unwrap_or(absolute);
            (ROOT, without_id)
        }
        None => (nodes[source.0].parent.unwrap_or(ROOT), raw),
    };

    if relative.is_empty() {
        return Err(unknown());
    }
    for segment in relative.split('.') {
        cursor = nodes[cursor.0]
            .children
            .iter()
            .copied()
            .find(|child| nodes[child.0].path.leaf() == Some(segment))
            .ok_or_else(unknown)?;
    }
    Ok(Some(cursor))
}

fn resolve_all<C: MachineContext>(
    nodes: &[Node<C>],
    machine_id: &str,
    source: StateId,
    transitions: Vec<Transition<C>>,
) -> DefinitionResult<Vec<Resolved<C>>> {
    transitions
        .into_iter()
        .map(|transition| {
            let target = resolve_target(nodes, machine_id, source, transition.target())?;
            Ok(Resolved { target, transition })
        })
        .collect()
}

fn check_handlers<C>(state: &str, on: &[(String, Transition<C>)]) -> DefinitionResult<()> {
    for (index, (event, transition)) in on.iter().enumerate() {
        let shadows = on[index + 1..].iter().any(|(other, _)| other == event);
        if shadows && !transition.is_guarded() {
            return Err(DefinitionError::DuplicateHandler {
                state: state.to_string(),
                event: event.clone(),
            });
        }
    }
    Ok(())
}

fn check_ordered<C>(state: &str, label: &str, transitions: &[Transition<C>]) -> DefinitionResult<()> {
    let count = transitions.len();
    if transitions.iter().take(count.saturating_sub(1)).any(|t| !t.is_guarded()) {
        return Err(DefinitionError::DuplicateHandler {
            state: state.to_string(),
            event: label.to_string(),
        });
    }
    Ok(())
}

fn check_reachable<C: MachineContext>(nodes: &[Node<C>]) -> DefinitionResult<()> {
    let mut reachable = vec![false; nodes.len()];
    let mut queue = vec![ROOT];
    reachable[ROOT.0] = true;

    let mark = |id: StateId, reachable: &mut Vec<bool>, queue: &mut Vec<StateId>| {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if !reachable[current.0] {
                reachable[current.0] = true;
                queue.push(current);
            }
            cursor = nodes[current.0].parent;
        }
    };

    while let Some(id) = queue.pop() {
        let node = &nodes[id.0];
        if let NodeKind::Compound { initial } = node.kind {
            mark(initial, &mut reachable, &mut queue);
        }
        let targets = node
            .on
            .iter()
            .map(|(_, resolved)| resolved)
            .chain(node.on_done.iter())
            .chain(node.on_error.iter())
            .filter_map(|resolved| resolved.target);
        for target in targets {
            mark(target, &mut reachable, &mut queue);
        }
    }

    match reachable.iter().position(|seen| !seen) {
        Some(index) => Err(DefinitionError::Unreachable {
            state: nodes[index].path.to_string(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default)]
    struct Ctx;

    fn noop_effect() -> impl Effect<Ctx> {
        crate::effect::effect_fn(|_scope: crate::effect::EffectScope<Ctx>| async {
            Ok(serde_json::Value::Null)
        })
    }

    #[test]
    fn builds_nested_machine() {
        let machine = Machine::<Ctx>::builder("wizard")
            .initial("keywords")
            .state(
                "keywords",
                State::compound("loading")
                    .child("loading", State::atomic().on("LOADED", Transition::to("loaded")))
                    .child("loaded", State::atomic())
                    .on("NEXT", Transition::to("images")),
            )
            .state("images", State::atomic().on("PREV", Transition::to("#wizard.keywords.loaded")))
            .build()
            .unwrap();

        assert_eq!(machine.id(), "wizard");
        let leaves: Vec<String> = machine.leaf_states().iter().map(|p| p.to_string()).collect();
        assert_eq!(leaves, vec!["keywords.loading", "keywords.loaded", "images"]);
        assert_eq!(machine.events(), vec!["LOADED", "NEXT", "PREV"]);

        let outline = machine.outline();
        assert_eq!(outline[0].path, "keywords");
        assert_eq!(outline[0].initial.as_deref(), Some("loading"));
        assert_eq!(outline.len(), 4);
    }

    #[test]
    fn rejects_unknown_target() {
        let err = Machine::<Ctx>::builder("m")
            .initial("a")
            .state("a", State::atomic().on("GO", Transition::to("nowhere")))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            DefinitionError::UnknownTarget {
                state: "a".to_string(),
                target: "nowhere".to_string()
            }
        );
    }

    #[test]
    fn rejects_unknown_initial() {
        let err = Machine::<Ctx>::builder("m")
            .initial("missing")
            .state("a", State::atomic())
            .build()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::UnknownInitial { .. }));
    }

    #[test]
    fn rejects_unreachable_state() {
        let err = Machine::<Ctx>::builder("m")
            .initial("a")
            .state("a", State::atomic())
            .state("island", State::atomic())
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            DefinitionError::Unreachable {
                state: "island".to_string()
            }
        );
    }

    #[test]
    fn rejects_shadowing_handlers() {
        let err = Machine::<Ctx>::builder("m")
            .initial("a")
            .state(
                "a",
                State::atomic()
                    .on("GO", Transition::to("b"))
                    .on("GO", Transition::to("a")),
            )
            .state("b", State::atomic())
            .build()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::DuplicateHandler { .. }));

        Machine::<Ctx>::builder("m")
            .initial("a")
            .state(
                "a",
                State::atomic()
                    .on("GO", Transition::to("b").when(|_, _| false))
                    .on("GO", Transition::to("a")),
            )
            .state("b", State::atomic())
            .build()
            .unwrap();
    }

    #[test]
    fn rejects_missing_effect_and_error_handler() {
        let err = Machine::<Ctx>::builder("m")
            .initial("a")
            .state(
                "a",
                State::atomic()
                    .invoke("load")
                    .on_error(Transition::to("a")),
            )
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            DefinitionError::MissingEffect {
                state: "a".to_string(),
                effect: "load".to_string()
            }
        );

        let err = Machine::<Ctx>::builder("m")
            .initial("a")
            .state("a", State::atomic().invoke("load"))
            .effect("load", noop_effect())
            .build()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::MissingErrorHandler { .. }));

        let err = Machine::<Ctx>::builder("m")
            .initial("a")
            .state("a", State::atomic().on_done(Transition::to("a")))
            .build()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::OrphanCompletion { .. }));
    }

    #[test]
    fn rejects_nested_final_and_duplicates() {
        let err = Machine::<Ctx>::builder("m")
            .initial("a")
            .state("a", State::compound("done").child("done", State::terminal()))
            .build()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::InvalidFinal { .. }));

        let err = Machine::<Ctx>::builder("m")
            .initial("a")
            .state("a", State::atomic())
            .state("a", State::atomic())
            .build()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::DuplicateState { .. }));

        let err = Machine::<Ctx>::builder("m").initial("a").build().unwrap_err();
        assert_eq!(err, DefinitionError::Empty("m".to_string()));
    }
}
