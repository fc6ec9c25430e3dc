//! Mining and delegation activation
//!
//! An identity either mines itself (online status) or delegates mining to a
//! pool. Delegation may change at most once per epoch.

use crate::deps::FlowDeps;
use crate::error::{FlowError, FlowResult};
use crate::watch::{WaitForMining, branching_mining_state, failure_reason, mining_state};
use idn_adapters::{TxKind, TxParams};
use idn_workflow::{EffectScope, Event, MachineBuilder, State, Transition, effect_fn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

pub const MACHINE_ID: &str = "mining";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MiningMode {
    #[default]
    Miner,
    Delegator,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MiningContext {
    pub epoch: u64,
    pub online: bool,
    pub delegatee: Option<String>,
    pub delegation_epoch: Option<u64>,
    pub mode: MiningMode,
    /// Pool requested by the pending `ACTIVATE`
    pub pending_delegatee: Option<String>,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
}

impl MiningContext {
    pub fn is_delegated(&self) -> bool {
        self.delegatee.is_some()
    }

    /// Delegation changes are allowed once the delegation epoch has passed
    pub fn can_change_delegation(&self) -> bool {
        self.delegation_epoch.is_none_or(|epoch| self.epoch > epoch)
    }

    fn apply_status(&mut self, event: &Event) {
        if let Some(epoch) = event.field("epoch").and_then(Value::as_u64) {
            self.epoch = epoch;
        }
        self.online = event.field("online").and_then(Value::as_bool).unwrap_or(false);
        self.delegatee = event.str_field("delegatee").map(str::to_string);
        self.delegation_epoch = event.field("delegationEpoch").and_then(Value::as_u64);
        self.mode = if self.delegatee.is_some() {
            MiningMode::Delegator
        } else {
            MiningMode::Miner
        };
        self.error = None;
    }
}

fn requested_mode(event: &Event) -> Option<MiningMode> {
    event
        .field("mode")
        .and_then(|mode| serde_json::from_value(mode.clone()).ok())
}

fn record_error(ctx: &mut MiningContext, event: &Event) {
    ctx.error = Some(failure_reason(event));
}

fn has_delegatee(event: &Event) -> bool {
    event.str_field("delegatee").is_some_and(|d| !d.is_empty())
}

/// Definition of the mining flow
pub fn definition(deps: &FlowDeps) -> MachineBuilder<MiningContext> {
    MachineBuilder::new(MACHINE_ID)
        .initial("loading")
        .state(
            "loading",
            State::atomic()
                .invoke("loadStatus")
                .on_done(
                    Transition::to("delegated")
                        .when(|_: &MiningContext, e| !e.field("delegatee").is_none_or(Value::is_null))
                        .assign(MiningContext::apply_status),
                )
                .on_done(
                    Transition::to("online")
                        .when(|_: &MiningContext, e| e.field("online").and_then(Value::as_bool) == Some(true))
                        .assign(MiningContext::apply_status),
                )
                .on_done(Transition::to("offline").assign(MiningContext::apply_status))
                .on_error(Transition::to("failure").assign(record_error)),
        )
        .state("failure", State::atomic().on("RETRY", Transition::to("loading")))
        .state(
            "offline",
            State::atomic().on(
                "ACTIVATE",
                Transition::to("activating")
                    .when(|ctx: &MiningContext, e| match requested_mode(e) {
                        Some(MiningMode::Miner) => true,
                        Some(MiningMode::Delegator) => has_delegatee(e) && ctx.can_change_delegation(),
                        None => false,
                    })
                    .assign(|ctx: &mut MiningContext, e| {
                        ctx.mode = requested_mode(e).unwrap_or_default();
                        ctx.pending_delegatee = e.str_field("delegatee").map(str::to_string);
                        ctx.tx_hash = None;
                        ctx.error = None;
                    }),
            ),
        )
        .state(
            "online",
            State::atomic().on("DEACTIVATE", Transition::to("deactivating")),
        )
        .state(
            "delegated",
            State::atomic().on(
                "DEACTIVATE",
                Transition::to("deactivating")
                    .when(|ctx: &MiningContext, _| ctx.can_change_delegation()),
            ),
        )
        .state("activating", activating())
        .state("deactivating", deactivating())
        .on(
            "EPOCH_CHANGED",
            Transition::internal().assign(|ctx: &mut MiningContext, e| {
                if let Some(epoch) = e.field("epoch").and_then(Value::as_u64) {
                    ctx.epoch = epoch;
                }
            }),
        )
        .effect("loadStatus", {
            let deps = deps.clone();
            effect_fn(move |_: EffectScope<MiningContext>| {
                let deps = deps.clone();
                async move { Ok(load_status(&deps).await?) }
            })
        })
        .effect("activate", {
            let deps = deps.clone();
            effect_fn(move |scope: EffectScope<MiningContext>| {
                let deps = deps.clone();
                async move { Ok(activate(&deps, &scope.context).await?) }
            })
        })
        .effect("deactivate", {
            let deps = deps.clone();
            effect_fn(move |scope: EffectScope<MiningContext>| {
                let deps = deps.clone();
                async move { Ok(deactivate(&deps, &scope.context).await?) }
            })
        })
        .effect(
            "waitForActivation",
            WaitForMining::new(deps, |ctx: &MiningContext| ctx.tx_hash.clone()),
        )
        .effect(
            "waitForDeactivation",
            WaitForMining::new(deps, |ctx: &MiningContext| ctx.tx_hash.clone()),
        )
}

fn submitting(effect: &str) -> State<MiningContext> {
    State::atomic()
        .invoke(effect)
        .on_done(Transition::to("mining").assign(|ctx: &mut MiningContext, e| {
            ctx.tx_hash = e.str_field("txHash").map(str::to_string);
        }))
        .on_error(Transition::to("failed").assign(record_error))
}

fn activating() -> State<MiningContext> {
    State::compound("submitting")
        .child("submitting", submitting("activate"))
        .child(
            "mining",
            branching_mining_state(
                "waitForActivation",
                vec![
                    Transition::to("#mining.delegated")
                        .when(|ctx: &MiningContext, _| ctx.mode == MiningMode::Delegator)
                        .assign(|ctx: &mut MiningContext, _| {
                            ctx.delegatee = ctx.pending_delegatee.take();
                            ctx.delegation_epoch = Some(ctx.epoch);
                            ctx.online = false;
                        }),
                    Transition::to("#mining.online").assign(|ctx: &mut MiningContext, _| {
                        ctx.online = true;
                    }),
                ],
                Transition::to("failed").assign(record_error),
            ),
        )
        .child(
            "failed",
            State::atomic()
                .on("RETRY", Transition::to("submitting"))
                .on("CANCEL", Transition::to("#mining.offline")),
        )
}

fn deactivating() -> State<MiningContext> {
    State::compound("submitting")
        .child("submitting", submitting("deactivate"))
        .child(
            "mining",
            mining_state(
                "waitForDeactivation",
                Transition::to("#mining.offline").assign(|ctx: &mut MiningContext, _| {
                    if ctx.delegatee.take().is_some() {
                        ctx.delegation_epoch = Some(ctx.epoch);
                    }
                    ctx.online = false;
                    ctx.mode = MiningMode::Miner;
                }),
                Transition::to("failed").assign(record_error),
            ),
        )
        .child(
            "failed",
            State::atomic()
                .on("RETRY", Transition::to("submitting"))
                .on("CANCEL", Transition::to("#mining.loading")),
        )
}

async fn load_status(deps: &FlowDeps) -> FlowResult<Value> {
    let epoch = deps.node.epoch().await?;
    let identity = deps.node.identity(&deps.address()).await?;
    Ok(json!({
        "epoch": epoch.epoch,
        "online": identity.online,
        "delegatee": identity.delegatee,
        "delegationEpoch": identity.delegation_epoch,
    }))
}

async fn activate(deps: &FlowDeps, ctx: &MiningContext) -> FlowResult<Value> {
    deps.ensure_balance(0.0).await?;

    let params = match ctx.mode {
        MiningMode::Miner => {
            TxParams::new(TxKind::OnlineStatus).payload(serde_json::to_vec(&json!({ "online": true }))?)
        }
        MiningMode::Delegator => {
            let delegatee = ctx
                .pending_delegatee
                .clone()
                .ok_or_else(|| FlowError::InvalidInput("delegatee is required".into()))?;
            TxParams::new(TxKind::Delegate).to(delegatee)
        }
    };
    let hash = deps.send_tx(params).await?;
    info!(mode = ?ctx.mode, hash = %hash, "Activating mining");
    Ok(json!({ "txHash": hash }))
}

async fn deactivate(deps: &FlowDeps, ctx: &MiningContext) -> FlowResult<Value> {
    let params = if ctx.is_delegated() {
        TxParams::new(TxKind::Undelegate)
    } else {
        TxParams::new(TxKind::OnlineStatus).payload(serde_json::to_vec(&json!({ "online": false }))?)
    };
    let hash = deps.send_tx(params).await?;
    info!(delegated = ctx.is_delegated(), hash = %hash, "Deactivating mining");
    Ok(json!({ "txHash": hash }))
}
