//! Invite activation: turn an invitation code into a candidate identity

use crate::deps::FlowDeps;
use crate::error::{FlowError, FlowResult};
use crate::watch::{WaitForMining, failure_reason, mining_state};
use idn_adapters::{SigningKey, TxKind, TxParams};
use idn_workflow::{EffectScope, Event, MachineBuilder, State, Transition, effect_fn};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::info;

pub const MACHINE_ID: &str = "invite";

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteContext {
    /// Hex encoded invitation key
    pub code: String,
    pub identity_state: Option<String>,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
}

fn record_error(ctx: &mut InviteContext, event: &Event) {
    ctx.error = Some(failure_reason(event));
}

pub fn definition(deps: &FlowDeps) -> MachineBuilder<InviteContext> {
    MachineBuilder::new(MACHINE_ID)
        .initial("init")
        .state(
            "init",
            State::atomic()
                .invoke("loadIdentity")
                .on_done(Transition::to("editing").assign(|ctx: &mut InviteContext, e| {
                    ctx.identity_state = e.str_field("state").map(str::to_string);
                }))
                .on_error(Transition::to("editing").assign(record_error)),
        )
        .state(
            "editing",
            State::atomic()
                .on(
                    "CHANGE_CODE",
                    Transition::internal().assign(|ctx: &mut InviteContext, e| {
                        ctx.code = e.str_field("code").unwrap_or_default().trim().to_string();
                        ctx.error = None;
                    }),
                )
                .on(
                    "ACTIVATE",
                    Transition::to("submitting").when(|ctx: &InviteContext, _| !ctx.code.is_empty()),
                ),
        )
        .state(
            "submitting",
            State::atomic()
                .invoke("activateInvite")
                .on_done(Transition::to("mining").assign(|ctx: &mut InviteContext, e| {
                    ctx.tx_hash = e.str_field("txHash").map(str::to_string);
                    ctx.error = None;
                }))
                .on_error(Transition::to("failure").assign(record_error)),
        )
        .state(
            "mining",
            mining_state(
                "waitForActivation",
                Transition::to("success").assign(|ctx: &mut InviteContext, _| {
                    ctx.identity_state = Some("Candidate".to_string());
                }),
                Transition::to("failure").assign(record_error),
            ),
        )
        .state("success", State::terminal())
        .state(
            "failure",
            State::atomic()
                .on("RETRY", Transition::to("submitting"))
                .on("EDIT", Transition::to("editing")),
        )
        .effect("loadIdentity", {
            let deps = deps.clone();
            effect_fn(move |_: EffectScope<InviteContext>| {
                let deps = deps.clone();
                async move {
                    let identity = deps.node.identity(&deps.address()).await.map_err(FlowError::from)?;
                    Ok(serde_json::to_value(identity)?)
                }
            })
        })
        .effect("activateInvite", {
            let deps = deps.clone();
            effect_fn(move |scope: EffectScope<InviteContext>| {
                let deps = deps.clone();
                async move { Ok(activate(&deps, &scope.context.code).await?) }
            })
        })
        .effect(
            "waitForActivation",
            WaitForMining::new(deps, |ctx: &InviteContext| ctx.tx_hash.clone()),
        )
}

/// Send an activation transaction signed with the invitation key
async fn activate(deps: &FlowDeps, code: &str) -> FlowResult<Value> {
    let invite = SigningKey::from_hex(code)
        .map_err(|_| FlowError::InvalidInput("invitation code is not a valid key".into()))?;
    let params = TxParams::new(TxKind::Activation).to(deps.address());
    let hash = deps.send_tx_with(params, &invite).await?;
    info!(inviter = %invite.address(), hash = %hash, "Activating invitation");
    Ok(json!({ "txHash": hash }))
}
