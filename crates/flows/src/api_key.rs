//! API key purchase from a shared node provider

use crate::deps::FlowDeps;
use crate::error::{FlowError, FlowResult};
use crate::watch::failure_reason;
use idn_adapters::{ApiKey, Provider, TxKind, TxParams};
use idn_workflow::{
    EffectResult, EffectScope, Event, MachineBuilder, State, Transition, effect_fn, poll_until,
};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

pub const MACHINE_ID: &str = "apiKey";

/// Table the purchased key is written to
pub const SETTINGS_TABLE: &str = "settings";

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyContext {
    pub providers: Vec<Provider>,
    pub provider: Option<String>,
    pub tx_hash: Option<String>,
    pub api_key: Option<ApiKey>,
    pub error: Option<String>,
}

impl ApiKeyContext {
    pub fn selected_provider(&self) -> Option<&Provider> {
        let id = self.provider.as_deref()?;
        self.providers.iter().find(|provider| provider.id == id)
    }
}

fn record_error(ctx: &mut ApiKeyContext, event: &Event) {
    ctx.error = Some(failure_reason(event));
}

pub fn definition(deps: &FlowDeps) -> MachineBuilder<ApiKeyContext> {
    MachineBuilder::new(MACHINE_ID)
        .initial("init")
        .state(
            "init",
            State::atomic()
                .invoke("loadProviders")
                .on_done(Transition::to("editing").assign(|ctx: &mut ApiKeyContext, e| {
                    ctx.providers = e.data().unwrap_or_default();
                    ctx.provider = ctx.providers.first().map(|p| p.id.clone());
                    ctx.error = None;
                }))
                .on_error(Transition::to("failure").assign(record_error)),
        )
        .state(
            "editing",
            State::atomic()
                .on(
                    "SELECT_PROVIDER",
                    Transition::internal()
                        .when(|ctx: &ApiKeyContext, e| {
                            e.str_field("id").is_some_and(|id| ctx.providers.iter().any(|p| p.id == id))
                        })
                        .assign(|ctx: &mut ApiKeyContext, e| {
                            ctx.provider = e.str_field("id").map(str::to_string);
                        }),
                )
                .on(
                    "BUY",
                    Transition::to("submitting")
                        .when(|ctx: &ApiKeyContext, _| ctx.selected_provider().is_some()),
                ),
        )
        .state(
            "submitting",
            State::atomic()
                .invoke("payProvider")
                .on_done(Transition::to("issuing").assign(|ctx: &mut ApiKeyContext, e| {
                    ctx.tx_hash = e.str_field("txHash").map(str::to_string);
                }))
                .on_error(Transition::to("failure").assign(record_error)),
        )
        .state(
            "issuing",
            State::atomic()
                .invoke("waitForKey")
                .on_done(Transition::to("success").assign(|ctx: &mut ApiKeyContext, e| {
                    ctx.api_key = e.data();
                    ctx.error = None;
                }))
                .on_error(Transition::to("failure").assign(record_error)),
        )
        .state("success", State::terminal())
        .state(
            "failure",
            State::atomic()
                .on(
                    "RETRY",
                    Transition::to("issuing").when(|ctx: &ApiKeyContext, _| ctx.tx_hash.is_some()),
                )
                .on(
                    "RETRY",
                    Transition::to("submitting").when(|ctx: &ApiKeyContext, _| !ctx.providers.is_empty()),
                )
                .on("RETRY", Transition::to("init"))
                .on(
                    "EDIT",
                    Transition::to("editing").when(|ctx: &ApiKeyContext, _| {
                        !ctx.providers.is_empty() && ctx.tx_hash.is_none()
                    }),
                ),
        )
        .effect("loadProviders", {
            let deps = deps.clone();
            effect_fn(move |_: EffectScope<ApiKeyContext>| {
                let deps = deps.clone();
                async move { Ok(serde_json::to_value(deps.node.providers().await.map_err(FlowError::from)?)?) }
            })
        })
        .effect("payProvider", {
            let deps = deps.clone();
            effect_fn(move |scope: EffectScope<ApiKeyContext>| {
                let deps = deps.clone();
                async move { Ok(pay(&deps, &scope.context).await?) }
            })
        })
        .effect("waitForKey", {
            let deps = deps.clone();
            effect_fn(move |scope: EffectScope<ApiKeyContext>| {
                let deps = deps.clone();
                async move { wait_for_key(&deps, &scope).await }
            })
        })
}

fn selected(ctx: &ApiKeyContext) -> FlowResult<Provider> {
    ctx.selected_provider()
        .cloned()
        .ok_or_else(|| FlowError::InvalidInput("no provider selected".into()))
}

/// Send the provider's price; the hash is kept so a retry never pays twice
async fn pay(deps: &FlowDeps, ctx: &ApiKeyContext) -> FlowResult<Value> {
    let provider = selected(ctx)?;
    deps.ensure_balance(provider.price).await?;

    let params = TxParams::new(TxKind::Send)
        .to(provider.address.clone())
        .amount(provider.price);
    let hash = deps.send_tx(params).await?;
    info!(provider = %provider.id, hash = %hash, "Paid provider");
    Ok(json!({ "txHash": hash }))
}

/// Wait for the provider to issue the key paid for by `tx_hash`
async fn wait_for_key(deps: &FlowDeps, scope: &EffectScope<ApiKeyContext>) -> EffectResult {
    let provider = selected(&scope.context)?;
    let hash = scope
        .context
        .tx_hash
        .clone()
        .ok_or_else(|| FlowError::InvalidInput("no payment to redeem".into()))?;

    let key = poll_until(&deps.poll, scope.token(), |attempt| {
        let (provider, hash) = (&provider.id, &hash);
        async move {
            match deps.node.api_key(provider, hash).await {
                Ok(key) => Ok(key),
                Err(err) => {
                    warn!(attempt, error = %err, "Api key is not available yet");
                    Ok(None)
                }
            }
        }
    })
    .await?;

    store_key(deps, &key).await?;
    info!(provider = %key.provider, epoch = key.epoch, "Bought api key");
    Ok(serde_json::to_value(key)?)
}

async fn store_key(deps: &FlowDeps, key: &ApiKey) -> FlowResult<Value> {
    let changes = json!({ "apiKey": key.key, "provider": key.provider, "epoch": key.epoch });
    Ok(deps.store.table(SETTINGS_TABLE).update("node", changes).await?)
}
