//! Ad list with review, publish and removal sub-flows

use crate::deps::FlowDeps;
use crate::draft::{AdStatus, Draft, Drafts};
use crate::error::{FlowError, FlowResult};
use crate::watch::{WaitForMining, failure_reason, mining_state};
use chrono::{DateTime, Utc};
use idn_adapters::{TxKind, TxParams};
use idn_workflow::{EffectScope, Event, MachineBuilder, State, Transition, effect_fn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

pub const MACHINE_ID: &str = "adList";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ad {
    pub id: String,
    pub title: String,
    pub url: String,
    /// Base64 encoded cover image
    #[serde(default)]
    pub cover: Option<String>,
    pub status: AdStatus,
    #[serde(default)]
    pub cid: Option<String>,
    #[serde(default)]
    pub contract: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Ad {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            url: url.into(),
            cover: None,
            status: AdStatus::Draft,
            cid: None,
            contract: None,
            created_at: now,
            modified_at: now,
        }
    }

    fn content(&self) -> Value {
        json!({ "title": self.title, "url": self.url, "cover": self.cover })
    }
}

impl Draft for Ad {
    type Status = AdStatus;
    const TABLE: &'static str = "ads";

    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> AdStatus {
        self.status
    }

    fn set_status(&mut self, status: AdStatus) {
        self.status = status;
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.modified_at = at;
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdContext {
    pub ads: Vec<Ad>,
    pub filter: Option<AdStatus>,
    pub filtered_ads: Vec<Ad>,
    pub selected: Option<String>,
    pub amount: f64,
    pub cid: Option<String>,
    pub contract: Option<String>,
    pub tx_hash: Option<String>,
    pub deployed: bool,
    pub verdict: Option<bool>,
    pub error: Option<String>,
}

impl AdContext {
    pub fn ad(&self, id: &str) -> Option<&Ad> {
        self.ads.iter().find(|ad| ad.id == id)
    }

    pub fn selected_ad(&self) -> Option<&Ad> {
        self.selected.as_deref().and_then(|id| self.ad(id))
    }

    fn has_status(&self, id: Option<&str>, status: AdStatus) -> bool {
        id.and_then(|id| self.ad(id)).is_some_and(|ad| ad.status == status)
    }

    fn set_ads(&mut self, ads: Vec<Ad>) {
        self.ads = ads;
        self.refresh();
    }

    /// Swap in `ad` for the entry with the same id
    fn replace(&mut self, ad: Ad) {
        self.ads = self
            .ads
            .iter()
            .map(|existing| if existing.id == ad.id { ad.clone() } else { existing.clone() })
            .collect();
        self.refresh();
    }

    fn update_selected(&mut self, update: impl FnOnce(&mut Ad)) {
        if let Some(mut ad) = self.selected_ad().cloned() {
            update(&mut ad);
            self.replace(ad);
        }
    }

    fn remove(&mut self, id: &str) {
        self.ads = self.ads.iter().filter(|ad| ad.id != id).cloned().collect();
        self.refresh();
    }

    fn refresh(&mut self) {
        self.filtered_ads = self
            .ads
            .iter()
            .filter(|ad| self.filter.is_none_or(|status| ad.status == status))
            .cloned()
            .collect();
    }

    fn select(&mut self, event: &Event) {
        self.selected = event.str_field("id").map(str::to_string);
        self.amount = 0.0;
        self.cid = None;
        self.contract = None;
        self.tx_hash = None;
        self.deployed = false;
        self.verdict = None;
        self.error = None;
    }

    fn selected_id(&self) -> FlowResult<String> {
        self.selected
            .clone()
            .ok_or_else(|| FlowError::InvalidInput("no ad selected".into()))
    }
}

fn record_error(ctx: &mut AdContext, event: &Event) {
    ctx.error = Some(failure_reason(event));
}

fn back_to_idle() -> Transition<AdContext> {
    Transition::to("#adList.ready.idle").assign(|ctx: &mut AdContext, _| {
        ctx.selected = None;
    })
}

/// Definition of the ad list
pub fn definition(deps: &FlowDeps) -> MachineBuilder<AdContext> {
    let drafts = Drafts::<Ad>::new(deps.store.as_ref());

    MachineBuilder::new(MACHINE_ID)
        .initial("load")
        .state(
            "load",
            State::atomic()
                .invoke("loadAds")
                .on_done(Transition::to("ready").assign(|ctx: &mut AdContext, e| {
                    ctx.set_ads(e.data().unwrap_or_default());
                }))
                .on_error(Transition::to("failure").assign(record_error)),
        )
        .state("ready", ready())
        .state("failure", State::atomic().on("RETRY", Transition::to("load")))
        .effect("loadAds", {
            let drafts = drafts.clone();
            effect_fn(move |_: EffectScope<AdContext>| {
                let drafts = drafts.clone();
                async move { Ok(serde_json::to_value(drafts.all().await?)?) }
            })
        })
        .effect("deployVoting", {
            let deps = deps.clone();
            let drafts = drafts.clone();
            effect_fn(move |scope: EffectScope<AdContext>| {
                let deps = deps.clone();
                let drafts = drafts.clone();
                async move { Ok(deploy_voting(&deps, &drafts, &scope.context).await?) }
            })
        })
        .effect("startVoting", {
            let deps = deps.clone();
            effect_fn(move |scope: EffectScope<AdContext>| {
                let deps = deps.clone();
                async move { Ok(start_voting(&deps, &scope.context).await?) }
            })
        })
        .effect("publishAd", {
            let deps = deps.clone();
            let drafts = drafts.clone();
            effect_fn(move |scope: EffectScope<AdContext>| {
                let deps = deps.clone();
                let drafts = drafts.clone();
                async move { Ok(publish(&deps, &drafts, &scope.context).await?) }
            })
        })
        .effect("removeAd", {
            let drafts = drafts.clone();
            effect_fn(move |scope: EffectScope<AdContext>| {
                let drafts = drafts.clone();
                async move {
                    let id = scope.context.selected_id()?;
                    if !drafts.delete(&id).await? {
                        return Err(FlowError::AdNotFound(id).into());
                    }
                    info!(ad = %id, "Removed ad");
                    Ok(json!({ "id": id }))
                }
            })
        })
        .effect("recordVerdict", {
            let drafts = drafts.clone();
            effect_fn(move |scope: EffectScope<AdContext>| {
                let drafts = drafts.clone();
                async move {
                    let id = scope.context.selected_id()?;
                    let status = match scope.context.verdict {
                        Some(true) => AdStatus::Approved,
                        Some(false) => AdStatus::Rejected,
                        None => return Err(FlowError::InvalidInput("voting verdict is missing".into()).into()),
                    };
                    let ad = drafts.transition(&id, status).await?;
                    Ok(serde_json::to_value(ad)?)
                }
            })
        })
        .effect("waitForDeploy", WaitForMining::new(deps, |ctx: &AdContext| ctx.tx_hash.clone()))
        .effect("waitForStartVoting", {
            let drafts = drafts.clone();
            WaitForMining::new(deps, |ctx: &AdContext| ctx.tx_hash.clone()).on_mined(
                move |ctx: AdContext, _| {
                    let drafts = drafts.clone();
                    async move {
                        drafts.transition(&ctx.selected_id()?, AdStatus::Reviewing).await?;
                        Ok(())
                    }
                },
            )
        })
        .effect(
            "waitForPublish",
            WaitForMining::new(deps, |ctx: &AdContext| ctx.tx_hash.clone()).on_mined(
                move |ctx: AdContext, _| {
                    let drafts = drafts.clone();
                    async move {
                        drafts.transition(&ctx.selected_id()?, AdStatus::Published).await?;
                        Ok(())
                    }
                },
            ),
        )
}

fn ready() -> State<AdContext> {
    State::compound("idle")
        .child(
            "idle",
            State::atomic()
                .on(
                    "SEND_AD_TO_REVIEW",
                    Transition::to("sendToReview")
                        .when(|ctx: &AdContext, e| ctx.has_status(e.str_field("id"), AdStatus::Draft))
                        .assign(AdContext::select),
                )
                .on(
                    "PUBLISH",
                    Transition::to("publish")
                        .when(|ctx: &AdContext, e| ctx.has_status(e.str_field("id"), AdStatus::Draft))
                        .assign(AdContext::select),
                )
                .on(
                    "REMOVE",
                    Transition::to("removeAd")
                        .when(|ctx: &AdContext, e| e.str_field("id").is_some_and(|id| ctx.ad(id).is_some()))
                        .assign(AdContext::select),
                )
                .on(
                    "VOTING_FINISHED",
                    Transition::to("recordingVerdict")
                        .when(|ctx: &AdContext, e| {
                            ctx.has_status(e.str_field("id"), AdStatus::Reviewing)
                                && e.field("approved").and_then(Value::as_bool).is_some()
                        })
                        .assign(|ctx: &mut AdContext, e| {
                            ctx.select(e);
                            ctx.verdict = e.field("approved").and_then(Value::as_bool);
                        }),
                ),
        )
        .child("sendToReview", send_to_review())
        .child("publish", publish_ad())
        .child("removeAd", remove_ad())
        .child(
            "recordingVerdict",
            State::atomic()
                .invoke("recordVerdict")
                .on_done(back_to_idle().assign(|ctx: &mut AdContext, e| {
                    if let Some(ad) = e.data::<Ad>() {
                        ctx.replace(ad);
                    }
                }))
                .on_error(back_to_idle().assign(record_error)),
        )
        .on(
            "FILTER",
            Transition::internal().assign(|ctx: &mut AdContext, e| {
                ctx.filter = e.field("status").and_then(|s| serde_json::from_value(s.clone()).ok());
                ctx.refresh();
            }),
        )
}

/// `RETRY` and `CANCEL` handlers shared by the failure states of a sub-flow
fn retryable(state: State<AdContext>, retry: &str) -> State<AdContext> {
    state
        .on("RETRY", Transition::to(retry))
        .on("CANCEL", back_to_idle())
}

fn send_to_review() -> State<AdContext> {
    let resume = || {
        State::atomic()
            .on(
                "RETRY",
                Transition::to("startVoting").when(|ctx: &AdContext, _| ctx.deployed),
            )
            .on("RETRY", Transition::to("submitting"))
            .on("CANCEL", back_to_idle())
    };

    State::compound("preview")
        .child(
            "preview",
            State::atomic()
                .on(
                    "SUBMIT",
                    Transition::to("submitting")
                        .when(|_: &AdContext, e| {
                            e.field("amount").and_then(Value::as_f64).is_some_and(|a| a > 0.0)
                        })
                        .assign(|ctx: &mut AdContext, e| {
                            ctx.amount = e.field("amount").and_then(Value::as_f64).unwrap_or_default();
                        }),
                )
                .on("CANCEL", back_to_idle()),
        )
        .child(
            "submitting",
            State::atomic()
                .invoke("deployVoting")
                .on_done(Transition::to("mineDeployVoting").assign(|ctx: &mut AdContext, e| {
                    ctx.cid = e.str_field("cid").map(str::to_string);
                    ctx.contract = e.str_field("contract").map(str::to_string);
                    ctx.tx_hash = e.str_field("txHash").map(str::to_string);
                    ctx.error = None;
                    let (cid, contract) = (ctx.cid.clone(), ctx.contract.clone());
                    ctx.update_selected(|ad| {
                        ad.cid = cid;
                        ad.contract = contract;
                    });
                }))
                .on_error(Transition::to("failed").assign(record_error)),
        )
        .child(
            "mineDeployVoting",
            mining_state(
                "waitForDeploy",
                Transition::to("startVoting").assign(|ctx: &mut AdContext, e| {
                    ctx.deployed = true;
                    if let Some(contract) = e.str_field("contract") {
                        ctx.contract = Some(contract.to_string());
                    }
                }),
                Transition::to("miningFailed").assign(record_error),
            ),
        )
        .child(
            "startVoting",
            State::atomic()
                .invoke("startVoting")
                .on_done(Transition::to("mineStartVoting").assign(|ctx: &mut AdContext, e| {
                    ctx.tx_hash = e.str_field("txHash").map(str::to_string);
                    ctx.error = None;
                }))
                .on_error(Transition::to("failed").assign(record_error)),
        )
        .child(
            "mineStartVoting",
            mining_state(
                "waitForStartVoting",
                Transition::to("#adList.ready.idle").assign(|ctx: &mut AdContext, _| {
                    ctx.update_selected(|ad| ad.status = AdStatus::Reviewing);
                    ctx.selected = None;
                }),
                Transition::to("miningFailed").assign(record_error),
            ),
        )
        .child("miningFailed", resume())
        .child("failed", resume())
}

fn publish_ad() -> State<AdContext> {
    State::compound("preview")
        .child(
            "preview",
            State::atomic()
                .on("SUBMIT", Transition::to("submitting"))
                .on("CANCEL", back_to_idle()),
        )
        .child(
            "submitting",
            State::atomic()
                .invoke("publishAd")
                .on_done(Transition::to("mining").assign(|ctx: &mut AdContext, e| {
                    ctx.cid = e.str_field("cid").map(str::to_string);
                    ctx.tx_hash = e.str_field("txHash").map(str::to_string);
                    ctx.error = None;
                }))
                .on_error(Transition::to("failed").assign(record_error)),
        )
        .child(
            "mining",
            mining_state(
                "waitForPublish",
                back_to_idle().assign(|ctx: &mut AdContext, _| {
                    ctx.update_selected(|ad| ad.status = AdStatus::Published);
                    ctx.selected = None;
                }),
                Transition::to("miningFailed").assign(record_error),
            ),
        )
        .child("miningFailed", retryable(State::atomic(), "submitting"))
        .child("failed", retryable(State::atomic(), "submitting"))
}

fn remove_ad() -> State<AdContext> {
    State::compound("confirm")
        .child(
            "confirm",
            State::atomic()
                .on("CONFIRM", Transition::to("removing"))
                .on("CANCEL", back_to_idle()),
        )
        .child(
            "removing",
            State::atomic()
                .invoke("removeAd")
                .on_done(back_to_idle().assign(|ctx: &mut AdContext, e| {
                    if let Some(id) = e.str_field("id") {
                        ctx.remove(id);
                    }
                }))
                .on_error(Transition::to("failed").assign(record_error)),
        )
        .child("failed", retryable(State::atomic(), "removing"))
}

async fn selected_ad(drafts: &Drafts<Ad>, ctx: &AdContext) -> FlowResult<Ad> {
    let id = ctx.selected_id()?;
    drafts.get(&id).await?.ok_or(FlowError::AdNotFound(id))
}

/// Store the ad content and deploy its review contract
async fn deploy_voting(deps: &FlowDeps, drafts: &Drafts<Ad>, ctx: &AdContext) -> FlowResult<Value> {
    let mut ad = selected_ad(drafts, ctx).await?;
    deps.ensure_balance(ctx.amount).await?;

    let cid = deps.store_json(&ad.content()).await?;
    let estimate = deps
        .node
        .estimate_deploy(json!({ "cid": cid.as_str(), "amount": ctx.amount, "owner": deps.address() }))
        .await?;

    let payload = serde_json::to_vec(&json!({ "cid": cid.as_str(), "contract": estimate.contract }))?;
    let params = TxParams::new(TxKind::DeployContract)
        .amount(ctx.amount)
        .max_fee(estimate.tx_fee + estimate.gas_cost)
        .payload(payload);
    let hash = deps.send_tx(params).await?;

    ad.cid = Some(cid.to_string());
    ad.contract = Some(estimate.contract.clone());
    drafts.save(&ad).await?;

    info!(ad = %ad.id, contract = %estimate.contract, hash = %hash, "Deploying review contract");
    Ok(json!({ "cid": cid.as_str(), "contract": estimate.contract, "txHash": hash }))
}

async fn start_voting(deps: &FlowDeps, ctx: &AdContext) -> FlowResult<Value> {
    let contract = ctx
        .contract
        .clone()
        .ok_or_else(|| FlowError::InvalidInput("review contract is not deployed".into()))?;
    let payload = serde_json::to_vec(&json!({ "method": "startVoting", "cid": ctx.cid }))?;
    let hash = deps
        .send_tx(TxParams::new(TxKind::CallContract).to(contract.clone()).payload(payload))
        .await?;

    info!(contract = %contract, hash = %hash, "Starting review voting");
    Ok(json!({ "txHash": hash }))
}

/// Store the updated profile listing the ad and send it to the node
async fn publish(deps: &FlowDeps, drafts: &Drafts<Ad>, ctx: &AdContext) -> FlowResult<Value> {
    let mut ad = selected_ad(drafts, ctx).await?;
    let ad_cid = deps.store_json(&ad.content()).await?;

    let mut listed: Vec<String> = drafts
        .all()
        .await?
        .into_iter()
        .filter(|other| other.status == AdStatus::Published && other.id != ad.id)
        .filter_map(|other| other.cid)
        .collect();
    listed.push(ad_cid.to_string());
    let profile = deps.store_json(&json!({ "ads": listed })).await?;

    let hash = deps
        .send_tx(TxParams::new(TxKind::ChangeProfile).payload(profile.as_str().as_bytes().to_vec()))
        .await?;

    ad.cid = Some(ad_cid.to_string());
    drafts.save(&ad).await?;

    info!(ad = %ad.id, profile = %profile, hash = %hash, "Publishing ad");
    Ok(json!({ "cid": profile.as_str(), "txHash": hash }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(ads: Vec<Ad>) -> AdContext {
        let mut ctx = AdContext::default();
        ctx.set_ads(ads);
        ctx
    }

    #[test]
    fn filtered_ads_follow_every_update() {
        let draft = Ad::new("Coffee", "https://coffee.example");
        let mut reviewing = Ad::new("Tea", "https://tea.example");
        reviewing.status = AdStatus::Reviewing;
        let mut ctx = context(vec![draft.clone(), reviewing.clone()]);
        assert_eq!(ctx.filtered_ads.len(), 2);

        ctx.filter = Some(AdStatus::Draft);
        ctx.refresh();
        assert_eq!(ctx.filtered_ads, vec![draft.clone()]);

        ctx.selected = Some(draft.id.clone());
        ctx.update_selected(|ad| ad.status = AdStatus::Reviewing);
        assert!(ctx.filtered_ads.is_empty());
        assert_eq!(ctx.ads[0].status, AdStatus::Reviewing);

        ctx.filter = None;
        ctx.remove(&reviewing.id);
        assert_eq!(ctx.filtered_ads.len(), 1);
        assert_eq!(ctx.ads.len(), 1);
    }

    #[test]
    fn selecting_resets_previous_attempt() {
        let ad = Ad::new("Coffee", "https://coffee.example");
        let mut ctx = context(vec![ad.clone()]);
        ctx.deployed = true;
        ctx.error = Some("boom".into());
        ctx.select(&Event::with_payload("PUBLISH", json!({ "id": ad.id })));
        assert!(!ctx.deployed);
        assert!(ctx.error.is_none());
        assert_eq!(ctx.selected_ad(), Some(&ad));
    }
}
