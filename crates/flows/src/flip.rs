//! Flip creation wizard: `keywords → images → shuffle → submit`

use crate::deps::FlowDeps;
use crate::draft::{Draft, Drafts, FlipStatus};
use crate::error::{FlowError, FlowResult};
use crate::watch::{WaitForMining, failure_reason, mining_state};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use idn_adapters::{Keyword, KeywordPair, Translation, TxKind, TxParams};
use idn_workflow::{EffectScope, Event, MachineBuilder, State, Transition, effect_fn};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};
use uuid::Uuid;

pub const MACHINE_ID: &str = "flip";

/// Number of images making up a flip
pub const IMAGE_COUNT: usize = 4;

/// A flip as persisted in the `flips` table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlipDraft {
    pub id: String,
    pub keyword_pair_id: u32,
    pub keywords: Vec<Keyword>,
    pub images: Vec<Option<String>>,
    pub order: Vec<usize>,
    pub cid: Option<String>,
    pub tx_hash: Option<String>,
    pub status: FlipStatus,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Draft for FlipDraft {
    type Status = FlipStatus;
    const TABLE: &'static str = "flips";

    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> FlipStatus {
        self.status
    }

    fn set_status(&mut self, status: FlipStatus) {
        self.status = status;
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.modified_at = at;
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlipContext {
    pub id: String,
    pub keyword_pair_id: u32,
    pub keywords: Vec<Keyword>,
    pub translations: Vec<Vec<Translation>>,
    pub images: Vec<Option<String>>,
    pub order: Vec<usize>,
    pub cid: Option<String>,
    pub tx_hash: Option<String>,
    pub status: FlipStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Default for FlipContext {
    fn default() -> Self {
        Self::new(0)
    }
}

impl FlipContext {
    pub fn new(keyword_pair_id: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            keyword_pair_id,
            keywords: Vec::new(),
            translations: Vec::new(),
            images: vec![None; IMAGE_COUNT],
            order: (0..IMAGE_COUNT).collect(),
            cid: None,
            tx_hash: None,
            status: FlipStatus::Draft,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Resume editing a stored draft
    pub fn from_draft(draft: FlipDraft) -> Self {
        let mut images = draft.images;
        images.resize(IMAGE_COUNT, None);
        let order = if is_permutation(&draft.order) {
            draft.order
        } else {
            (0..IMAGE_COUNT).collect()
        };
        Self {
            id: draft.id,
            keyword_pair_id: draft.keyword_pair_id,
            keywords: draft.keywords,
            translations: Vec::new(),
            images,
            order,
            cid: draft.cid,
            tx_hash: draft.tx_hash,
            status: draft.status,
            error: None,
            created_at: draft.created_at,
        }
    }

    pub fn with_images(mut self, images: impl IntoIterator<Item = String>) -> Self {
        for (slot, image) in self.images.iter_mut().zip(images) {
            *slot = Some(image);
        }
        self
    }

    pub fn has_keywords(&self) -> bool {
        self.keywords.len() >= 2
    }

    pub fn has_all_images(&self) -> bool {
        self.images.len() == IMAGE_COUNT && self.images.iter().all(Option::is_some)
    }

    /// Check that the flip can be published
    pub fn validate(&self) -> FlowResult<()> {
        if !self.has_keywords() {
            return Err(FlowError::IncompleteFlip("keywords are missing".into()));
        }
        if !self.has_all_images() {
            let missing = self.images.iter().filter(|image| image.is_none()).count();
            return Err(FlowError::IncompleteFlip(format!("{} images missing", missing)));
        }
        if !is_permutation(&self.order) {
            return Err(FlowError::IncompleteFlip("invalid image order".into()));
        }
        Ok(())
    }

    fn to_draft(&self) -> FlipDraft {
        FlipDraft {
            id: self.id.clone(),
            keyword_pair_id: self.keyword_pair_id,
            keywords: self.keywords.clone(),
            images: self.images.clone(),
            order: self.order.clone(),
            cid: self.cid.clone(),
            tx_hash: self.tx_hash.clone(),
            status: self.status,
            created_at: self.created_at,
            modified_at: self.created_at,
        }
    }

    /// Decoded images in display order
    fn payload(&self) -> FlowResult<Value> {
        let images = self
            .images
            .iter()
            .flatten()
            .map(|image| {
                BASE64
                    .decode(image)
                    .map(hex::encode)
                    .map_err(|e| FlowError::IncompleteFlip(format!("image is not base64: {}", e)))
            })
            .collect::<FlowResult<Vec<_>>>()?;
        Ok(json!({
            "pair": self.keyword_pair_id,
            "keywords": self.keywords.iter().map(|k| k.id).collect::<Vec<_>>(),
            "images": images,
            "order": self.order,
        }))
    }
}

fn is_permutation(order: &[usize]) -> bool {
    let mut sorted = order.to_vec();
    sorted.sort_unstable();
    sorted == (0..IMAGE_COUNT).collect::<Vec<_>>()
}

fn image_index(event: &Event) -> Option<usize> {
    event
        .field("index")
        .and_then(Value::as_u64)
        .map(|index| index as usize)
        .filter(|index| *index < IMAGE_COUNT)
}

fn requested_order(event: &Event) -> Option<Vec<usize>> {
    event
        .field("order")
        .and_then(|order| serde_json::from_value::<Vec<usize>>(order.clone()).ok())
        .filter(|order| is_permutation(order))
}

fn record_error(ctx: &mut FlipContext, event: &Event) {
    ctx.error = Some(failure_reason(event));
}

/// Definition of the flip wizard
pub fn definition(deps: &FlowDeps) -> MachineBuilder<FlipContext> {
    let drafts = Drafts::<FlipDraft>::new(deps.store.as_ref());

    MachineBuilder::new(MACHINE_ID)
        .initial("keywords")
        .state("keywords", keywords())
        .state("images", images())
        .state("shuffle", shuffle())
        .state("submit", submit())
        .effect("loadKeywords", {
            let deps = deps.clone();
            effect_fn(move |scope: EffectScope<FlipContext>| {
                let deps = deps.clone();
                async move {
                    let pair = deps.node.keyword_pair(scope.context.keyword_pair_id).await.map_err(FlowError::from)?;
                    debug!(pair = pair.id, words = pair.words.len(), "Loaded keywords");
                    Ok(serde_json::to_value(pair)?)
                }
            })
        })
        .effect("loadTranslations", {
            let deps = deps.clone();
            effect_fn(move |scope: EffectScope<FlipContext>| {
                let deps = deps.clone();
                async move {
                    let mut translations = Vec::with_capacity(scope.context.keywords.len());
                    for keyword in &scope.context.keywords {
                        let found = deps.node.word_translations(keyword.id).await.map_err(FlowError::from)?;
                        translations.push(found);
                    }
                    Ok(serde_json::to_value(translations)?)
                }
            })
        })
        .effect("submitFlip", {
            let deps = deps.clone();
            let drafts = drafts.clone();
            effect_fn(move |scope: EffectScope<FlipContext>| {
                let deps = deps.clone();
                let drafts = drafts.clone();
                async move { Ok(publish(&deps, &drafts, scope.context).await?) }
            })
        })
        .effect(
            "waitForMining",
            WaitForMining::new(deps, |ctx: &FlipContext| ctx.tx_hash.clone())
                .on_mined({
                    let drafts = drafts.clone();
                    move |ctx: FlipContext, _| {
                        let drafts = drafts.clone();
                        async move {
                            drafts.transition(&ctx.id, FlipStatus::Published).await?;
                            Ok(())
                        }
                    }
                })
                .on_failed(move |ctx: FlipContext, _| {
                    let drafts = drafts.clone();
                    async move {
                        drafts.transition(&ctx.id, FlipStatus::Draft).await?;
                        Ok(())
                    }
                }),
        )
}

fn keywords() -> State<FlipContext> {
    State::compound("loading")
        .child(
            "loading",
            State::atomic()
                .invoke("loadKeywords")
                .on_done(Transition::to("loaded").assign(|ctx: &mut FlipContext, e| {
                    if let Some(pair) = e.data::<KeywordPair>() {
                        ctx.keyword_pair_id = pair.id;
                        ctx.keywords = pair.words;
                    }
                    ctx.error = None;
                }))
                .on_error(Transition::to("failure").assign(record_error)),
        )
        .child(
            "loaded",
            State::compound("fetchingTranslations")
                .child(
                    "fetchingTranslations",
                    State::atomic()
                        .invoke("loadTranslations")
                        .on_done(Transition::to("fetchedTranslations").assign(
                            |ctx: &mut FlipContext, e| {
                                ctx.translations = e.data().unwrap_or_default();
                            },
                        ))
                        .on_error(Transition::to("fetchTranslationsFailed").assign(record_error)),
                )
                .child("fetchedTranslations", State::atomic())
                .child(
                    "fetchTranslationsFailed",
                    State::atomic().on("RETRY", Transition::to("fetchingTranslations")),
                ),
        )
        .child("failure", State::atomic().on("RETRY", Transition::to("loading")))
        .on(
            "CHANGE_KEYWORDS",
            Transition::to("#flip.keywords").assign(|ctx: &mut FlipContext, _| {
                ctx.keyword_pair_id += 1;
                ctx.keywords.clear();
                ctx.translations.clear();
            }),
        )
        .on(
            "NEXT",
            Transition::to("images").when(|ctx: &FlipContext, _| ctx.has_keywords()),
        )
}

fn images() -> State<FlipContext> {
    State::atomic()
        .on(
            "CHANGE_IMAGE",
            Transition::internal()
                .when(|_: &FlipContext, e| {
                    image_index(e).is_some()
                        && e.str_field("image").is_some_and(|image| BASE64.decode(image).is_ok())
                })
                .assign(|ctx: &mut FlipContext, e| {
                    if let (Some(slot), Some(image)) = (
                        image_index(e).and_then(|index| ctx.images.get_mut(index)),
                        e.str_field("image"),
                    ) {
                        *slot = Some(image.to_string());
                    }
                }),
        )
        .on(
            "CLEAR_IMAGE",
            Transition::internal()
                .when(|_: &FlipContext, e| image_index(e).is_some())
                .assign(|ctx: &mut FlipContext, e| {
                    if let Some(slot) = image_index(e).and_then(|index| ctx.images.get_mut(index)) {
                        *slot = None;
                    }
                }),
        )
        .on(
            "NEXT",
            Transition::to("shuffle").when(|ctx: &FlipContext, _| ctx.has_all_images()),
        )
        .on("PREV", Transition::to("#flip.keywords.loaded"))
}

fn shuffle() -> State<FlipContext> {
    State::atomic()
        .on(
            "SHUFFLE",
            Transition::internal().assign(|ctx: &mut FlipContext, e| {
                ctx.order = requested_order(e).unwrap_or_else(|| {
                    let mut order: Vec<usize> = (0..IMAGE_COUNT).collect();
                    order.shuffle(&mut rand::thread_rng());
                    order
                });
            }),
        )
        .on(
            "RESET_SHUFFLE",
            Transition::internal().assign(|ctx: &mut FlipContext, _| {
                ctx.order = (0..IMAGE_COUNT).collect();
            }),
        )
        .on("NEXT", Transition::to("submit"))
        .on("PREV", Transition::to("images"))
}

fn submit() -> State<FlipContext> {
    State::compound("idle")
        .child(
            "idle",
            State::atomic()
                .on("SUBMIT", Transition::to("submitting"))
                .on("PREV", Transition::to("#flip.shuffle")),
        )
        .child(
            "submitting",
            State::atomic()
                .invoke("submitFlip")
                .on_done(Transition::to("mining").assign(|ctx: &mut FlipContext, e| {
                    ctx.cid = e.str_field("cid").map(str::to_string);
                    ctx.tx_hash = e.str_field("txHash").map(str::to_string);
                    ctx.status = FlipStatus::Publishing;
                    ctx.error = None;
                }))
                .on_error(Transition::to("failure").assign(record_error)),
        )
        .child(
            "mining",
            mining_state(
                "waitForMining",
                Transition::to("success").assign(|ctx: &mut FlipContext, _| {
                    ctx.status = FlipStatus::Published;
                }),
                Transition::to("failure").assign(|ctx: &mut FlipContext, e| {
                    ctx.status = FlipStatus::Draft;
                    record_error(ctx, e);
                }),
            ),
        )
        .child("success", State::atomic())
        .child(
            "failure",
            State::atomic()
                .on("RETRY", Transition::to("submitting"))
                .on("PREV", Transition::to("#flip.shuffle")),
        )
}

/// Store the flip content, send it to the node and mark the draft as publishing
async fn publish(
    deps: &FlowDeps,
    drafts: &Drafts<FlipDraft>,
    ctx: FlipContext,
) -> FlowResult<Value> {
    ctx.validate()?;

    let cid = deps.store_json(&ctx.payload()?).await?;
    let params = TxParams::new(TxKind::SubmitFlip).payload(cid.as_str().as_bytes().to_vec());
    let (hex, _) = deps.sign_with(params, &deps.key).await?;
    let submission = deps.node.submit_flip(&hex, cid.as_str()).await?;

    let mut draft = ctx.to_draft();
    draft.cid = Some(cid.to_string());
    draft.tx_hash = Some(submission.tx_hash.clone());
    drafts.save(&draft).await?;
    drafts.transition(&draft.id, FlipStatus::Publishing).await?;

    info!(flip = %draft.id, cid = %cid, hash = %submission.tx_hash, "Submitted flip");
    Ok(json!({ "cid": cid.as_str(), "txHash": submission.tx_hash }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> String {
        BASE64.encode([1u8, 2, 3])
    }

    #[test]
    fn validation_reports_what_is_missing() {
        let ctx = FlipContext::new(0);
        assert!(matches!(ctx.validate(), Err(FlowError::IncompleteFlip(msg)) if msg.contains("keywords")));

        let mut ctx = ctx.with_images([image(), image()]);
        ctx.keywords = vec![
            Keyword { id: 0, name: "tree".into(), desc: String::new() },
            Keyword { id: 1, name: "clock".into(), desc: String::new() },
        ];
        assert!(matches!(ctx.validate(), Err(FlowError::IncompleteFlip(msg)) if msg == "2 images missing"));

        let mut ctx = ctx.with_images(vec![image(); IMAGE_COUNT]);
        ctx.validate().unwrap();
        ctx.order = vec![0, 0, 1, 2];
        assert!(ctx.validate().is_err());
    }

    #[test]
    fn requested_order_must_be_a_permutation() {
        let event = Event::with_payload("SHUFFLE", json!({ "order": [3, 2, 1, 0] }));
        assert_eq!(requested_order(&event), Some(vec![3, 2, 1, 0]));

        let event = Event::with_payload("SHUFFLE", json!({ "order": [3, 3, 1, 0] }));
        assert_eq!(requested_order(&event), None);
    }

    #[test]
    fn image_index_is_bounded() {
        assert_eq!(image_index(&Event::with_payload("CLEAR_IMAGE", json!({ "index": 3 }))), Some(3));
        assert_eq!(image_index(&Event::with_payload("CLEAR_IMAGE", json!({ "index": 4 }))), None);
        assert_eq!(image_index(&Event::new("CLEAR_IMAGE")), None);
    }

    #[test]
    fn resumed_draft_has_every_image_slot() {
        let mut draft = FlipContext::new(3).with_images([image(), image()]).to_draft();
        draft.images.truncate(2);
        draft.order = vec![1, 0];

        let ctx = FlipContext::from_draft(draft);
        assert_eq!(ctx.images.len(), IMAGE_COUNT);
        assert_eq!(ctx.images[1], Some(image()));
        assert_eq!(ctx.images[3], None);
        assert_eq!(ctx.order, vec![0, 1, 2, 3]);
    }
}
