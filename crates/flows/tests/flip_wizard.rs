mod common;

use common::{image, setup};
use idn_adapters::{RpcError, TxOutcome};
use idn_flows::flip::{self, IMAGE_COUNT};
use idn_flows::{Drafts, FlipContext, FlipDraft, FlipStatus};
use idn_workflow::{Event, create};
use serde_json::json;

fn complete_flip() -> FlipContext {
    FlipContext::new(0).with_images((0..IMAGE_COUNT as u8).map(image))
}

#[tokio::test(start_paused = true)]
async fn happy_path_submits_once() {
    let (node, deps) = setup();
    let ctx = complete_flip();
    let id = ctx.id.clone();
    let wizard = create(flip::definition(&deps), ctx).unwrap();

    wizard
        .wait_for_state("keywords.loaded.fetchedTranslations")
        .await
        .unwrap();
    wizard.send("NEXT");
    wizard.send("NEXT");
    wizard.send(Event::with_payload("SHUFFLE", json!({ "order": [2, 0, 3, 1] })));
    wizard.send("NEXT");
    wizard.send("SUBMIT");

    let snapshot = wizard.wait_for_state("submit.success").await.unwrap();
    assert_eq!(node.calls("flip_submit"), 1);
    assert_eq!(snapshot.context.status, FlipStatus::Published);
    assert_eq!(snapshot.context.order, vec![2, 0, 3, 1]);
    assert_eq!(snapshot.context.keywords.len(), 2);
    assert!(snapshot.context.cid.is_some());

    let visited: Vec<String> = snapshot.visited().map(|p| p.to_string()).collect();
    assert!(visited.ends_with(&[
        "submit.idle".to_string(),
        "submit.submitting".to_string(),
        "submit.mining".to_string(),
        "submit.success".to_string(),
    ]));

    let stored = Drafts::<FlipDraft>::new(deps.store.as_ref())
        .get(&id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, FlipStatus::Published);
    assert_eq!(stored.order, vec![2, 0, 3, 1]);
    assert_eq!(stored.tx_hash, snapshot.context.tx_hash);
}

#[tokio::test(start_paused = true)]
async fn offline_translations_do_not_block_the_wizard() {
    let (node, deps) = setup();
    node.fail("flip_wordTranslations", RpcError::server("offline"));
    let wizard = create(flip::definition(&deps), complete_flip()).unwrap();

    let snapshot = wizard
        .wait_for_state("keywords.loaded.fetchTranslationsFailed")
        .await
        .unwrap();
    assert!(snapshot.context.error.as_deref().unwrap().contains("offline"));
    assert!(!snapshot.visited().any(|p| p.matches("keywords.failure")));

    wizard.send("NEXT");
    wizard.wait_for_state("images").await.unwrap();

    wizard.send("PREV");
    wizard
        .wait_for_state("keywords.loaded.fetchTranslationsFailed")
        .await
        .unwrap();

    node.recover("flip_wordTranslations");
    wizard.send("RETRY");
    let snapshot = wizard
        .wait_for_state("keywords.loaded.fetchedTranslations")
        .await
        .unwrap();
    assert_eq!(snapshot.context.translations.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn keyword_failure_offers_retry() {
    let (node, deps) = setup();
    node.fail("flip_words", RpcError::server("node is syncing"));
    let wizard = create(flip::definition(&deps), complete_flip()).unwrap();

    wizard.wait_for_state("keywords.failure").await.unwrap();
    wizard.send("NEXT");
    node.recover("flip_words");
    wizard.send("RETRY");

    let snapshot = wizard.wait_for_state("keywords.loaded").await.unwrap();
    assert_eq!(node.calls("flip_words"), 2);
    assert_eq!(snapshot.context.keywords[0].name, "tree");

    wizard.send("CHANGE_KEYWORDS");
    let snapshot = wizard
        .wait_for(|s| s.context.keyword_pair_id == 1 && s.matches("keywords.loaded"))
        .await
        .unwrap();
    assert_eq!(snapshot.context.keywords[0].name, "river");
}

#[tokio::test(start_paused = true)]
async fn images_must_be_complete_before_shuffling() {
    let (_node, deps) = setup();
    let wizard = create(flip::definition(&deps), FlipContext::new(0)).unwrap();

    wizard.wait_for_state("keywords.loaded").await.unwrap();
    wizard.send("NEXT");
    wizard.send("NEXT");
    for index in 0..IMAGE_COUNT {
        wizard.send(Event::with_payload(
            "CHANGE_IMAGE",
            json!({ "index": index, "image": image(index as u8) }),
        ));
    }
    wizard.send(Event::with_payload("CHANGE_IMAGE", json!({ "index": 0, "image": "not base64!" })));
    wizard.send(Event::with_payload("CLEAR_IMAGE", json!({ "index": 3 })));
    wizard.send("NEXT");
    wizard.send(Event::with_payload("CHANGE_IMAGE", json!({ "index": 3, "image": image(9) })));

    let snapshot = wizard
        .wait_for(|s| s.context.images[3] == Some(image(9)))
        .await
        .unwrap();
    assert!(snapshot.matches("images"));
    assert_eq!(snapshot.context.images[0], Some(image(0)));

    wizard.send("NEXT");
    wizard.wait_for_state("shuffle").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_mining_reverts_draft_and_retry_publishes() {
    let (node, deps) = setup();
    node.script_outcome(TxOutcome::Failed("flip rejected".into()));
    let ctx = complete_flip();
    let id = ctx.id.clone();
    let wizard = create(flip::definition(&deps), ctx).unwrap();
    let drafts = Drafts::<FlipDraft>::new(deps.store.as_ref());

    wizard.wait_for_state("keywords.loaded").await.unwrap();
    wizard.send("NEXT");
    wizard.send("NEXT");
    wizard.send("NEXT");
    wizard.send("SUBMIT");

    let snapshot = wizard.wait_for_state("submit.failure").await.unwrap();
    assert_eq!(snapshot.context.error.as_deref(), Some("flip rejected"));
    assert_eq!(drafts.get(&id).await.unwrap().unwrap().status, FlipStatus::Draft);

    wizard.send("RETRY");
    wizard.wait_for_state("submit.success").await.unwrap();
    assert_eq!(node.calls("flip_submit"), 2);
    assert_eq!(drafts.get(&id).await.unwrap().unwrap().status, FlipStatus::Published);

    let resumed = FlipContext::from_draft(drafts.get(&id).await.unwrap().unwrap());
    assert_eq!(resumed.status, FlipStatus::Published);
    assert!(resumed.validate().is_ok());
}

#[tokio::test(start_paused = true)]
async fn resumed_draft_with_missing_images_stays_editable() {
    let (_node, deps) = setup();
    let drafts = Drafts::<FlipDraft>::new(deps.store.as_ref());
    let now = chrono::Utc::now();
    let short = FlipDraft {
        id: "resumed".into(),
        keyword_pair_id: 0,
        keywords: Vec::new(),
        images: vec![Some(image(0)), Some(image(1))],
        order: vec![0, 1],
        cid: None,
        tx_hash: None,
        status: FlipStatus::Draft,
        created_at: now,
        modified_at: now,
    };
    drafts.save(&short).await.unwrap();

    let ctx = FlipContext::from_draft(drafts.get("resumed").await.unwrap().unwrap());
    let wizard = create(flip::definition(&deps), ctx).unwrap();
    wizard.wait_for_state("keywords.loaded").await.unwrap();
    wizard.send("NEXT");
    wizard.send(Event::with_payload("CLEAR_IMAGE", json!({ "index": 3 })));
    wizard.send(Event::with_payload("CHANGE_IMAGE", json!({ "index": 3, "image": image(3) })));
    wizard.send(Event::with_payload("CHANGE_IMAGE", json!({ "index": 2, "image": image(2) })));

    let snapshot = wizard
        .wait_for(|s| s.context.images.iter().all(Option::is_some))
        .await
        .unwrap();
    assert!(snapshot.matches("images"));
    assert_eq!(snapshot.context.images.len(), IMAGE_COUNT);
    assert_eq!(snapshot.context.order, vec![0, 1, 2, 3]);

    wizard.send("NEXT");
    wizard.wait_for_state("shuffle").await.unwrap();
}
