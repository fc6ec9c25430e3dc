mod common;

use common::setup;
use idn_adapters::{RpcError, SigningKey, TxKind};
use idn_flows::api_key::{self, SETTINGS_TABLE};
use idn_flows::invite;
use idn_flows::{ApiKeyContext, InviteContext};
use idn_workflow::{Event, create};
use serde_json::json;

#[tokio::test(start_paused = true)]
async fn invite_activates_identity() {
    let (node, deps) = setup();
    let invitation = SigningKey::generate();
    let flow = create(invite::definition(&deps), InviteContext::default()).unwrap();

    let snapshot = flow.wait_for_state("editing").await.unwrap();
    assert_eq!(snapshot.context.identity_state.as_deref(), Some("Verified"));

    flow.send("ACTIVATE");
    flow.send(Event::with_payload("CHANGE_CODE", json!({ "code": format!(" {} ", invitation.to_hex()) })));
    flow.send("ACTIVATE");

    let snapshot = flow.wait_for(|s| s.done).await.unwrap();
    assert!(snapshot.matches("success"));
    assert_eq!(node.identity(&deps.address()).state, "Candidate");

    let tx = node.transactions().pop().unwrap();
    assert_eq!(tx.kind, TxKind::Activation);
    assert_eq!(tx.from, Some(invitation.address()));
    assert_eq!(tx.to, Some(deps.address()));
}

#[tokio::test(start_paused = true)]
async fn invalid_code_can_be_edited() {
    let (node, deps) = setup();
    let flow = create(invite::definition(&deps), InviteContext::default()).unwrap();

    flow.wait_for_state("editing").await.unwrap();
    flow.send(Event::with_payload("CHANGE_CODE", json!({ "code": "not-a-key" })));
    flow.send("ACTIVATE");

    let snapshot = flow.wait_for_state("failure").await.unwrap();
    assert!(snapshot.context.error.as_deref().unwrap().contains("invitation code"));
    assert!(node.transactions().is_empty());

    flow.send("EDIT");
    flow.wait_for_state("editing").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn buys_api_key_from_selected_provider() {
    let (node, deps) = setup();
    let flow = create(api_key::definition(&deps), ApiKeyContext::default()).unwrap();

    let snapshot = flow.wait_for_state("editing").await.unwrap();
    assert_eq!(snapshot.context.providers.len(), 2);
    assert_eq!(snapshot.context.provider.as_deref(), Some("provider-1"));

    flow.send(Event::with_payload("SELECT_PROVIDER", json!({ "id": "provider-9" })));
    flow.send(Event::with_payload("SELECT_PROVIDER", json!({ "id": "provider-2" })));
    flow.send("BUY");

    let snapshot = flow.wait_for(|s| s.done).await.unwrap();
    assert!(snapshot.matches("success"));
    let key = snapshot.context.api_key.clone().unwrap();
    assert_eq!(key.provider, "provider-2");
    assert!(snapshot.context.tx_hash.is_some());

    let provider = node.providers().into_iter().find(|p| p.id == "provider-2").unwrap();
    assert_eq!(node.balance(&deps.address()), 1000.0 - provider.price);
    assert_eq!(node.balance(&provider.address), 1000.0 + provider.price);

    let settings = deps.store.table(SETTINGS_TABLE).get("node").await.unwrap().unwrap();
    assert_eq!(settings["apiKey"], json!(key.key));
    assert_eq!(settings["provider"], json!("provider-2"));
}

#[tokio::test(start_paused = true)]
async fn api_key_failures_retry_from_the_right_step() {
    let (node, deps) = setup();
    node.fail("provider_list", RpcError::server("provider list unavailable"));
    node.set_balance(&deps.address(), 5.0);
    let flow = create(api_key::definition(&deps), ApiKeyContext::default()).unwrap();

    flow.wait_for_state("failure").await.unwrap();
    node.recover("provider_list");
    flow.send("RETRY");
    flow.wait_for_state("editing").await.unwrap();

    flow.send("BUY");
    let snapshot = flow
        .wait_for(|s| s.matches("failure") && s.context.error.is_some())
        .await
        .unwrap();
    assert!(snapshot.context.error.as_deref().unwrap().contains("Insufficient balance"));
    assert_eq!(node.calls("provider_list"), 2);

    node.set_balance(&deps.address(), 100.0);
    flow.send("RETRY");
    let snapshot = flow.wait_for(|s| s.done).await.unwrap();
    assert_eq!(snapshot.context.api_key.unwrap().provider, "provider-1");
    assert_eq!(node.calls("provider_list"), 2);
}

#[tokio::test(start_paused = true)]
async fn paid_key_is_retried_without_paying_again() {
    let (node, deps) = setup();
    node.fail("provider_getApiKey", RpcError::server("provider is offline"));
    let flow = create(api_key::definition(&deps), ApiKeyContext::default()).unwrap();

    flow.wait_for_state("editing").await.unwrap();
    flow.send("BUY");
    let snapshot = flow
        .wait_for(|s| s.matches("failure") && s.context.error.is_some())
        .await
        .unwrap();
    let hash = snapshot.context.tx_hash.clone().unwrap();

    flow.send("EDIT");
    node.recover("provider_getApiKey");
    flow.send("RETRY");
    let snapshot = flow.wait_for(|s| s.done).await.unwrap();
    assert!(snapshot.matches("success"));
    assert_eq!(snapshot.context.tx_hash.as_deref(), Some(hash.as_str()));
    assert!(!snapshot.history.iter().any(|r| r.event == "EDIT"));

    let provider = node.providers().into_iter().find(|p| p.id == "provider-1").unwrap();
    let payments = node
        .transactions()
        .into_iter()
        .filter(|tx| tx.kind == TxKind::Send && tx.to.as_deref() == Some(provider.address.as_str()))
        .count();
    assert_eq!(payments, 1);
    assert_eq!(node.balance(&deps.address()), 1000.0 - provider.price);
}
