//! Scripted runs of the shipped flows against a simulated node

use crate::config::Config;
use anyhow::Result;
use base64::Engine;
use colored::Colorize;
use idn_adapters::{SigningKey, SimNode, TxKind};
use idn_flows::ad::{self, Ad};
use idn_flows::flip::{self, IMAGE_COUNT};
use idn_flows::{
    AdContext, AdStatus, ApiKeyContext, Drafts, FlipContext, FlowDeps, FlowKind, InviteContext,
    MiningContext, api_key, invite, mining,
};
use idn_workflow::{
    Event, Interpreter, MachineContext, PollPolicy, Snapshot, Subscription, TransitionRecord,
    WorkflowResult, create,
};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::{error::Elapsed, timeout};
use tracing::{debug, info};

/// Outcome of one scripted run
#[derive(Debug, Serialize)]
pub struct Report {
    pub flow: String,
    pub state: String,
    pub done: bool,
    pub timed_out: bool,
    pub error: Option<String>,
    pub history: Vec<TransitionRecord>,
    pub transactions: Vec<TxKind>,
    pub context: Value,
}

/// Simulated node and flow dependencies shaped by `[simulation]`
pub fn environment(config: &Config) -> (Arc<SimNode>, FlowDeps) {
    let sim = &config.simulation;
    let node = Arc::new(
        SimNode::new()
            .with_mine_after(sim.mine_after)
            .with_epoch(sim.epoch)
            .with_default_balance(sim.balance)
            .with_latency(Duration::from_millis(sim.latency_ms)),
    );
    let interval = Duration::from_millis(sim.poll_interval_ms);
    let poll = PollPolicy {
        interval,
        max_interval: interval,
        backoff: 1.0,
        ..config.poll.policy()
    };
    let deps = FlowDeps::in_memory(node.clone())
        .with_store(config.store.open())
        .with_poll(poll);
    (node, deps)
}

pub async fn run(kind: FlowKind, config: &Config) -> Result<Report> {
    let (node, deps) = environment(config);
    let limit = Duration::from_secs(config.simulation.timeout_secs);
    info!(flow = %kind, address = %deps.address(), "Starting simulation");

    let mut report = match kind {
        FlowKind::Flip => run_flip(&deps, limit).await?,
        FlowKind::Ad => run_ad(&deps, limit).await?,
        FlowKind::Mining => run_mining(&deps, limit).await?,
        FlowKind::Invite => run_invite(&deps, limit).await?,
        FlowKind::ApiKey => run_api_key(&deps, limit).await?,
    };
    report.transactions = node.transactions().iter().map(|tx| tx.kind).collect();
    Ok(report)
}

async fn run_flip(deps: &FlowDeps, limit: Duration) -> Result<Report> {
    let images = (0..IMAGE_COUNT as u8).map(|seed| {
        base64::engine::general_purpose::STANDARD.encode([seed; 16])
    });
    let flow = create(flip::definition(deps), FlipContext::new(0).with_images(images))?;
    let _trace = trace(&flow);

    let script = async {
        let snapshot = settle(
            &flow,
            &[
                "keywords.loaded.fetchedTranslations",
                "keywords.loaded.fetchTranslationsFailed",
                "keywords.failure",
            ],
        )
        .await?;
        if snapshot.matches("keywords.failure") {
            return Ok(snapshot);
        }
        flow.send("NEXT");
        flow.send("NEXT");
        flow.send("SHUFFLE");
        flow.send("NEXT");
        flow.send("SUBMIT");
        settle(&flow, &["submit.success", "submit.failure"]).await
    };
    finish(&flow, timeout(limit, script).await)
}

async fn run_ad(deps: &FlowDeps, limit: Duration) -> Result<Report> {
    let draft = Ad::new("Idena", "https://idena.io");
    let id = draft.id.clone();
    Drafts::<Ad>::new(deps.store.as_ref()).save(&draft).await?;

    let flow = create(ad::definition(deps), AdContext::default())?;
    let _trace = trace(&flow);

    let has_status = |snapshot: &Snapshot<AdContext>, status: AdStatus| {
        snapshot.matches("ready.idle")
            && snapshot.context.ad(&id).is_some_and(|ad| ad.status == status)
    };

    let script = async {
        settle(&flow, &["ready.idle", "failure"]).await?;
        flow.send(Event::with_payload("SEND_AD_TO_REVIEW", json!({ "id": id })));
        flow.send(Event::with_payload("SUBMIT", json!({ "amount": 10 })));

        let snapshot = flow
            .wait_for(|s| {
                has_status(s, AdStatus::Reviewing)
                    || s.matches("ready.sendToReview.failed")
                    || s.matches("ready.sendToReview.miningFailed")
            })
            .await?;
        if !snapshot.matches("ready.idle") {
            return Ok(snapshot);
        }

        flow.send(Event::with_payload(
            "VOTING_FINISHED",
            json!({ "id": id, "approved": true }),
        ));
        flow.wait_for(|s| has_status(s, AdStatus::Approved)).await
    };
    finish(&flow, timeout(limit, script).await)
}

async fn run_mining(deps: &FlowDeps, limit: Duration) -> Result<Report> {
    let flow = create(mining::definition(deps), MiningContext::default())?;
    let _trace = trace(&flow);

    let script = async {
        let snapshot = settle(&flow, &["offline", "online", "delegated", "failure"]).await?;
        if !snapshot.matches("offline") {
            return Ok(snapshot);
        }
        flow.send(Event::with_payload("ACTIVATE", json!({ "mode": "miner" })));
        let snapshot = settle(&flow, &["online", "activating.failed"]).await?;
        if !snapshot.matches("online") {
            return Ok(snapshot);
        }
        flow.send("DEACTIVATE");
        settle(&flow, &["offline", "deactivating.failed"]).await
    };
    finish(&flow, timeout(limit, script).await)
}

async fn run_invite(deps: &FlowDeps, limit: Duration) -> Result<Report> {
    let invitation = SigningKey::generate();
    let flow = create(invite::definition(deps), InviteContext::default())?;
    let _trace = trace(&flow);

    let script = async {
        settle(&flow, &["editing"]).await?;
        flow.send(Event::with_payload(
            "CHANGE_CODE",
            json!({ "code": invitation.to_hex() }),
        ));
        flow.send("ACTIVATE");
        settle(&flow, &["success", "failure"]).await
    };
    finish(&flow, timeout(limit, script).await)
}

async fn run_api_key(deps: &FlowDeps, limit: Duration) -> Result<Report> {
    let flow = create(api_key::definition(deps), ApiKeyContext::default())?;
    let _trace = trace(&flow);

    let script = async {
        let snapshot = settle(&flow, &["editing", "failure"]).await?;
        if snapshot.matches("failure") {
            return Ok(snapshot);
        }
        flow.send("BUY");
        settle(&flow, &["success", "failure"]).await
    };
    finish(&flow, timeout(limit, script).await)
}

/// Wait until the instance reaches any of `patterns`
async fn settle<C: MachineContext>(
    flow: &Interpreter<C>,
    patterns: &[&str],
) -> WorkflowResult<Snapshot<C>> {
    flow.wait_for(|snapshot| patterns.iter().any(|pattern| snapshot.matches(pattern)))
        .await
}

/// Log transitions as they are published
fn trace<C: MachineContext>(flow: &Interpreter<C>) -> Subscription {
    let machine = flow.machine_id().to_string();
    let seen = AtomicUsize::new(flow.snapshot().history.len());
    flow.subscribe(move |snapshot| {
        let from = seen.swap(snapshot.history.len(), Ordering::Relaxed);
        for record in snapshot.history.iter().skip(from) {
            debug!(flow = %machine, event = %record.event, from = %record.from, to = %record.to, "Transition");
        }
    })
}

fn finish<C: MachineContext + Serialize>(
    flow: &Interpreter<C>,
    outcome: Result<WorkflowResult<Snapshot<C>>, Elapsed>,
) -> Result<Report> {
    let (snapshot, timed_out) = match outcome {
        Ok(result) => (result?, false),
        Err(_) => (flow.snapshot(), true),
    };
    flow.stop();

    let context = serde_json::to_value(&snapshot.context)?;
    let error = context
        .get("error")
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(Report {
        flow: flow.machine_id().to_string(),
        state: snapshot.value.to_string(),
        done: snapshot.done,
        timed_out,
        error,
        history: snapshot.history,
        transactions: Vec::new(),
        context,
    })
}

pub fn print_report(report: &Report, show_context: bool) {
    println!("{} {}", "Simulating".bold(), report.flow.cyan().bold());
    println!();

    for record in &report.history {
        println!(
            "  {} {} {} {}",
            record.from.to_string().dimmed(),
            format!("--{}-->", record.event).yellow(),
            record.to.to_string().bold(),
            record.at.format("%H:%M:%S%.3f").to_string().dimmed()
        );
    }
    println!();

    if !report.transactions.is_empty() {
        let kinds: Vec<String> = report
            .transactions
            .iter()
            .map(|kind| format!("{:?}", kind))
            .collect();
        println!("{} {}", "Transactions:".bold(), kinds.join(", "));
    }

    if report.timed_out {
        println!(
            "{} stuck in {}",
            "✗ Timed out".red().bold(),
            report.state.red()
        );
    } else if let Some(error) = &report.error {
        println!("{} in {}: {}", "✗ Stopped".red().bold(), report.state.red(), error.red());
    } else {
        println!("{} {}", "✓ Reached".green().bold(), report.state.green());
    }

    if show_context {
        println!();
        match serde_json::to_string_pretty(&report.context) {
            Ok(context) => println!("{}", context),
            Err(e) => eprintln!("Failed to render context: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn simulate(kind: FlowKind) -> Report {
        let _ = tracing_subscriber::fmt::try_init();
        run(kind, &Config::default()).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn flip_is_published() {
        let report = simulate(FlowKind::Flip).await;
        assert_eq!(report.state, "submit.success");
        assert_eq!(report.transactions, vec![TxKind::SubmitFlip]);
        assert!(report.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ad_is_reviewed_and_approved() {
        let report = simulate(FlowKind::Ad).await;
        assert_eq!(report.state, "ready.idle");
        assert_eq!(
            report.transactions,
            vec![TxKind::DeployContract, TxKind::CallContract]
        );
        assert!(report.history.iter().any(|r| r.event == "VOTING_FINISHED"));
    }

    #[tokio::test(start_paused = true)]
    async fn miner_round_trip() {
        let report = simulate(FlowKind::Mining).await;
        assert_eq!(report.state, "offline");
        assert_eq!(report.transactions.len(), 2);
        assert_eq!(report.context["online"], json!(false));
    }

    #[tokio::test(start_paused = true)]
    async fn onboarding_flows_finish() {
        for kind in [FlowKind::Invite, FlowKind::ApiKey] {
            let report = simulate(kind).await;
            assert!(report.done, "{} ended in {}", kind, report.state);
            assert_eq!(report.state, "success");
            assert!(!report.timed_out);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_node_times_out() {
        let mut config = Config::default();
        config.simulation.mine_after = u32::MAX;
        config.simulation.timeout_secs = 5;
        let report = run(FlowKind::Invite, &config).await.unwrap();
        assert!(report.timed_out);
        assert_eq!(report.state, "mining");
    }
}
