//! Poll-until-mined sub-flow
//!
//! Every flow that sends a transaction follows it with a state bound to
//! [`WaitForMining`], built with [`mining_state`]. The effect polls the node
//! until the transaction is included and then emits exactly one of
//! [`MINED`], [`MINING_FAILED`], [`TX_NULL`] or [`TIMEOUT`].

use crate::deps::FlowDeps;
use crate::error::FlowResult;
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use idn_adapters::Node;
use idn_workflow::{
    Effect, EffectError, EffectResult, EffectScope, Event, MachineContext, PollPolicy, State,
    Transition, poll_until,
};
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const MINED: &str = "MINED";
pub const MINING_FAILED: &str = "MINING_FAILED";
pub const TX_NULL: &str = "TX_NULL";
pub const TIMEOUT: &str = "TIMEOUT";

type TxHashGetter<C> = Arc<dyn Fn(&C) -> Option<String> + Send + Sync>;

/// Async hook receiving the context and the transaction hash
pub type MiningHook<C> = Arc<dyn Fn(C, String) -> BoxFuture<'static, FlowResult<()>> + Send + Sync>;

#[derive(Debug, PartialEq)]
enum Inclusion {
    Mined { contract: Option<String> },
    Failed(String),
    Missing,
}

/// Effect polling the node for the transaction named by the context
pub struct WaitForMining<C> {
    node: Node,
    policy: PollPolicy,
    tx_hash: TxHashGetter<C>,
    on_mined: Option<MiningHook<C>>,
    on_failed: Option<MiningHook<C>>,
}

impl<C: MachineContext> WaitForMining<C> {
    pub fn new<F>(deps: &FlowDeps, tx_hash: F) -> Self
    where
        F: Fn(&C) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            node: deps.node.clone(),
            policy: deps.poll,
            tx_hash: Arc::new(tx_hash),
            on_mined: None,
            on_failed: None,
        }
    }

    /// Commit hook run before `MINED` is emitted; its failure fails the effect
    pub fn on_mined<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(C, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FlowResult<()>> + Send + 'static,
    {
        self.on_mined = Some(Arc::new(move |ctx, hash| hook(ctx, hash).boxed()));
        self
    }

    /// Hook run before any of the failure events is emitted
    pub fn on_failed<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(C, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FlowResult<()>> + Send + 'static,
    {
        self.on_failed = Some(Arc::new(move |ctx, hash| hook(ctx, hash).boxed()));
        self
    }

    async fn check(&self, hash: &str) -> FlowResult<Option<Inclusion>> {
        let Some(tx) = self.node.transaction(hash).await? else {
            return Ok(Some(Inclusion::Missing));
        };
        if !tx.is_mined() {
            return Ok(None);
        }
        Ok(Some(match self.node.receipt(hash).await? {
            Some(receipt) if !receipt.success => Inclusion::Failed(
                receipt
                    .error
                    .unwrap_or_else(|| "transaction reverted".to_string()),
            ),
            receipt => Inclusion::Mined {
                contract: receipt.and_then(|r| r.contract),
            },
        }))
    }

    async fn run_hook(hook: &Option<MiningHook<C>>, ctx: &C, hash: &str) -> Result<(), EffectError> {
        match hook {
            Some(hook) => hook(ctx.clone(), hash.to_string()).await.map_err(EffectError::from),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<C: MachineContext> Effect<C> for WaitForMining<C> {
    async fn run(&self, scope: EffectScope<C>) -> EffectResult {
        let Some(hash) = (self.tx_hash)(&scope.context) else {
            warn!("No transaction hash to wait for");
            scope.emit(Event::new(TX_NULL));
            return Ok(Value::Null);
        };

        debug!(hash = %hash, "Waiting for transaction");
        let pending = hash.as_str();
        let outcome = poll_until(&self.policy, scope.token(), |attempt| async move {
            match self.check(pending).await {
                Ok(inclusion) => Ok(inclusion),
                Err(err) => {
                    warn!(attempt, hash = pending, error = %err, "Mining status check failed");
                    Ok(None)
                }
            }
        })
        .await;

        let event = match outcome {
            Ok(Inclusion::Mined { contract }) => {
                Self::run_hook(&self.on_mined, &scope.context, &hash).await?;
                info!(hash = %hash, "Transaction mined");
                Event::with_payload(MINED, json!({ "hash": hash, "contract": contract }))
            }
            Ok(Inclusion::Failed(error)) => {
                Self::run_hook(&self.on_failed, &scope.context, &hash).await?;
                warn!(hash = %hash, error = %error, "Transaction failed");
                Event::with_payload(MINING_FAILED, json!({ "hash": hash, "error": error }))
            }
            Ok(Inclusion::Missing) => {
                Self::run_hook(&self.on_failed, &scope.context, &hash).await?;
                warn!(hash = %hash, "Transaction unknown to the node");
                Event::with_payload(TX_NULL, json!({ "hash": hash }))
            }
            Err(EffectError::Timeout { elapsed }) => {
                Self::run_hook(&self.on_failed, &scope.context, &hash).await?;
                warn!(hash = %hash, elapsed_ms = elapsed.as_millis() as u64, "Gave up waiting for transaction");
                Event::with_payload(
                    TIMEOUT,
                    json!({ "hash": hash, "elapsedMs": elapsed.as_millis() as u64 }),
                )
            }
            Err(err) => return Err(err),
        };

        scope.emit(event);
        Ok(Value::Null)
    }
}

/// Atomic state invoking `effect`, leaving through `mined` or `failed`
pub fn mining_state<C: MachineContext>(
    effect: &str,
    mined: Transition<C>,
    failed: Transition<C>,
) -> State<C> {
    branching_mining_state(effect, vec![mined], failed)
}

/// Like [`mining_state`], with `MINED` handled by the first of `mined` whose guard passes
pub fn branching_mining_state<C: MachineContext>(
    effect: &str,
    mined: Vec<Transition<C>>,
    failed: Transition<C>,
) -> State<C> {
    let state = mined
        .into_iter()
        .fold(State::atomic().invoke(effect), |state, transition| {
            state.on(MINED, transition)
        });
    state
        .on(MINING_FAILED, failed.clone())
        .on(TX_NULL, failed.clone())
        .on(TIMEOUT, failed.clone())
        .on_error(failed)
}

/// Human-readable reason carried by a failure event
pub fn failure_reason(event: &Event) -> String {
    match event.name.as_str() {
        MINING_FAILED => event
            .str_field("error")
            .unwrap_or("Mining failed")
            .to_string(),
        TX_NULL => "Transaction was not found".to_string(),
        TIMEOUT => "Timed out waiting for the transaction".to_string(),
        _ => event
            .error_message()
            .map(str::to_string)
            .unwrap_or_else(|| event.name.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idn_adapters::{RpcError, SimNode, TxKind, TxOutcome, TxParams};
    use idn_workflow::{Interpreter, Machine, create};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, Default)]
    struct Ctx {
        hash: Option<String>,
        contract: Option<String>,
        reason: Option<String>,
    }

    fn setup(mine_after: u32) -> (Arc<SimNode>, FlowDeps) {
        let node = Arc::new(SimNode::new().with_mine_after(mine_after));
        let deps = FlowDeps::in_memory(node.clone()).with_poll(
            PollPolicy::fixed(Duration::from_secs(1)).with_deadline(Duration::from_secs(20)),
        );
        (node, deps)
    }

    fn start(hash: Option<String>, effect: WaitForMining<Ctx>) -> Interpreter<Ctx> {
        let failed = Transition::to("failed").assign(|c: &mut Ctx, e| c.reason = Some(failure_reason(e)));
        let machine = Machine::builder("watch")
            .initial("mining")
            .state(
                "mining",
                mining_state(
                    "wait",
                    Transition::to("mined").assign(|c: &mut Ctx, e| {
                        c.contract = e.str_field("contract").map(str::to_string);
                    }),
                    failed,
                ),
            )
            .state("mined", State::atomic())
            .state("failed", State::atomic())
            .effect("wait", effect);
        create(
            machine,
            Ctx {
                hash,
                ..Ctx::default()
            },
        )
        .unwrap()
    }

    async fn send(deps: &FlowDeps) -> String {
        deps.send_tx(TxParams::new(TxKind::Send).to("0xbob").amount(1.0))
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn runs_commit_hook_before_mined() {
        let _ = tracing_subscriber::fmt::try_init();
        let (node, deps) = setup(3);
        let hash = send(&deps).await;

        let commits = Arc::new(AtomicUsize::new(0));
        let counter = commits.clone();
        let effect = WaitForMining::new(&deps, |c: &Ctx| c.hash.clone()).on_mined(move |_, _| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let interpreter = start(Some(hash), effect);

        interpreter.wait_for_state("mined").await.unwrap();
        assert_eq!(commits.load(Ordering::SeqCst), 1);
        assert_eq!(node.calls("bcn_transaction"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_receipt_emits_mining_failed() {
        let _ = tracing_subscriber::fmt::try_init();
        let (node, deps) = setup(1);
        node.script_outcome(TxOutcome::Failed("out of gas".into()));
        let hash = send(&deps).await;

        let interpreter = start(Some(hash), WaitForMining::new(&deps, |c: &Ctx| c.hash.clone()));
        let snapshot = interpreter.wait_for_state("failed").await.unwrap();
        assert_eq!(snapshot.context.reason.as_deref(), Some("out of gas"));
        assert_eq!(snapshot.history.last().unwrap().event, MINING_FAILED);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_transaction_emits_tx_null() {
        let _ = tracing_subscriber::fmt::try_init();
        let (node, deps) = setup(1);
        node.script_outcome(TxOutcome::Dropped);
        let hash = send(&deps).await;

        let interpreter = start(Some(hash), WaitForMining::new(&deps, |c: &Ctx| c.hash.clone()));
        let snapshot = interpreter.wait_for_state("failed").await.unwrap();
        assert_eq!(snapshot.history.last().unwrap().event, TX_NULL);

        let interpreter = start(None, WaitForMining::new(&deps, |c: &Ctx| c.hash.clone()));
        let snapshot = interpreter.wait_for_state("failed").await.unwrap();
        assert_eq!(snapshot.history.last().unwrap().event, TX_NULL);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_deadline() {
        let _ = tracing_subscriber::fmt::try_init();
        let (node, deps) = setup(1_000);
        let hash = send(&deps).await;

        let failures = Arc::new(AtomicUsize::new(0));
        let counter = failures.clone();
        let effect = WaitForMining::new(&deps, |c: &Ctx| c.hash.clone()).on_failed(move |_, _| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let interpreter = start(Some(hash), effect);
        let snapshot = interpreter.wait_for_state("failed").await.unwrap();
        assert_eq!(snapshot.history.last().unwrap().event, TIMEOUT);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert!(node.calls("bcn_transaction") >= 20);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_keep_polling() {
        let _ = tracing_subscriber::fmt::try_init();
        let (node, deps) = setup(1);
        let hash = send(&deps).await;
        node.fail("bcn_transaction", RpcError::server("node restarting"));

        let interpreter = start(Some(hash), WaitForMining::new(&deps, |c: &Ctx| c.hash.clone()));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(interpreter.state(), "mining");

        node.recover("bcn_transaction");
        interpreter.wait_for_state("mined").await.unwrap();
    }
}
