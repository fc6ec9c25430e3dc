//! Scripted in-memory node
//!
//! Accepts transactions produced by the dev signer, mines them after a fixed
//! number of status polls and applies their effect to balances and
//! identities. Failures can be injected per method.

use crate::error::RpcError;
use crate::rpc::{Identity, Keyword, Provider, RpcClient};
use crate::tx::{RawTransaction, SignedTransaction, TxKind, hash_bytes};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, info};

/// What happens to a transaction once it is accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    Mined,
    /// Included in a block with a failed receipt
    Failed(String),
    /// Forgotten by the node; lookups return null
    Dropped,
}

struct SimTx {
    raw: RawTransaction,
    outcome: TxOutcome,
    polls: u32,
    applied: bool,
}

struct SimState {
    epoch: u64,
    mine_after: u32,
    default_balance: f64,
    balances: HashMap<String, f64>,
    nonces: HashMap<String, u64>,
    identities: HashMap<String, Identity>,
    scripted: VecDeque<TxOutcome>,
    txs: HashMap<String, SimTx>,
    order: Vec<String>,
    failures: HashMap<String, RpcError>,
    calls: HashMap<String, usize>,
    vocabulary: Vec<(String, String)>,
    providers: Vec<Provider>,
    deployed: u64,
}

pub struct SimNode {
    state: Mutex<SimState>,
    latency: Duration,
}

impl Default for SimNode {
    fn default() -> Self {
        Self::new()
    }
}

impl SimNode {
    pub fn new() -> Self {
        let vocabulary = [
            ("tree", "A woody plant"),
            ("clock", "Shows the time"),
            ("river", "Flowing water"),
            ("ladder", "Used for climbing"),
            ("piano", "Keyboard instrument"),
            ("rocket", "Flies to space"),
            ("bread", "Baked food"),
            ("anchor", "Holds a ship in place"),
        ]
        .into_iter()
        .map(|(name, desc)| (name.to_string(), desc.to_string()))
        .collect();

        let providers = (1..=2)
            .map(|n| Provider {
                id: format!("provider-{}", n),
                url: format!("https://provider-{}.example", n),
                address: hash_bytes(format!("provider-{}", n).as_bytes())[..42].to_string(),
                price: 10.0 * n as f64,
                slots: 5,
            })
            .collect();

        Self {
            state: Mutex::new(SimState {
                epoch: 100,
                mine_after: 2,
                default_balance: 1000.0,
                balances: HashMap::new(),
                nonces: HashMap::new(),
                identities: HashMap::new(),
                scripted: VecDeque::new(),
                txs: HashMap::new(),
                order: Vec::new(),
                failures: HashMap::new(),
                calls: HashMap::new(),
                vocabulary,
                providers,
                deployed: 0,
            }),
            latency: Duration::ZERO,
        }
    }

    /// Number of status polls after which a transaction counts as mined
    pub fn with_mine_after(self, polls: u32) -> Self {
        self.state.lock().mine_after = polls;
        self
    }

    pub fn with_epoch(self, epoch: u64) -> Self {
        self.state.lock().epoch = epoch;
        self
    }

    /// Balance of every account without an explicit one
    pub fn with_default_balance(self, balance: f64) -> Self {
        self.state.lock().default_balance = balance;
        self
    }

    /// Delay applied to every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    pub fn set_epoch(&self, epoch: u64) {
        self.state.lock().epoch = epoch;
    }

    pub fn set_balance(&self, address: &str, balance: f64) {
        self.state.lock().balances.insert(address.to_string(), balance);
    }

    pub fn balance(&self, address: &str) -> f64 {
        self.state.lock().balance(address)
    }

    pub fn set_identity(&self, identity: Identity) {
        self.state
            .lock()
            .identities
            .insert(identity.address.clone(), identity);
    }

    pub fn identity(&self, address: &str) -> Identity {
        self.state.lock().identity(address)
    }

    /// Fail every call to `method` until [`SimNode::recover`]
    pub fn fail(&self, method: &str, error: RpcError) {
        self.state.lock().failures.insert(method.to_string(), error);
    }

    pub fn recover(&self, method: &str) {
        self.state.lock().failures.remove(method);
    }

    /// Outcome for the next accepted transaction; later ones are mined
    pub fn script_outcome(&self, outcome: TxOutcome) {
        self.state.lock().scripted.push_back(outcome);
    }

    /// How often `method` has been called, failed calls included
    pub fn calls(&self, method: &str) -> usize {
        self.state.lock().calls.get(method).copied().unwrap_or(0)
    }

    /// Accepted transactions in submission order
    pub fn transactions(&self) -> Vec<RawTransaction> {
        let state = self.state.lock();
        state
            .order
            .iter()
            .filter_map(|hash| state.txs.get(hash).map(|tx| tx.raw.clone()))
            .collect()
    }

    pub fn providers(&self) -> Vec<Provider> {
        self.state.lock().providers.clone()
    }
}

#[async_trait]
impl RpcClient for SimNode {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut state = self.state.lock();
        *state.calls.entry(method.to_string()).or_default() += 1;
        if let Some(error) = state.failures.get(method) {
            debug!(method, "Injected failure");
            return Err(error.clone());
        }
        state.handle(method, &params)
    }
}

fn param<'a>(params: &'a [Value], index: usize) -> Result<&'a Value, RpcError> {
    params
        .get(index)
        .ok_or_else(|| RpcError::new(RpcError::INVALID_PARAMS, format!("missing parameter {}", index)))
}

fn str_param(params: &[Value], index: usize) -> Result<&str, RpcError> {
    param(params, index)?
        .as_str()
        .ok_or_else(|| RpcError::new(RpcError::INVALID_PARAMS, format!("parameter {} must be a string", index)))
}

fn u64_param(params: &[Value], index: usize) -> Result<u64, RpcError> {
    param(params, index)?
        .as_u64()
        .ok_or_else(|| RpcError::new(RpcError::INVALID_PARAMS, format!("parameter {} must be a number", index)))
}

impl SimState {
    fn handle(&mut self, method: &str, params: &[Value]) -> Result<Value, RpcError> {
        match method {
            "dna_epoch" => Ok(json!({ "epoch": self.epoch, "nextValidation": null })),
            "dna_getBalance" => {
                let address = str_param(params, 0)?;
                Ok(json!({
                    "balance": self.balance(address).to_string(),
                    "stake": "0",
                    "nonce": self.nonces.get(address).copied().unwrap_or(0),
                }))
            }
            "dna_identity" => {
                let identity = self.identity(str_param(params, 0)?);
                serde_json::to_value(identity).map_err(|e| RpcError::server(e.to_string()))
            }
            "bcn_sendRawTx" => self.accept(str_param(params, 0)?).map(Value::String),
            "bcn_transaction" => {
                let hash = str_param(params, 0)?;
                Ok(match self.poll(hash) {
                    None => Value::Null,
                    Some(true) => json!({ "hash": hash, "blockHash": hash_bytes(hash.as_bytes()) }),
                    Some(false) => json!({ "hash": hash, "blockHash": null }),
                })
            }
            "bcn_txReceipt" => {
                let hash = str_param(params, 0)?;
                let mine_after = self.mine_after;
                Ok(match self.txs.get(hash) {
                    Some(tx) if tx.outcome != TxOutcome::Dropped && tx.polls >= mine_after => {
                        let contract = (tx.raw.kind == TxKind::DeployContract)
                            .then(|| hash_bytes(&tx.raw.payload)[..42].to_string());
                        match &tx.outcome {
                            TxOutcome::Failed(error) => {
                                json!({ "success": false, "error": error, "contract": contract })
                            }
                            _ => json!({ "success": true, "error": null, "contract": contract }),
                        }
                    }
                    _ => Value::Null,
                })
            }
            "contract_estimateDeploy" => {
                let args = param(params, 0)?;
                self.deployed += 1;
                let seed = format!("{}:{}", args, self.deployed);
                Ok(json!({
                    "contract": hash_bytes(seed.as_bytes())[..42].to_string(),
                    "gasCost": "0.5",
                    "txFee": "0.1",
                }))
            }
            "flip_words" => {
                let pair = u64_param(params, 0)? as usize;
                let size = self.vocabulary.len();
                let words: Vec<Keyword> = [2 * pair % size, (2 * pair + 1) % size]
                    .into_iter()
                    .map(|index| Keyword {
                        id: index as u32,
                        name: self.vocabulary[index].0.clone(),
                        desc: self.vocabulary[index].1.clone(),
                    })
                    .collect();
                Ok(json!({ "id": pair, "words": words }))
            }
            "flip_wordTranslations" => {
                let word = u64_param(params, 0)? as usize;
                let (name, desc) = self
                    .vocabulary
                    .get(word)
                    .cloned()
                    .ok_or_else(|| RpcError::server(format!("unknown word {}", word)))?;
                Ok(json!([
                    { "id": format!("{}-1", word), "name": name, "desc": desc, "confirmed": true }
                ]))
            }
            "flip_submit" => {
                let args = param(params, 0)?;
                let tx = args
                    .get("tx")
                    .and_then(Value::as_str)
                    .ok_or_else(|| RpcError::new(RpcError::INVALID_PARAMS, "missing tx"))?;
                let cid = args.get("cid").and_then(Value::as_str).unwrap_or_default().to_string();
                let hash = self.accept(tx)?;
                Ok(json!({ "txHash": hash, "hash": cid }))
            }
            "provider_list" => {
                serde_json::to_value(&self.providers).map_err(|e| RpcError::server(e.to_string()))
            }
            "provider_getApiKey" => {
                let provider_id = str_param(params, 0)?;
                let hash = str_param(params, 1)?;
                let provider = self
                    .providers
                    .iter()
                    .find(|p| p.id == provider_id)
                    .cloned()
                    .ok_or_else(|| RpcError::server(format!("unknown provider {}", provider_id)))?;
                let paid = self.txs.get(hash).is_some_and(|tx| {
                    tx.raw.kind == TxKind::Send
                        && tx.raw.to.as_deref() == Some(provider.address.as_str())
                        && tx.raw.amount >= provider.price
                });
                if !paid {
                    return Err(RpcError::server("payment not found"));
                }
                Ok(match self.poll(hash) {
                    Some(true) => json!({
                        "key": format!("key-{}", &hash[2..18]),
                        "provider": provider.id,
                        "epoch": self.epoch,
                    }),
                    _ => Value::Null,
                })
            }
            _ => Err(RpcError::new(
                RpcError::METHOD_NOT_FOUND,
                format!("method {} not found", method),
            )),
        }
    }

    fn balance(&self, address: &str) -> f64 {
        self.balances
            .get(address)
            .copied()
            .unwrap_or(self.default_balance)
    }

    fn identity(&self, address: &str) -> Identity {
        self.identities.get(address).cloned().unwrap_or_else(|| Identity {
            address: address.to_string(),
            state: "Verified".to_string(),
            online: false,
            delegatee: None,
            delegation_epoch: None,
        })
    }

    fn accept(&mut self, encoded: &str) -> Result<String, RpcError> {
        let signed = SignedTransaction::from_hex(encoded)
            .map_err(|e| RpcError::new(RpcError::INVALID_PARAMS, e.to_string()))?;
        let hash = signed.hash().map_err(|e| RpcError::server(e.to_string()))?;
        if self.txs.contains_key(&hash) {
            return Err(RpcError::server("transaction already known"));
        }

        let raw = signed.raw;
        if let Some(from) = &raw.from {
            if self.balance(from) < raw.amount + raw.max_fee {
                return Err(RpcError::server("insufficient funds"));
            }
            *self.nonces.entry(from.clone()).or_default() += 1;
        }

        let outcome = self.scripted.pop_front().unwrap_or(TxOutcome::Mined);
        info!(hash = %hash, kind = ?raw.kind, outcome = ?outcome, "Accepted transaction");
        self.order.push(hash.clone());
        self.txs.insert(
            hash.clone(),
            SimTx {
                raw,
                outcome,
                polls: 0,
                applied: false,
            },
        );
        Ok(hash)
    }

    /// Count a status poll. `None` for unknown or dropped transactions,
    /// otherwise whether the transaction is mined.
    fn poll(&mut self, hash: &str) -> Option<bool> {
        let mine_after = self.mine_after;
        let tx = self.txs.get_mut(hash)?;
        if tx.outcome == TxOutcome::Dropped {
            return None;
        }
        tx.polls += 1;
        if tx.polls < mine_after {
            return Some(false);
        }
        if !tx.applied {
            tx.applied = true;
            if tx.outcome == TxOutcome::Mined {
                let raw = tx.raw.clone();
                self.apply(&raw);
            }
        }
        Some(true)
    }

    fn apply(&mut self, raw: &RawTransaction) {
        let epoch = self.epoch;
        let from = raw.from.clone().unwrap_or_default();
        if !from.is_empty() {
            let balance = self.balance(&from) - raw.amount;
            self.balances.insert(from.clone(), balance);
        }

        match raw.kind {
            TxKind::Send => {
                if let Some(to) = &raw.to {
                    let balance = self.balance(to) + raw.amount;
                    self.balances.insert(to.clone(), balance);
                }
            }
            TxKind::OnlineStatus => {
                let online = serde_json::from_slice::<Value>(&raw.payload)
                    .ok()
                    .and_then(|payload| payload.get("online").and_then(Value::as_bool))
                    .unwrap_or(false);
                let mut identity = self.identity(&from);
                identity.online = online;
                self.identities.insert(from, identity);
            }
            TxKind::Delegate => {
                let mut identity = self.identity(&from);
                identity.delegatee = raw.to.clone();
                identity.delegation_epoch = Some(epoch);
                identity.online = false;
                self.identities.insert(from, identity);
            }
            TxKind::Undelegate => {
                let mut identity = self.identity(&from);
                identity.delegatee = None;
                identity.delegation_epoch = Some(epoch);
                self.identities.insert(from, identity);
            }
            TxKind::Activation => {
                if let Some(to) = &raw.to {
                    let mut identity = self.identity(to);
                    identity.state = "Candidate".to_string();
                    self.identities.insert(to.clone(), identity);
                }
            }
            TxKind::SubmitFlip
            | TxKind::ChangeProfile
            | TxKind::DeployContract
            | TxKind::CallContract => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::{DevTransactionBuilder, SigningKey, TransactionBuilder, TxParams};

    fn signed_send(key: &SigningKey, to: &str, amount: f64) -> String {
        let builder = DevTransactionBuilder;
        let raw = builder
            .build(TxParams::new(TxKind::Send).to(to).amount(amount))
            .unwrap();
        builder.sign(raw, key).unwrap().to_hex().unwrap()
    }

    #[tokio::test]
    async fn mines_after_configured_polls() {
        let node = SimNode::new().with_mine_after(3);
        let key = SigningKey::generate();
        let hash = node
            .call("bcn_sendRawTx", vec![json!(signed_send(&key, "0xbob", 10.0))])
            .await
            .unwrap();

        for _ in 0..2 {
            let tx = node.call("bcn_transaction", vec![hash.clone()]).await.unwrap();
            assert!(tx["blockHash"].is_null());
        }
        let tx = node.call("bcn_transaction", vec![hash.clone()]).await.unwrap();
        assert!(tx["blockHash"].is_string());

        let receipt = node.call("bcn_txReceipt", vec![hash]).await.unwrap();
        assert_eq!(receipt["success"], json!(true));
        assert_eq!(node.balance("0xbob"), 1010.0);
        assert_eq!(node.balance(&key.address()), 990.0);
        assert_eq!(node.calls("bcn_transaction"), 3);
    }

    #[tokio::test]
    async fn scripted_outcomes_and_failures() {
        let node = SimNode::new().with_mine_after(1);
        let key = SigningKey::generate();
        node.script_outcome(TxOutcome::Dropped);
        let hash = node
            .call("bcn_sendRawTx", vec![json!(signed_send(&key, "0xbob", 1.0))])
            .await
            .unwrap();
        assert_eq!(node.call("bcn_transaction", vec![hash]).await.unwrap(), Value::Null);

        node.fail("dna_epoch", RpcError::server("offline"));
        assert_eq!(
            node.call("dna_epoch", vec![]).await.unwrap_err(),
            RpcError::server("offline")
        );
        node.recover("dna_epoch");
        assert_eq!(node.call("dna_epoch", vec![]).await.unwrap()["epoch"], json!(100));
        assert_eq!(node.calls("dna_epoch"), 2);
    }

    #[tokio::test]
    async fn rejects_overspending() {
        let node = SimNode::new().with_default_balance(5.0);
        let key = SigningKey::generate();
        let err = node
            .call("bcn_sendRawTx", vec![json!(signed_send(&key, "0xbob", 10.0))])
            .await
            .unwrap_err();
        assert_eq!(err.message, "insufficient funds");
        assert!(node.transactions().is_empty());
    }
}
