//! Named remote calls to the node

use crate::error::{AdapterResult, RpcError};
use async_trait::async_trait;
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::trace;

/// Transport-agnostic gateway to the node
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError>;
}

/// Amounts arrive as decimal strings or numbers
fn amount<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(de::Error::custom),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Epoch {
    pub epoch: u64,
    #[serde(default)]
    pub next_validation: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    #[serde(deserialize_with = "amount")]
    pub balance: f64,
    #[serde(deserialize_with = "amount", default)]
    pub stake: f64,
    #[serde(default)]
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub address: String,
    pub state: String,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub delegatee: Option<String>,
    #[serde(default)]
    pub delegation_epoch: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub hash: String,
    #[serde(default)]
    pub block_hash: Option<String>,
}

impl Transaction {
    pub fn is_mined(&self) -> bool {
        self.block_hash
            .as_deref()
            .is_some_and(|hash| !hash.trim_start_matches("0x").trim_start_matches('0').is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub contract: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployEstimate {
    pub contract: String,
    #[serde(deserialize_with = "amount")]
    pub gas_cost: f64,
    #[serde(deserialize_with = "amount")]
    pub tx_fee: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyword {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub desc: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordPair {
    pub id: u32,
    pub words: Vec<Keyword>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Translation {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlipSubmission {
    pub tx_hash: String,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub url: String,
    pub address: String,
    #[serde(deserialize_with = "amount")]
    pub price: f64,
    #[serde(default)]
    pub slots: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    pub key: String,
    pub provider: String,
    pub epoch: u64,
}

/// Typed wrapper over the calls the flows make
#[derive(Clone)]
pub struct Node {
    client: Arc<dyn RpcClient>,
}

impl Node {
    pub fn new(client: Arc<dyn RpcClient>) -> Self {
        Self { client }
    }

    async fn request<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> AdapterResult<T> {
        trace!(method, "RPC call");
        let result = self.client.call(method, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn epoch(&self) -> AdapterResult<Epoch> {
        self.request("dna_epoch", vec![]).await
    }

    pub async fn balance(&self, address: &str) -> AdapterResult<Balance> {
        self.request("dna_getBalance", vec![json!(address)]).await
    }

    pub async fn identity(&self, address: &str) -> AdapterResult<Identity> {
        self.request("dna_identity", vec![json!(address)]).await
    }

    /// Submit a signed transaction, returning its hash
    pub async fn send_raw_tx(&self, hex: &str) -> AdapterResult<String> {
        self.request("bcn_sendRawTx", vec![json!(hex)]).await
    }

    /// `None` when the node does not know the transaction
    pub async fn transaction(&self, hash: &str) -> AdapterResult<Option<Transaction>> {
        self.request("bcn_transaction", vec![json!(hash)]).await
    }

    /// `None` until the transaction is mined
    pub async fn receipt(&self, hash: &str) -> AdapterResult<Option<TxReceipt>> {
        self.request("bcn_txReceipt", vec![json!(hash)]).await
    }

    pub async fn estimate_deploy(&self, args: Value) -> AdapterResult<DeployEstimate> {
        self.request("contract_estimateDeploy", vec![args]).await
    }

    pub async fn keyword_pair(&self, pair_id: u32) -> AdapterResult<KeywordPair> {
        self.request("flip_words", vec![json!(pair_id)]).await
    }

    pub async fn word_translations(&self, word_id: u32) -> AdapterResult<Vec<Translation>> {
        self.request("flip_wordTranslations", vec![json!(word_id)]).await
    }

    pub async fn submit_flip(&self, hex: &str, cid: &str) -> AdapterResult<FlipSubmission> {
        self.request("flip_submit", vec![json!({ "tx": hex, "cid": cid })])
            .await
    }

    pub async fn providers(&self) -> AdapterResult<Vec<Provider>> {
        self.request("provider_list", vec![]).await
    }

    /// `None` until the provider has seen the payment
    pub async fn api_key(&self, provider: &str, tx_hash: &str) -> AdapterResult<Option<ApiKey>> {
        self.request("provider_getApiKey", vec![json!(provider), json!(tx_hash)])
            .await
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amounts_accept_strings_and_numbers() {
        let balance: Balance =
            serde_json::from_value(json!({ "balance": "12.5", "stake": 3, "nonce": 4 })).unwrap();
        assert_eq!(balance.balance, 12.5);
        assert_eq!(balance.stake, 3.0);

        let err = serde_json::from_value::<Balance>(json!({ "balance": "lots" }));
        assert!(err.is_err());
    }

    #[test]
    fn zero_block_hash_is_not_mined() {
        let pending = Transaction {
            hash: "0x1".into(),
            block_hash: Some("0x0000".into()),
        };
        assert!(!pending.is_mined());
        let mined = Transaction {
            hash: "0x1".into(),
            block_hash: Some("0xab12".into()),
        };
        assert!(mined.is_mined());
    }
}
