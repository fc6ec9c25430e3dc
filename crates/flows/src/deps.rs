//! Collaborators injected into every flow

use crate::error::{FlowError, FlowResult};
use idn_adapters::{
    ContentId, ContentStore, DevTransactionBuilder, LocalStore, MemoryContentStore, MemoryStore,
    Node, RpcClient, SigningKey, TransactionBuilder, TxParams,
};
use idn_workflow::PollPolicy;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Adapters shared by the flows of one account
#[derive(Clone)]
pub struct FlowDeps {
    pub node: Node,
    pub builder: Arc<dyn TransactionBuilder>,
    pub key: SigningKey,
    pub content: Arc<dyn ContentStore>,
    pub store: Arc<dyn LocalStore>,
    pub poll: PollPolicy,
}

impl FlowDeps {
    pub fn new(
        client: Arc<dyn RpcClient>,
        builder: Arc<dyn TransactionBuilder>,
        key: SigningKey,
        content: Arc<dyn ContentStore>,
        store: Arc<dyn LocalStore>,
    ) -> Self {
        Self {
            node: Node::new(client),
            builder,
            key,
            content,
            store,
            poll: PollPolicy::default(),
        }
    }

    /// Dev signer, a fresh key and in-memory stores around `client`
    pub fn in_memory(client: Arc<dyn RpcClient>) -> Self {
        Self::new(
            client,
            Arc::new(DevTransactionBuilder),
            SigningKey::generate(),
            Arc::new(MemoryContentStore::new()),
            Arc::new(MemoryStore::new()),
        )
    }

    pub fn with_store(mut self, store: Arc<dyn LocalStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_key(mut self, key: SigningKey) -> Self {
        self.key = key;
        self
    }

    pub fn with_poll(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn address(&self) -> String {
        self.key.address()
    }

    /// Spendable balance of our account, failing when it is below `required`
    pub async fn ensure_balance(&self, required: f64) -> FlowResult<f64> {
        let available = self.node.balance(&self.address()).await?.balance;
        if available <= 0.0 || available < required {
            return Err(FlowError::InsufficientBalance {
                available,
                required,
            });
        }
        Ok(available)
    }

    /// Store `value` as JSON in the content store
    pub async fn store_json<T: Serialize>(&self, value: &T) -> FlowResult<ContentId> {
        let bytes = serde_json::to_vec(value)?;
        Ok(self.content.put(bytes).await?)
    }

    /// Fill in nonce and epoch, sign with `key` and encode
    pub async fn sign_with(&self, params: TxParams, key: &SigningKey) -> FlowResult<(String, String)> {
        let balance = self.node.balance(&key.address()).await?;
        let epoch = self.node.epoch().await?;
        let params = TxParams {
            nonce: balance.nonce + 1,
            epoch: epoch.epoch,
            ..params
        };
        let raw = self.builder.build(params)?;
        let signed = self.builder.sign(raw, key)?;
        Ok((signed.to_hex()?, signed.hash()?))
    }

    /// Build, sign and submit a transaction from our account, returning its hash
    pub async fn send_tx(&self, params: TxParams) -> FlowResult<String> {
        self.send_tx_with(params, &self.key).await
    }

    pub async fn send_tx_with(&self, params: TxParams, key: &SigningKey) -> FlowResult<String> {
        let kind = params.kind;
        let (hex, _) = self.sign_with(params, key).await?;
        let hash = self.node.send_raw_tx(&hex).await?;
        info!(kind = ?kind, hash = %hash, "Sent transaction");
        Ok(hash)
    }
}

impl std::fmt::Debug for FlowDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowDeps")
            .field("address", &self.address())
            .field("poll", &self.poll)
            .finish_non_exhaustive()
    }
}
