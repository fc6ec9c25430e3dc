//! Collaborators the flows reach through: the node's RPC gateway, transaction
//! building and signing, content-addressed blobs and local tables.

pub mod content;
pub mod error;
pub mod local;
pub mod rpc;
pub mod sim;
pub mod tx;

pub use content::{ContentId, ContentStore, MemoryContentStore};
pub use error::{AdapterError, AdapterResult, RpcError};
pub use local::{FileStore, LocalStore, MemoryStore, Table};
pub use rpc::{
    ApiKey, Balance, DeployEstimate, Epoch, FlipSubmission, Identity, Keyword, KeywordPair, Node,
    Provider, RpcClient, Transaction, Translation, TxReceipt,
};
pub use sim::{SimNode, TxOutcome};
pub use tx::{
    DevTransactionBuilder, RawTransaction, SignedTransaction, SigningKey, TransactionBuilder,
    TxKind, TxParams,
};
