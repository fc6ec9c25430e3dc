//! Transaction building and signing
//!
//! The flows only need three things from a transaction: a hex encoding to
//! hand to the node, a hash to poll for, and a way to attach a signature.
//! [`DevTransactionBuilder`] provides these with a keyed BLAKE3 hash in place
//! of the node's signature scheme; it is meant for simulation and tests.

use crate::error::{AdapterError, AdapterResult};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of a signature produced by [`DevTransactionBuilder`]
pub const SIGNATURE_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxKind {
    Send,
    Activation,
    OnlineStatus,
    SubmitFlip,
    ChangeProfile,
    DeployContract,
    CallContract,
    Delegate,
    Undelegate,
}

impl TxKind {
    /// Kinds that are meaningless without a recipient
    pub fn requires_recipient(self) -> bool {
        matches!(
            self,
            TxKind::Send | TxKind::Activation | TxKind::CallContract | TxKind::Delegate
        )
    }

    /// Kinds whose payload carries the actual change
    pub fn requires_payload(self) -> bool {
        matches!(
            self,
            TxKind::SubmitFlip | TxKind::ChangeProfile | TxKind::DeployContract | TxKind::OnlineStatus
        )
    }
}

/// Caller-supplied transaction parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxParams {
    pub kind: TxKind,
    pub to: Option<String>,
    pub amount: f64,
    pub max_fee: f64,
    pub nonce: u64,
    pub epoch: u64,
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl TxParams {
    pub fn new(kind: TxKind) -> Self {
        Self {
            kind,
            to: None,
            amount: 0.0,
            max_fee: 0.0,
            nonce: 0,
            epoch: 0,
            payload: Vec::new(),
        }
    }

    pub fn to(mut self, address: impl Into<String>) -> Self {
        self.to = Some(address.into());
        self
    }

    pub fn amount(mut self, amount: f64) -> Self {
        self.amount = amount;
        self
    }

    pub fn max_fee(mut self, fee: f64) -> Self {
        self.max_fee = fee;
        self
    }

    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }
}

/// Unsigned, validated transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTransaction {
    pub kind: TxKind,
    /// Signer address, filled in when signing
    #[serde(default)]
    pub from: Option<String>,
    pub to: Option<String>,
    pub amount: f64,
    pub max_fee: f64,
    pub nonce: u64,
    pub epoch: u64,
    pub payload: Vec<u8>,
}

impl RawTransaction {
    pub fn encode(&self) -> AdapterResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignedTransaction {
    pub raw: RawTransaction,
    pub signature: Vec<u8>,
}

impl SignedTransaction {
    /// Encoded transaction followed by the signature
    pub fn encode(&self) -> AdapterResult<Vec<u8>> {
        let mut bytes = self.raw.encode()?;
        bytes.extend_from_slice(&self.signature);
        Ok(bytes)
    }

    pub fn to_hex(&self) -> AdapterResult<String> {
        Ok(format!("0x{}", hex::encode(self.encode()?)))
    }

    /// Hash the node reports for this transaction
    pub fn hash(&self) -> AdapterResult<String> {
        Ok(hash_bytes(&self.encode()?))
    }

    /// Parse the output of [`SignedTransaction::to_hex`]
    pub fn from_hex(encoded: &str) -> AdapterResult<Self> {
        let bytes = hex::decode(encoded.trim_start_matches("0x"))
            .map_err(|e| AdapterError::InvalidParams(format!("invalid hex: {}", e)))?;
        if bytes.len() <= SIGNATURE_LEN {
            return Err(AdapterError::InvalidParams("transaction too short".to_string()));
        }
        let (body, signature) = bytes.split_at(bytes.len() - SIGNATURE_LEN);
        Ok(Self {
            raw: serde_json::from_slice(body)?,
            signature: signature.to_vec(),
        })
    }
}

/// Hash of an encoded transaction as reported by the node
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(blake3::hash(bytes).as_bytes()))
}

/// Private key material
#[derive(Clone, PartialEq, Eq)]
pub struct SigningKey([u8; 32]);

impl SigningKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(encoded: &str) -> AdapterResult<Self> {
        let bytes = hex::decode(encoded.trim_start_matches("0x"))
            .map_err(|e| AdapterError::InvalidParams(format!("invalid key: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AdapterError::InvalidParams("key must be 32 bytes".to_string()))?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Account address controlled by this key
    pub fn address(&self) -> String {
        let digest = blake3::derive_key("idena address", &self.0);
        format!("0x{}", hex::encode(&digest[..20]))
    }

    pub(crate) fn bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SigningKey").field(&self.address()).finish()
    }
}

/// Builds and signs transactions
pub trait TransactionBuilder: Send + Sync {
    fn build(&self, params: TxParams) -> AdapterResult<RawTransaction>;

    fn sign(&self, raw: RawTransaction, key: &SigningKey) -> AdapterResult<SignedTransaction>;
}

/// Keyed-hash signer used for simulation and tests
#[derive(Debug, Clone, Default)]
pub struct DevTransactionBuilder;

impl DevTransactionBuilder {
    /// Whether `tx` was signed by `key`
    pub fn verify(tx: &SignedTransaction, key: &SigningKey) -> bool {
        match tx.raw.encode() {
            Ok(body) => blake3::keyed_hash(key.bytes(), &body).as_bytes()[..] == tx.signature[..],
            Err(_) => false,
        }
    }
}

impl TransactionBuilder for DevTransactionBuilder {
    fn build(&self, params: TxParams) -> AdapterResult<RawTransaction> {
        let TxParams {
            kind,
            to,
            amount,
            max_fee,
            nonce,
            epoch,
            payload,
        } = params;

        if !amount.is_finite() || amount < 0.0 {
            return Err(AdapterError::InvalidParams(format!("invalid amount {}", amount)));
        }
        if !max_fee.is_finite() || max_fee < 0.0 {
            return Err(AdapterError::InvalidParams(format!("invalid max fee {}", max_fee)));
        }
        if kind.requires_recipient() && to.as_deref().is_none_or(str::is_empty) {
            return Err(AdapterError::InvalidParams(format!("{:?} requires a recipient", kind)));
        }
        if kind.requires_payload() && payload.is_empty() {
            return Err(AdapterError::InvalidParams(format!("{:?} requires a payload", kind)));
        }

        Ok(RawTransaction {
            kind,
            from: None,
            to,
            amount,
            max_fee,
            nonce,
            epoch,
            payload,
        })
    }

    fn sign(&self, mut raw: RawTransaction, key: &SigningKey) -> AdapterResult<SignedTransaction> {
        raw.from = Some(key.address());
        let body = raw.encode()?;
        let signature = blake3::keyed_hash(key.bytes(), &body).as_bytes().to_vec();
        Ok(SignedTransaction { raw, signature })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_params() {
        let builder = DevTransactionBuilder;
        let err = builder.build(TxParams::new(TxKind::Send).amount(5.0)).unwrap_err();
        assert!(matches!(err, AdapterError::InvalidParams(_)));

        let err = builder
            .build(TxParams::new(TxKind::Send).to("0xabc").amount(-1.0))
            .unwrap_err();
        assert!(matches!(err, AdapterError::InvalidParams(_)));

        let err = builder.build(TxParams::new(TxKind::SubmitFlip)).unwrap_err();
        assert!(matches!(err, AdapterError::InvalidParams(_)));
    }

    #[test]
    fn signed_transaction_parses_back() {
        let builder = DevTransactionBuilder;
        let key = SigningKey::generate();
        let raw = builder
            .build(TxParams::new(TxKind::Send).to("0xabc").amount(1.5))
            .unwrap();
        let signed = builder.sign(raw, &key).unwrap();
        assert_eq!(signed.raw.from, Some(key.address()));
        assert!(DevTransactionBuilder::verify(&signed, &key));
        assert!(!DevTransactionBuilder::verify(&signed, &SigningKey::generate()));

        let parsed = SignedTransaction::from_hex(&signed.to_hex().unwrap()).unwrap();
        assert_eq!(parsed, signed);
        assert_eq!(parsed.hash().unwrap(), signed.hash().unwrap());
        assert!(signed.hash().unwrap().starts_with("0x"));
    }

    #[test]
    fn key_round_trips_through_hex() {
        let key = SigningKey::generate();
        let restored = SigningKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(restored.address(), key.address());
        assert_eq!(key.address().len(), 42);
        assert!(SigningKey::from_hex("0x1234").is_err());
    }
}
