//! Persisted draft records and their status lifecycles

use crate::error::{FlowError, FlowResult};
use chrono::Utc;
use idn_adapters::{LocalStore, Table};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DraftError {
    #[error("Illegal status change from {from} to {to}")]
    IllegalTransition { from: String, to: String },

    #[error("Draft not found: {0}")]
    NotFound(String),
}

/// A status enumeration with a fixed set of legal moves
pub trait Lifecycle:
    Copy + Eq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn initial() -> Self;

    fn can_move_to(self, next: Self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlipStatus {
    Draft,
    Publishing,
    Published,
}

impl Lifecycle for FlipStatus {
    fn initial() -> Self {
        FlipStatus::Draft
    }

    fn can_move_to(self, next: Self) -> bool {
        use FlipStatus::*;
        matches!(
            (self, next),
            (Draft, Publishing) | (Publishing, Published) | (Publishing, Draft)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdStatus {
    Draft,
    Reviewing,
    Approved,
    Rejected,
    Published,
}

impl Lifecycle for AdStatus {
    fn initial() -> Self {
        AdStatus::Draft
    }

    fn can_move_to(self, next: Self) -> bool {
        use AdStatus::*;
        matches!(
            (self, next),
            (Draft, Reviewing) | (Reviewing, Approved) | (Reviewing, Rejected) | (Draft, Published)
        )
    }
}

/// A record stored in its own table, keyed by id
pub trait Draft: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    type Status: Lifecycle;

    const TABLE: &'static str;

    fn id(&self) -> &str;

    fn status(&self) -> Self::Status;

    fn set_status(&mut self, status: Self::Status);

    fn touch(&mut self, at: chrono::DateTime<Utc>);
}

/// Typed access to the drafts of one kind.
///
/// Status changes only happen through [`Drafts::transition`], which enforces
/// the lifecycle.
pub struct Drafts<T: Draft> {
    table: Arc<dyn Table>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Draft> Clone for Drafts<T> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
            _marker: PhantomData,
        }
    }
}

impl<T: Draft> Drafts<T> {
    pub fn new(store: &dyn LocalStore) -> Self {
        Self {
            table: store.table(T::TABLE),
            _marker: PhantomData,
        }
    }

    pub async fn get(&self, id: &str) -> FlowResult<Option<T>> {
        match self.table.get(id).await? {
            Some(record) => Ok(Some(serde_json::from_value(record)?)),
            None => Ok(None),
        }
    }

    pub async fn all(&self) -> FlowResult<Vec<T>> {
        self.table
            .all()
            .await?
            .into_iter()
            .map(|(_, record)| serde_json::from_value(record).map_err(FlowError::from))
            .collect()
    }

    /// Store the record's content, keeping the persisted status of an existing draft
    pub async fn save(&self, draft: &T) -> FlowResult<T> {
        let mut draft = draft.clone();
        match self.get(draft.id()).await? {
            Some(existing) => draft.set_status(existing.status()),
            None => draft.set_status(T::Status::initial()),
        }
        draft.touch(Utc::now());
        self.table
            .put(draft.id(), serde_json::to_value(&draft)?)
            .await?;
        Ok(draft)
    }

    pub async fn delete(&self, id: &str) -> FlowResult<bool> {
        Ok(self.table.delete(id).await?)
    }

    /// Move a stored draft to `next` if its lifecycle allows it
    pub async fn transition(&self, id: &str, next: T::Status) -> FlowResult<T> {
        let mut draft = self
            .get(id)
            .await?
            .ok_or_else(|| DraftError::NotFound(id.to_string()))?;
        let current = draft.status();
        if !current.can_move_to(next) {
            return Err(DraftError::IllegalTransition {
                from: format!("{:?}", current),
                to: format!("{:?}", next),
            }
            .into());
        }

        draft.set_status(next);
        draft.touch(Utc::now());
        self.table.put(id, serde_json::to_value(&draft)?).await?;
        info!(table = T::TABLE, id, from = ?current, to = ?next, "Draft status changed");
        Ok(draft)
    }
}
