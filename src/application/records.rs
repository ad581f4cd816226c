use crate::domain::escrow::EscrowPayment;
use crate::domain::ports::StoreRef;
use crate::domain::receipt::DigitalReceipt;
use crate::domain::transaction::Transaction;
use crate::error::{Result, SettlementError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

pub const TRANSACTION_NS: &str = "transaction:";
pub const ESCROW_NS: &str = "escrow:";
pub const RECEIPT_NS: &str = "receipt:";

pub fn transaction_key(id: &str) -> String {
    format!("{}{}", TRANSACTION_NS, id)
}

pub fn escrow_key(id: &str) -> String {
    format!("{}{}", ESCROW_NS, id)
}

pub fn receipt_key(id: &str) -> String {
    format!("{}{}", RECEIPT_NS, id)
}

/// `<prefix>_<uuid>`, e.g. `esc_3f2a...`.
pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

/// Typed JSON access to the key/value store.
///
/// Every mutation of an existing record goes through [`Records::update`], a
/// read-modify-compare-and-swap loop. Concurrent writers to the same key are
/// therefore serialized: the loser re-reads and re-applies its change against
/// the winner's state, so no event is lost and status guards see fresh data.
#[derive(Clone)]
pub struct Records {
    store: StoreRef,
    max_retries: u32,
}

impl Records {
    pub fn new(store: StoreRef, max_retries: u32) -> Self {
        Self {
            store,
            max_retries: max_retries.max(1),
        }
    }

    pub fn store(&self) -> &StoreRef {
        &self.store
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Creates `key` only if absent. Returns false if it already existed.
    pub async fn insert<T: Serialize>(&self, key: &str, value: &T) -> Result<bool> {
        let bytes = serde_json::to_vec(value)?;
        self.store.compare_and_swap(key, None, bytes).await
    }

    pub async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.store.set(key, serde_json::to_vec(value)?).await
    }

    /// Applies `apply` to the stored value and writes it back atomically.
    ///
    /// If `apply` fails nothing is written and its error is returned as is.
    pub async fn update<T, R, F>(&self, entity: &'static str, key: &str, mut apply: F) -> Result<(T, R)>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(&mut T) -> Result<R>,
    {
        for attempt in 1..=self.max_retries {
            let raw = self
                .store
                .get(key)
                .await?
                .ok_or_else(|| SettlementError::not_found(entity, key_id(key)))?;
            let mut value: T = serde_json::from_slice(&raw)?;
            let output = apply(&mut value)?;
            let bytes = serde_json::to_vec(&value)?;
            if self.store.compare_and_swap(key, Some(&raw), bytes).await? {
                return Ok((value, output));
            }
            tracing::debug!(key, attempt, "write conflict, retrying");
        }
        Err(SettlementError::Conflict(key.to_string()))
    }

    /// Like [`Records::update`], but creates the value from `T::default()` when absent.
    pub async fn upsert<T, R, F>(&self, key: &str, mut apply: F) -> Result<(T, R)>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnMut(&mut T) -> Result<R>,
    {
        for attempt in 1..=self.max_retries {
            let raw = self.store.get(key).await?;
            let mut value: T = match &raw {
                Some(bytes) => serde_json::from_slice(bytes)?,
                None => T::default(),
            };
            let output = apply(&mut value)?;
            let bytes = serde_json::to_vec(&value)?;
            if self
                .store
                .compare_and_swap(key, raw.as_deref(), bytes)
                .await?
            {
                return Ok((value, output));
            }
            tracing::debug!(key, attempt, "write conflict, retrying");
        }
        Err(SettlementError::Conflict(key.to_string()))
    }

    pub async fn scan<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        self.store
            .scan_prefix(prefix)
            .await?
            .into_iter()
            .map(|(_, bytes)| serde_json::from_slice(&bytes).map_err(SettlementError::from))
            .collect()
    }

    pub async fn append<T: Serialize>(&self, list_key: &str, value: &T) -> Result<()> {
        self.store.append(list_key, serde_json::to_vec(value)?).await
    }

    pub async fn list<T: DeserializeOwned>(&self, list_key: &str) -> Result<Vec<T>> {
        self.store
            .list(list_key)
            .await?
            .into_iter()
            .map(|bytes| serde_json::from_slice(&bytes).map_err(SettlementError::from))
            .collect()
    }

    pub async fn transaction(&self, id: &str) -> Result<Transaction> {
        self.get(&transaction_key(id))
            .await?
            .ok_or_else(|| SettlementError::not_found("transaction", id))
    }

    pub async fn escrow(&self, id: &str) -> Result<EscrowPayment> {
        self.get(&escrow_key(id))
            .await?
            .ok_or_else(|| SettlementError::not_found("escrow", id))
    }

    pub async fn receipt(&self, id: &str) -> Result<DigitalReceipt> {
        self.get(&receipt_key(id))
            .await?
            .ok_or_else(|| SettlementError::not_found("receipt", id))
    }

    pub async fn update_transaction<R, F>(&self, id: &str, apply: F) -> Result<(Transaction, R)>
    where
        F: FnMut(&mut Transaction) -> Result<R>,
    {
        self.update("transaction", &transaction_key(id), apply).await
    }

    pub async fn update_escrow<R, F>(&self, id: &str, apply: F) -> Result<(EscrowPayment, R)>
    where
        F: FnMut(&mut EscrowPayment) -> Result<R>,
    {
        self.update("escrow", &escrow_key(id), apply).await
    }

    pub async fn update_receipt<R, F>(&self, id: &str, apply: F) -> Result<(DigitalReceipt, R)>
    where
        F: FnMut(&mut DigitalReceipt) -> Result<R>,
    {
        self.update("receipt", &receipt_key(id), apply).await
    }
}

fn key_id(key: &str) -> &str {
    key.split_once(':').map(|(_, id)| id).unwrap_or(key)
}
