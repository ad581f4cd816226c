use super::money::Amount;
use super::receipt::Channel;
use super::transaction::PaymentMethod;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Flat key/value persistence with append-only lists.
///
/// Records live under `get`/`set`; index lists and audit logs live under
/// `append`/`list`. The two key spaces are independent.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;
    /// Writes `value` only if the current value equals `expected`
    /// (`None` meaning absent). Returns whether the write happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> Result<bool>;
    async fn append(&self, key: &str, value: Vec<u8>) -> Result<()>;
    /// Appends `value` unless the list already holds it, as one atomic step.
    /// Returns whether it was appended.
    async fn append_unique(&self, key: &str, value: Vec<u8>) -> Result<bool>;
    async fn list(&self, key: &str) -> Result<Vec<Vec<u8>>>;
    async fn replace_list(&self, key: &str, values: Vec<Vec<u8>>) -> Result<()>;
    /// Records (not lists) whose key starts with `prefix`, in key order.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
    /// List keys starting with `prefix`, in key order.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;
}

pub type StoreRef = Arc<dyn KeyValueStore>;

#[derive(Debug, Clone, PartialEq)]
pub struct ChargeRequest {
    pub reference: String,
    pub amount: Amount,
    pub currency: String,
    pub method: PaymentMethod,
    pub payer_contact: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChargeOutcome {
    pub success: bool,
    pub payment_id: Option<String>,
    pub message: String,
}

/// External payment capability. Its wire protocol is not our concern.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome>;
}

pub type GatewayRef = Arc<dyn PaymentGateway>;

#[derive(Debug, Clone, PartialEq)]
pub struct SendOutcome {
    pub success: bool,
    pub error: Option<String>,
}

/// Best-effort SMS/email delivery.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, channel: Channel, recipient: &str, content: &str) -> Result<SendOutcome>;
}

pub type NotifierRef = Arc<dyn Notifier>;
