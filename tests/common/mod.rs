#![allow(dead_code)]

use async_trait::async_trait;
use cargoledger::application::orchestrator::TransactionOrchestrator;
use cargoledger::config::EngineConfig;
use cargoledger::domain::ports::{
    ChargeOutcome, ChargeRequest, KeyValueStore, Notifier, PaymentGateway, SendOutcome,
};
use cargoledger::domain::receipt::{CargoSnapshot, Channel, PartySnapshot};
use cargoledger::domain::transaction::{PaymentMethod, TransactionRequest};
use cargoledger::error::{Result, SettlementError};
use cargoledger::infrastructure::in_memory::InMemoryStore;
use rust_decimal_macros::dec;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const FARMER: &str = "farmer_1";
pub const TRANSPORTER: &str = "transporter_1";

pub fn party(id: &str, email: Option<&str>) -> PartySnapshot {
    PartySnapshot {
        id: id.to_string(),
        name: format!("{} name", id),
        phone: "+250788123456".to_string(),
        email: email.map(str::to_string),
        location: Some("Kigali".to_string()),
    }
}

/// Farmer has an email address, transporter only a phone.
pub fn request(order_id: &str, amount: i64) -> TransactionRequest {
    TransactionRequest {
        order_id: order_id.to_string(),
        farmer: party(FARMER, Some("farmer@example.com")),
        transporter: party(TRANSPORTER, None),
        cargo: CargoSnapshot {
            description: "Irish potatoes".to_string(),
            quantity: dec!(40),
            unit: "sacks".to_string(),
            pickup_location: "Musanze".to_string(),
            delivery_location: "Kigali".to_string(),
            distance_km: Some(dec!(93.5)),
        },
        amount,
        payment_method: PaymentMethod::MobileMoney,
        items: Vec::new(),
        notes: None,
        metadata: None,
    }
}

#[derive(Debug, Clone)]
pub enum Script {
    Approve,
    Decline(&'static str),
    Error,
    Hang,
}

/// Gateway that plays back a script, then approves. Counts every charge.
#[derive(Default)]
pub struct ScriptedGateway {
    script: Mutex<VecDeque<Script>>,
    calls: AtomicUsize,
}

impl ScriptedGateway {
    pub fn new(script: impl IntoIterator<Item = Script>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn approving() -> Arc<Self> {
        Self::new([])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Approve);
        match step {
            Script::Approve => Ok(ChargeOutcome {
                success: true,
                payment_id: Some(format!("pay_{}_{}", request.reference, n)),
                message: "ok".to_string(),
            }),
            Script::Decline(message) => Ok(ChargeOutcome {
                success: false,
                payment_id: None,
                message: message.to_string(),
            }),
            Script::Error => Err(SettlementError::PaymentDeclined(
                "provider unreachable".to_string(),
            )),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(ChargeOutcome {
                    success: true,
                    payment_id: Some("too_late".to_string()),
                    message: "ok".to_string(),
                })
            }
        }
    }
}

/// Notifier that fails the first `failures` sends and remembers every message.
#[derive(Default)]
pub struct FlakyNotifier {
    failures: AtomicUsize,
    sent: Mutex<Vec<(Channel, String, String)>>,
}

impl FlakyNotifier {
    pub fn failing(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicUsize::new(failures),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn reliable() -> Arc<Self> {
        Self::failing(0)
    }

    pub fn sent(&self) -> Vec<(Channel, String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for FlakyNotifier {
    async fn send(&self, channel: Channel, recipient: &str, content: &str) -> Result<SendOutcome> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SettlementError::NotificationFailed("mailbox full".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((channel, recipient.to_string(), content.to_string()));
        Ok(SendOutcome {
            success: true,
            error: None,
        })
    }
}

/// In-memory store that rejects writes to keys under a prefix while armed.
#[derive(Default)]
pub struct FaultyStore {
    inner: InMemoryStore,
    failing_prefix: Mutex<Option<String>>,
}

impl FaultyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_writes_under(&self, prefix: &str) {
        *self.failing_prefix.lock().unwrap() = Some(prefix.to_string());
    }

    pub fn heal(&self) {
        *self.failing_prefix.lock().unwrap() = None;
    }

    fn check(&self, key: &str) -> Result<()> {
        match self.failing_prefix.lock().unwrap().as_deref() {
            Some(prefix) if key.starts_with(prefix) => Err(SettlementError::Internal(Box::new(
                std::io::Error::other(format!("injected write failure on {}", key)),
            ))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl KeyValueStore for FaultyStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.check(key)?;
        self.inner.set(key, value).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> Result<bool> {
        self.check(key)?;
        self.inner.compare_and_swap(key, expected, value).await
    }

    async fn append(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.check(key)?;
        self.inner.append(key, value).await
    }

    async fn append_unique(&self, key: &str, value: Vec<u8>) -> Result<bool> {
        self.check(key)?;
        self.inner.append_unique(key, value).await
    }

    async fn list(&self, key: &str) -> Result<Vec<Vec<u8>>> {
        self.inner.list(key).await
    }

    async fn replace_list(&self, key: &str, values: Vec<Vec<u8>>) -> Result<()> {
        self.check(key)?;
        self.inner.replace_list(key, values).await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.inner.scan_prefix(prefix).await
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list_keys(prefix).await
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        gateway_timeout_ms: 200,
        notifier_timeout_ms: 200,
        ..EngineConfig::default()
    }
}

pub struct Harness {
    pub engine: TransactionOrchestrator,
    pub store: Arc<InMemoryStore>,
    pub gateway: Arc<ScriptedGateway>,
    pub notifier: Arc<FlakyNotifier>,
}

pub fn harness_with(gateway: Arc<ScriptedGateway>, notifier: Arc<FlakyNotifier>) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let engine = TransactionOrchestrator::new(
        store.clone(),
        gateway.clone(),
        notifier.clone(),
        test_config(),
    );
    Harness {
        engine,
        store,
        gateway,
        notifier,
    }
}

pub fn harness() -> Harness {
    harness_with(ScriptedGateway::approving(), FlakyNotifier::reliable())
}

pub async fn count_records(store: &dyn KeyValueStore, prefix: &str) -> usize {
    store.scan_prefix(prefix).await.unwrap().len()
}
