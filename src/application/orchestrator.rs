use super::escrow_ledger::EscrowLedger;
use super::index::{ActorRole, IndexKind, Indexer, RebuildReport};
use super::receipts::{ReceiptDraft, ReceiptGenerator};
use super::records::{Records, new_id, transaction_key};
use crate::config::EngineConfig;
use crate::domain::escrow::{EscrowPayment, EscrowStats, EscrowStatus, NewEscrow};
use crate::domain::money::{self, Amount};
use crate::domain::ports::{ChargeRequest, GatewayRef, NotifierRef, StoreRef};
use crate::domain::receipt::{
    Channel, DigitalReceipt, LineItem, LineItemInput, MonthSummary, ReceiptPaymentStatus,
    ReceiptTotals,
};
use crate::domain::transaction::{
    EventKind, FailureKind, Transaction, TransactionRequest, TransactionResult, TransactionStatus,
};
use crate::error::{Result, SettlementError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Evidence supplied when delivery is confirmed.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct DeliveryProof {
    pub confirmation_id: Option<String>,
    pub confirmed_by: Option<String>,
    pub notes: Option<String>,
}

/// Read-only snapshot of a transaction and the records it points at.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct TransactionView {
    pub transaction: Transaction,
    pub escrow: Option<EscrowPayment>,
    pub receipt: Option<DigitalReceipt>,
}

type Events = Vec<(EventKind, Option<String>)>;

/// Drives the settlement sagas.
///
/// The forward saga is payment -> escrow -> receipt -> notification. Only the
/// payment step may abort it; every later step is recorded as an event on the
/// transaction and is safe to repeat, so [`TransactionOrchestrator::resume_transaction`]
/// can pick up from wherever a previous run stopped without charging again.
///
/// The resolution sagas (release, refund, dispute) delegate the state check to
/// the escrow ledger and then bring the receipt and the transaction in line
/// with the escrow's new status.
pub struct TransactionOrchestrator {
    records: Records,
    indexer: Indexer,
    ledger: EscrowLedger,
    receipts: ReceiptGenerator,
    gateway: GatewayRef,
    config: Arc<EngineConfig>,
}

impl TransactionOrchestrator {
    pub fn new(
        store: StoreRef,
        gateway: GatewayRef,
        notifier: NotifierRef,
        config: EngineConfig,
    ) -> Self {
        let config = Arc::new(config);
        let records = Records::new(store, config.max_write_retries);
        let indexer = Indexer::new(records.clone());
        let ledger = EscrowLedger::new(records.clone(), indexer.clone(), config.clone());
        let receipts =
            ReceiptGenerator::new(records.clone(), indexer.clone(), notifier, config.clone());
        Self {
            records,
            indexer,
            ledger,
            receipts,
            gateway,
            config,
        }
    }

    pub fn ledger(&self) -> &EscrowLedger {
        &self.ledger
    }

    pub fn receipts(&self) -> &ReceiptGenerator {
        &self.receipts
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Starts the forward saga.
    ///
    /// Invalid input fails before anything is written. A declined or timed out
    /// charge leaves the transaction `pending` with no escrow or receipt. If the
    /// order already has a transaction whose payment was captured, that
    /// transaction is resumed instead of charging again.
    pub async fn initiate_transaction(&self, request: TransactionRequest) -> Result<TransactionResult> {
        let amount = Amount::new(request.amount)?;
        validate_request(&request, self.config.platform_fee_bps)?;

        if let Some(existing) = self.transaction_for_order(&request.order_id).await? {
            if existing.payment_captured() {
                tracing::info!(
                    order_id = %request.order_id,
                    transaction_id = %existing.transaction_id,
                    "order already paid, resuming existing transaction"
                );
                return self.resume_transaction(&existing.transaction_id).await;
            }
            if existing.status == TransactionStatus::PaymentProcessing
                && self.expire_stale_attempt(&existing.transaction_id).await?.is_none()
            {
                return Err(SettlementError::Conflict(format!(
                    "order {} has a payment in flight ({})",
                    request.order_id, existing.transaction_id
                )));
            }
        }

        let now = Utc::now();
        let transaction_id = new_id("txn");
        let mut txn = Transaction::new(transaction_id.clone(), request, now);
        txn.transition(TransactionStatus::PaymentProcessing, now);
        txn.record(
            EventKind::PaymentInitiated,
            Some(txn.payment_method.label().to_string()),
            now,
        );
        if !self.records.insert(&transaction_key(&transaction_id), &txn).await? {
            return Err(SettlementError::Conflict(transaction_id));
        }
        self.indexer
            .link_parties(
                &txn.farmer_id,
                &txn.transporter_id,
                IndexKind::Transactions,
                &transaction_id,
            )
            .await?;
        self.indexer
            .update_order_links(&txn.order_id, |links| {
                links.transaction_id = Some(transaction_id.clone());
                Ok(())
            })
            .await?;
        tracing::info!(%transaction_id, order_id = %txn.order_id, amount = txn.amount, "payment initiated");

        let charge = ChargeRequest {
            reference: txn.order_id.clone(),
            amount,
            currency: self.config.currency.clone(),
            method: txn.payment_method,
            payer_contact: txn.request.farmer.phone.clone(),
        };
        let outcome = tokio::time::timeout(self.config.gateway_timeout(), self.gateway.charge(&charge)).await;
        let captured = match outcome {
            Ok(Ok(result)) if result.success => Ok(result.payment_id),
            Ok(Ok(result)) => Err(result.message),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(SettlementError::Timeout("payment gateway").to_string()),
        };

        match captured {
            Err(message) => {
                let (txn, ()) = self
                    .records
                    .update_transaction(&transaction_id, |txn| {
                        let now = Utc::now();
                        txn.transition(TransactionStatus::Pending, now);
                        txn.record(EventKind::PaymentFailed, Some(message.clone()), now);
                        Ok(())
                    })
                    .await?;
                tracing::warn!(%transaction_id, %message, "payment declined");
                Ok(TransactionResult {
                    success: false,
                    transaction_id,
                    status: txn.status,
                    escrow_id: None,
                    receipt_id: None,
                    failure: Some(FailureKind::PaymentDeclined),
                    message: format!(
                        "Payment was not completed: {}. Nothing was charged and your money is safe.",
                        message
                    ),
                })
            }
            Ok(payment_id) => {
                self.records
                    .update_transaction(&transaction_id, |txn| {
                        let now = Utc::now();
                        // A capture that lands after the attempt expired revives it.
                        if txn.status == TransactionStatus::Pending {
                            txn.transition(TransactionStatus::PaymentProcessing, now);
                        }
                        txn.payment_id = payment_id.clone();
                        txn.record(EventKind::PaymentCompleted, payment_id.clone(), now);
                        Ok(())
                    })
                    .await?;
                tracing::info!(%transaction_id, payment_id = ?payment_id, "payment captured");
                self.drive_forward(&transaction_id).await
            }
        }
    }

    /// Continues a transaction from its last recorded step.
    ///
    /// A paid transaction that never reached `escrow_held` gets its remaining
    /// forward steps. A transaction whose escrow was already settled or
    /// disputed gets its receipt and status brought in line with the escrow.
    pub async fn resume_transaction(&self, transaction_id: &str) -> Result<TransactionResult> {
        let txn = self.records.transaction(transaction_id).await?;
        match txn.status {
            TransactionStatus::Pending => Ok(uncaptured_result(&txn)),
            TransactionStatus::PaymentProcessing if !txn.payment_captured() => {
                match self.expire_stale_attempt(transaction_id).await? {
                    Some(txn) => Ok(uncaptured_result(&txn)),
                    None => Err(SettlementError::Conflict(format!(
                        "payment for {} is still in flight",
                        transaction_id
                    ))),
                }
            }
            TransactionStatus::PaymentProcessing => self.drive_forward(transaction_id).await,
            _ => {
                let escrow_id = txn
                    .escrow_id
                    .clone()
                    .ok_or_else(|| SettlementError::MissingEscrow(transaction_id.to_string()))?;
                let escrow = self.ledger.get_escrow(&escrow_id).await?;
                let txn = self
                    .apply_escrow_outcome(transaction_id, &escrow, Vec::new())
                    .await?;
                Ok(settled_result(&txn, "Transaction is up to date."))
            }
        }
    }

    /// Releases the escrow to the transporter and completes the transaction.
    pub async fn confirm_delivery_and_release_escrow(
        &self,
        transaction_id: &str,
        proof: Option<DeliveryProof>,
    ) -> Result<TransactionResult> {
        let escrow_id = self.resolvable_escrow(transaction_id, false).await?;
        let proof = proof.unwrap_or_default();
        let release = self
            .ledger
            .release_escrow(&escrow_id, proof.confirmation_id.clone())
            .await?;

        let confirmed = proof
            .confirmed_by
            .iter()
            .chain(proof.notes.iter())
            .cloned()
            .collect::<Vec<_>>()
            .join(": ");
        let events = vec![
            (
                EventKind::DeliveryConfirmed,
                (!confirmed.is_empty()).then_some(confirmed),
            ),
            (
                EventKind::EscrowReleased,
                Some(format!("{} to {}", release.amount, release.transporter_id)),
            ),
        ];
        let escrow = self.ledger.get_escrow(&escrow_id).await?;
        let txn = self.apply_escrow_outcome(transaction_id, &escrow, events).await?;
        Ok(settled_result(&txn, "Delivery confirmed and payment released to the transporter."))
    }

    /// Returns the escrowed funds to the farmer.
    pub async fn refund_transaction(&self, transaction_id: &str, reason: &str) -> Result<TransactionResult> {
        let escrow_id = self.resolvable_escrow(transaction_id, true).await?;
        self.ledger.refund_escrow(&escrow_id, reason, None).await?;

        let escrow = self.ledger.get_escrow(&escrow_id).await?;
        let events = vec![(EventKind::EscrowRefunded, Some(reason.to_string()))];
        let txn = self.apply_escrow_outcome(transaction_id, &escrow, events).await?;
        Ok(settled_result(&txn, "Payment refunded to the shipper."))
    }

    /// Freezes the escrow pending a resolver's release or refund. Raising a
    /// second dispute replaces the dispute details.
    pub async fn raise_dispute(
        &self,
        transaction_id: &str,
        reason: &str,
        initiated_by: &str,
        evidence: Vec<String>,
    ) -> Result<TransactionResult> {
        let escrow_id = self.resolvable_escrow(transaction_id, true).await?;
        let escrow = self
            .ledger
            .dispute_escrow(&escrow_id, reason, initiated_by, evidence)
            .await?;

        let events = vec![(
            EventKind::DisputeRaised,
            Some(format!("{}: {}", initiated_by, reason)),
        )];
        let txn = self.apply_escrow_outcome(transaction_id, &escrow, events).await?;
        Ok(settled_result(&txn, "Dispute recorded; funds stay in escrow until it is resolved."))
    }

    pub async fn get_transaction_status(&self, transaction_id: &str) -> Result<TransactionView> {
        let transaction = self.records.transaction(transaction_id).await?;
        let escrow = match &transaction.escrow_id {
            Some(id) => Some(self.ledger.get_escrow(id).await?),
            None => None,
        };
        let receipt = match &transaction.receipt_id {
            Some(id) => Some(self.receipts.get_receipt(id).await?),
            None => None,
        };
        Ok(TransactionView {
            transaction,
            escrow,
            receipt,
        })
    }

    /// The order's current transaction, if any.
    pub async fn transaction_for_order(&self, order_id: &str) -> Result<Option<Transaction>> {
        match self.indexer.order_links(order_id).await?.transaction_id {
            Some(id) => self.records.get(&transaction_key(&id)).await,
            None => Ok(None),
        }
    }

    pub async fn get_user_transactions(&self, actor_id: &str, role: ActorRole) -> Result<Vec<Transaction>> {
        let ids = self.indexer.ids(role, actor_id, IndexKind::Transactions).await?;
        let mut transactions = Vec::with_capacity(ids.len());
        for id in ids {
            match self.records.get::<Transaction>(&transaction_key(&id)).await? {
                Some(txn) => transactions.push(txn),
                None => tracing::warn!(transaction_id = %id, "index points at missing transaction"),
            }
        }
        Ok(transactions)
    }

    pub async fn get_farmer_escrow_stats(&self, farmer_id: &str) -> Result<EscrowStats> {
        self.ledger.stats(farmer_id, ActorRole::Farmer).await
    }

    pub async fn get_month_summary(&self, actor_id: &str, year: i32, month: u32) -> Result<MonthSummary> {
        self.receipts.get_month_summary(actor_id, year, month).await
    }

    pub async fn rebuild_indices(&self) -> Result<RebuildReport> {
        self.indexer.rebuild().await
    }

    /// Fails an uncaptured attempt older than the payment attempt expiry, as a
    /// gateway timeout would have. Returns `None` while the charge may still
    /// be in flight.
    async fn expire_stale_attempt(&self, transaction_id: &str) -> Result<Option<Transaction>> {
        let Some(cutoff) = Utc::now().checked_sub_signed(self.config.payment_attempt_expiry()) else {
            return Ok(None);
        };
        let (txn, expired) = self
            .records
            .update_transaction(transaction_id, |txn| {
                let stale = txn.status == TransactionStatus::PaymentProcessing
                    && !txn.payment_captured()
                    && txn.updated_at < cutoff;
                if stale {
                    let now = Utc::now();
                    txn.transition(TransactionStatus::Pending, now);
                    txn.record(
                        EventKind::PaymentFailed,
                        Some("payment attempt expired without a gateway outcome".to_string()),
                        now,
                    );
                }
                Ok(stale)
            })
            .await?;
        if !expired {
            return Ok(None);
        }
        tracing::warn!(%transaction_id, order_id = %txn.order_id, "expired abandoned payment attempt");
        Ok(Some(txn))
    }

    /// Runs every forward step after payment capture. Each step checks the
    /// transaction first and is skipped if already done.
    async fn drive_forward(&self, transaction_id: &str) -> Result<TransactionResult> {
        let txn = self.records.transaction(transaction_id).await?;

        let escrow_id = match self.ensure_escrow(&txn).await {
            Ok(id) => id,
            Err(e) => return self.post_payment_failure(&txn, EventKind::EscrowCreationFailed, e).await,
        };
        let receipt = match self.ensure_receipt(&txn).await {
            Ok(receipt) => receipt,
            Err(e) => {
                return self
                    .post_payment_failure(&txn, EventKind::ReceiptGenerationFailed, e)
                    .await;
            }
        };

        let txn = self.records.transaction(transaction_id).await?;
        if !txn.has_event(EventKind::ReceiptEmailed) && !txn.has_event(EventKind::NotificationFailed) {
            self.notify_parties(&txn, &receipt).await?;
        }

        let (txn, ()) = self
            .records
            .update_transaction(transaction_id, |txn| {
                if txn.status == TransactionStatus::PaymentProcessing {
                    txn.transition(TransactionStatus::EscrowHeld, Utc::now());
                }
                Ok(())
            })
            .await?;
        tracing::info!(%transaction_id, %escrow_id, receipt_id = %receipt.receipt_id, "funds held in escrow");

        Ok(TransactionResult {
            success: true,
            transaction_id: txn.transaction_id,
            status: txn.status,
            escrow_id: Some(escrow_id),
            receipt_id: Some(receipt.receipt_id),
            failure: None,
            message: "Payment received and held in escrow until delivery is confirmed.".to_string(),
        })
    }

    async fn ensure_escrow(&self, txn: &Transaction) -> Result<String> {
        if let Some(id) = &txn.escrow_id {
            return Ok(id.clone());
        }
        let escrow = self
            .ledger
            .create_escrow(NewEscrow {
                transaction_id: txn.transaction_id.clone(),
                order_id: txn.order_id.clone(),
                farmer_id: txn.farmer_id.clone(),
                transporter_id: txn.transporter_id.clone(),
                amount: txn.amount,
                payment_method: txn.payment_method,
                metadata: txn.request.metadata.clone(),
            })
            .await?;
        let escrow_id = escrow.escrow_id;
        self.records
            .update_transaction(&txn.transaction_id, |txn| {
                if txn.escrow_id.is_none() {
                    txn.escrow_id = Some(escrow_id.clone());
                    txn.record(EventKind::EscrowCreated, Some(escrow_id.clone()), Utc::now());
                }
                Ok(())
            })
            .await?;
        Ok(escrow_id)
    }

    async fn ensure_receipt(&self, txn: &Transaction) -> Result<DigitalReceipt> {
        if let Some(id) = &txn.receipt_id {
            return self.receipts.get_receipt(id).await;
        }
        let items = billable_items(&txn.request);
        let subtotal: i64 = items.iter().map(|i| i.unit_price * i64::from(i.quantity)).sum();
        let platform_fee = money::fee_from_bps(subtotal, self.config.platform_fee_bps)?;
        let receipt = self
            .receipts
            .generate_receipt(ReceiptDraft {
                transaction_id: txn.transaction_id.clone(),
                order_id: txn.order_id.clone(),
                farmer: txn.request.farmer.clone(),
                transporter: txn.request.transporter.clone(),
                cargo: txn.request.cargo.clone(),
                items,
                payment_method: txn.payment_method,
                platform_fee,
                declared_total: None,
                notes: txn.request.notes.clone(),
            })
            .await?;
        let receipt_id = receipt.receipt_id.clone();
        self.records
            .update_transaction(&txn.transaction_id, |txn| {
                if txn.receipt_id.is_none() {
                    txn.receipt_id = Some(receipt_id.clone());
                    txn.record(EventKind::ReceiptGenerated, Some(receipt_id.clone()), Utc::now());
                }
                Ok(())
            })
            .await?;
        Ok(receipt)
    }

    /// Best effort. Emails a party when an address is on file, texts otherwise.
    async fn notify_parties(&self, txn: &Transaction, receipt: &DigitalReceipt) -> Result<()> {
        let mut delivered = Vec::new();
        let mut failed = Vec::new();
        for party in [&receipt.farmer, &receipt.transporter] {
            let (channel, recipient) = match &party.email {
                Some(email) => (Channel::Email, email.as_str()),
                None => (Channel::Sms, party.phone.as_str()),
            };
            match self
                .receipts
                .send_receipt(&receipt.receipt_id, channel, recipient)
                .await
            {
                Ok(record) if record.success => delivered.push(record.recipient),
                Ok(record) => failed.push(format!(
                    "{} ({})",
                    record.recipient,
                    record.error.unwrap_or_else(|| "rejected".to_string())
                )),
                Err(e) => failed.push(format!("{} ({})", recipient, e)),
            }
        }

        let mut events: Events = Vec::new();
        if !delivered.is_empty() {
            events.push((EventKind::ReceiptEmailed, Some(delivered.join(", "))));
        }
        if !failed.is_empty() {
            tracing::warn!(transaction_id = %txn.transaction_id, failed = %failed.join("; "), "notification failed");
            events.push((EventKind::NotificationFailed, Some(failed.join("; "))));
        }
        self.records
            .update_transaction(&txn.transaction_id, |txn| {
                let now = Utc::now();
                for (kind, detail) in &events {
                    txn.record(*kind, detail.clone(), now);
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn post_payment_failure(
        &self,
        txn: &Transaction,
        kind: EventKind,
        error: SettlementError,
    ) -> Result<TransactionResult> {
        tracing::error!(transaction_id = %txn.transaction_id, ?kind, %error, "saga step failed after payment");
        let detail = error.to_string();
        let (txn, ()) = self
            .records
            .update_transaction(&txn.transaction_id, |txn| {
                txn.record(kind, Some(detail.clone()), Utc::now());
                Ok(())
            })
            .await?;
        Ok(TransactionResult {
            success: false,
            transaction_id: txn.transaction_id,
            status: txn.status,
            escrow_id: txn.escrow_id,
            receipt_id: txn.receipt_id,
            failure: Some(FailureKind::PostPaymentStep),
            message: format!(
                "Your payment succeeded but a later step failed ({}). The transaction will be resumed; contact support if this persists.",
                detail
            ),
        })
    }

    /// Looks up the escrow a resolution acts on. A transaction still finishing
    /// its forward saga is driven to `escrow_held` first. When that keeps
    /// failing, only resolutions that return or freeze the funds
    /// (`allow_unfinished`) may proceed; release needs the finished saga.
    async fn resolvable_escrow(&self, transaction_id: &str, allow_unfinished: bool) -> Result<String> {
        let mut txn = self.records.transaction(transaction_id).await?;
        let escrow_id = txn
            .escrow_id
            .clone()
            .ok_or_else(|| SettlementError::MissingEscrow(transaction_id.to_string()))?;
        if txn.status == TransactionStatus::PaymentProcessing {
            self.drive_forward(transaction_id).await?;
            txn = self.records.transaction(transaction_id).await?;
        }
        match txn.status {
            TransactionStatus::EscrowHeld
            | TransactionStatus::Disputed
            | TransactionStatus::EscrowReleased
            | TransactionStatus::Completed
            | TransactionStatus::Refunded => Ok(escrow_id),
            TransactionStatus::PaymentProcessing if allow_unfinished => {
                tracing::warn!(%transaction_id, %escrow_id, "resolving escrow of an unfinished transaction");
                Ok(escrow_id)
            }
            other => Err(SettlementError::invalid_transition(
                "transaction",
                transaction_id,
                other,
                TransactionStatus::EscrowHeld,
            )),
        }
    }

    /// Records `events` and moves the receipt and the transaction to match the
    /// escrow's status. Safe to repeat: already-applied changes are skipped.
    async fn apply_escrow_outcome(
        &self,
        transaction_id: &str,
        escrow: &EscrowPayment,
        events: Events,
    ) -> Result<Transaction> {
        let interim = match escrow.status {
            EscrowStatus::Held => TransactionStatus::EscrowHeld,
            EscrowStatus::Released => TransactionStatus::EscrowReleased,
            EscrowStatus::Refunded => TransactionStatus::Refunded,
            EscrowStatus::Disputed => TransactionStatus::Disputed,
        };
        let fallback = match escrow.status {
            EscrowStatus::Held => None,
            EscrowStatus::Released => Some(EventKind::EscrowReleased),
            EscrowStatus::Refunded => Some(EventKind::EscrowRefunded),
            EscrowStatus::Disputed => Some(EventKind::DisputeRaised),
        };

        let (txn, ()) = self
            .records
            .update_transaction(transaction_id, |txn| {
                let now = Utc::now();
                for (kind, detail) in &events {
                    txn.record(*kind, detail.clone(), now);
                }
                let already = txn.status == interim
                    || (interim == TransactionStatus::EscrowReleased
                        && txn.status == TransactionStatus::Completed);
                if !already {
                    if txn.transition(interim, now) {
                        if events.is_empty()
                            && let Some(kind) = fallback
                        {
                            txn.record(kind, Some("synchronized from escrow".to_string()), now);
                        }
                    } else {
                        tracing::warn!(
                            transaction_id = %txn.transaction_id,
                            from = txn.status.as_str(),
                            to = interim.as_str(),
                            "transaction status lags escrow and cannot follow"
                        );
                    }
                }
                Ok(())
            })
            .await?;

        let synced = match &txn.receipt_id {
            Some(receipt_id) => self.sync_receipt(&txn, receipt_id, escrow.status).await,
            None => Ok(()),
        };
        if let Err(error) = synced {
            tracing::warn!(%transaction_id, %error, "receipt status not updated");
            let detail = error.to_string();
            let (txn, ()) = self
                .records
                .update_transaction(transaction_id, |txn| {
                    txn.record(EventKind::ReceiptSyncFailed, Some(detail.clone()), Utc::now());
                    Ok(())
                })
                .await?;
            return Ok(txn);
        }

        if txn.status != TransactionStatus::EscrowReleased {
            return Ok(txn);
        }
        let (txn, ()) = self
            .records
            .update_transaction(transaction_id, |txn| {
                txn.transition(TransactionStatus::Completed, Utc::now());
                Ok(())
            })
            .await?;
        tracing::info!(%transaction_id, "transaction completed");
        Ok(txn)
    }

    async fn sync_receipt(&self, txn: &Transaction, receipt_id: &str, escrow_status: EscrowStatus) -> Result<()> {
        let receipt = self.receipts.get_receipt(receipt_id).await?;
        let payment_status = match escrow_status {
            EscrowStatus::Released => ReceiptPaymentStatus::Completed,
            EscrowStatus::Refunded => ReceiptPaymentStatus::Refunded,
            EscrowStatus::Held | EscrowStatus::Disputed => receipt.payment_status,
        };
        if receipt.payment_status == payment_status && receipt.escrow_status == escrow_status {
            return Ok(());
        }
        let delivered_at = (escrow_status == EscrowStatus::Released && receipt.delivered_at.is_none())
            .then(|| {
                txn.events
                    .iter()
                    .rev()
                    .find(|e| e.kind == EventKind::DeliveryConfirmed)
                    .map(|e| e.at)
                    .unwrap_or_else(Utc::now)
            });
        self.receipts
            .update_receipt_status(receipt_id, payment_status, Some(escrow_status), delivered_at)
            .await?;
        Ok(())
    }
}

/// Rejects, before any money moves, every request the receipt step would refuse.
fn validate_request(request: &TransactionRequest, platform_fee_bps: u32) -> Result<()> {
    for (field, value) in [
        ("order_id", &request.order_id),
        ("farmer.id", &request.farmer.id),
        ("transporter.id", &request.transporter.id),
    ] {
        if value.trim().is_empty() {
            return Err(SettlementError::Validation(format!("{} is required", field)));
        }
    }
    let items = billable_items(request)
        .into_iter()
        .map(LineItem::priced)
        .collect::<Result<Vec<_>>>()?;
    let subtotal = items
        .iter()
        .try_fold(0i64, |acc, item| acc.checked_add(item.total))
        .ok_or_else(|| SettlementError::InvalidAmount("item total overflows".to_string()))?;
    if subtotal != request.amount {
        return Err(SettlementError::Validation(format!(
            "items sum to {} but amount is {}",
            subtotal, request.amount
        )));
    }
    let platform_fee = money::fee_from_bps(subtotal, platform_fee_bps)?;
    ReceiptTotals::compute(&items, platform_fee)?;
    Ok(())
}

/// The request's items, or a single transport line covering the whole amount.
fn billable_items(request: &TransactionRequest) -> Vec<LineItemInput> {
    if !request.items.is_empty() {
        return request.items.clone();
    }
    vec![LineItemInput {
        description: format!("Transport: {}", request.cargo.description),
        quantity: 1,
        unit_price: request.amount,
    }]
}

fn uncaptured_result(txn: &Transaction) -> TransactionResult {
    TransactionResult {
        success: false,
        transaction_id: txn.transaction_id.clone(),
        status: txn.status,
        escrow_id: None,
        receipt_id: None,
        failure: Some(FailureKind::PaymentDeclined),
        message: "Payment was never captured; nothing to resume. Submit the payment again.".to_string(),
    }
}

fn settled_result(txn: &Transaction, message: &str) -> TransactionResult {
    TransactionResult {
        success: true,
        transaction_id: txn.transaction_id.clone(),
        status: txn.status,
        escrow_id: txn.escrow_id.clone(),
        receipt_id: txn.receipt_id.clone(),
        failure: None,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::receipt::{CargoSnapshot, PartySnapshot};
    use crate::domain::transaction::PaymentMethod;
    use rust_decimal_macros::dec;

    fn request(amount: i64, items: Vec<LineItemInput>) -> TransactionRequest {
        let party = |id: &str| PartySnapshot {
            id: id.to_string(),
            name: id.to_uppercase(),
            phone: "+250788000000".to_string(),
            email: None,
            location: None,
        };
        TransactionRequest {
            order_id: "ord_1".to_string(),
            farmer: party("f1"),
            transporter: party("t1"),
            cargo: CargoSnapshot {
                description: "Maize".to_string(),
                quantity: dec!(20),
                unit: "bags".to_string(),
                pickup_location: "Musanze".to_string(),
                delivery_location: "Kigali".to_string(),
                distance_km: None,
            },
            amount,
            payment_method: PaymentMethod::MobileMoney,
            items,
            notes: None,
            metadata: None,
        }
    }

    fn item(quantity: u32, unit_price: i64) -> LineItemInput {
        LineItemInput {
            description: "Bag".to_string(),
            quantity,
            unit_price,
        }
    }

    #[test]
    fn test_default_item_bills_full_amount() {
        let items = billable_items(&request(50_000, Vec::new()));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].unit_price, 50_000);
        assert_eq!(items[0].description, "Transport: Maize");
    }

    #[test]
    fn test_items_must_sum_to_amount() {
        assert!(validate_request(&request(50_000, vec![item(2, 25_000)]), 200).is_ok());
        assert!(matches!(
            validate_request(&request(50_000, vec![item(2, 20_000)]), 200),
            Err(SettlementError::Validation(_))
        ));
        assert!(matches!(
            validate_request(&request(1, vec![item(u32::MAX, i64::MAX)]), 200),
            Err(SettlementError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_negative_item_rejected_even_when_sum_matches() {
        let items = vec![item(1, 60_000), item(1, -10_000)];
        assert!(matches!(
            validate_request(&request(50_000, items), 200),
            Err(SettlementError::InvalidAmount(msg)) if msg.contains("negative unit price")
        ));
    }

    #[test]
    fn test_amount_whose_receipt_total_overflows_is_rejected() {
        assert!(matches!(
            validate_request(&request(i64::MAX, Vec::new()), 200),
            Err(SettlementError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_blank_ids_rejected() {
        let mut req = request(100, Vec::new());
        req.transporter.id = "  ".to_string();
        match validate_request(&req, 200) {
            Err(SettlementError::Validation(msg)) => assert!(msg.contains("transporter.id")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
