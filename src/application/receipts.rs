use super::index::{ActorRole, IndexKind, Indexer};
use super::records::{Records, new_id, receipt_key};
use crate::config::EngineConfig;
use crate::domain::escrow::EscrowStatus;
use crate::domain::money::format_minor;
use crate::domain::ports::NotifierRef;
use crate::domain::receipt::{
    CargoSnapshot, Channel, DeliveryRecord, DigitalReceipt, LineItem, LineItemInput, MonthSummary,
    PartySnapshot, ReceiptDocument, ReceiptPaymentStatus, ReceiptTotals, receipt_number,
    tracking_number,
};
use crate::domain::transaction::PaymentMethod;
use crate::error::{Result, SettlementError};
use chrono::{DateTime, Utc};
use std::sync::Arc;

const RECEIPT_NUMBER_ATTEMPTS: usize = 5;

pub fn delivery_log_key(receipt_id: &str) -> String {
    format!("log:delivery:{}", receipt_id)
}

/// Input to [`ReceiptGenerator::generate_receipt`].
#[derive(Debug, Clone)]
pub struct ReceiptDraft {
    pub transaction_id: String,
    pub order_id: String,
    pub farmer: PartySnapshot,
    pub transporter: PartySnapshot,
    pub cargo: CargoSnapshot,
    pub items: Vec<LineItemInput>,
    pub payment_method: PaymentMethod,
    pub platform_fee: i64,
    /// Grand total as the caller computed it, if any. Only checked, never trusted.
    pub declared_total: Option<i64>,
    pub notes: Option<String>,
}

#[derive(Clone)]
pub struct ReceiptGenerator {
    records: Records,
    indexer: Indexer,
    notifier: NotifierRef,
    config: Arc<EngineConfig>,
}

impl ReceiptGenerator {
    pub fn new(
        records: Records,
        indexer: Indexer,
        notifier: NotifierRef,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            records,
            indexer,
            notifier,
            config,
        }
    }

    /// Issues the receipt for a transaction.
    ///
    /// Totals are recomputed from the items: `subtotal` is their sum, `tax` is
    /// `round(subtotal * 0.18)` and `total_amount = subtotal + platform_fee + tax`.
    /// A second call for the same transaction returns the receipt already issued.
    pub async fn generate_receipt(&self, draft: ReceiptDraft) -> Result<DigitalReceipt> {
        if draft.items.is_empty() {
            return Err(SettlementError::Validation(
                "a receipt needs at least one line item".to_string(),
            ));
        }
        let items = draft
            .items
            .iter()
            .cloned()
            .map(LineItem::priced)
            .collect::<Result<Vec<_>>>()?;
        let totals = ReceiptTotals::compute(&items, draft.platform_fee)?;
        if let Some(declared) = draft.declared_total
            && declared != totals.total_amount
        {
            return Err(SettlementError::TotalMismatch {
                declared,
                computed: totals.total_amount,
            });
        }

        let candidate = new_id("rcp");
        let links = self
            .indexer
            .update_order_links(&draft.order_id, |links| {
                if let Some(owner) = &links.transaction_id
                    && owner != &draft.transaction_id
                    && links.receipt_id.is_some()
                {
                    return Err(SettlementError::DuplicateRecord {
                        entity: "receipt",
                        order_id: draft.order_id.clone(),
                        id: links.receipt_id.clone().unwrap_or_default(),
                    });
                }
                if links.receipt_id.is_none() {
                    links.receipt_id = Some(candidate.clone());
                }
                Ok(())
            })
            .await?;
        let receipt_id = links.receipt_id.unwrap_or(candidate);

        if let Some(existing) = self.records.get::<DigitalReceipt>(&receipt_key(&receipt_id)).await? {
            if existing.transaction_id != draft.transaction_id {
                return Err(SettlementError::DuplicateRecord {
                    entity: "receipt",
                    order_id: draft.order_id,
                    id: receipt_id,
                });
            }
            return Ok(existing);
        }

        let now = Utc::now();
        let number = self.issue_number(&receipt_id, now).await?;
        let receipt = DigitalReceipt {
            receipt_id: receipt_id.clone(),
            receipt_number: number,
            transaction_id: draft.transaction_id,
            order_id: draft.order_id,
            farmer: draft.farmer,
            transporter: draft.transporter,
            cargo: draft.cargo,
            items,
            subtotal: totals.subtotal,
            platform_fee: totals.platform_fee,
            tax: totals.tax,
            total_amount: totals.total_amount,
            currency: self.config.currency.clone(),
            payment_method: draft.payment_method,
            payment_status: ReceiptPaymentStatus::Pending,
            escrow_status: EscrowStatus::Held,
            tracking_number: tracking_number(&mut rand::thread_rng()),
            notes: draft.notes,
            issued_at: now,
            delivered_at: None,
            confirmed_at: None,
            emailed_at: None,
        };
        if !self.records.insert(&receipt_key(&receipt_id), &receipt).await? {
            return self.records.receipt(&receipt_id).await;
        }
        self.indexer
            .link_parties(
                &receipt.farmer.id,
                &receipt.transporter.id,
                IndexKind::Receipts,
                &receipt.receipt_id,
            )
            .await?;

        tracing::info!(
            receipt_id = %receipt.receipt_id,
            receipt_number = %receipt.receipt_number,
            total = receipt.total_amount,
            "receipt issued"
        );
        Ok(receipt)
    }

    /// The only mutation allowed after issuance. Reaching `completed` stamps
    /// `confirmed_at` the first time.
    pub async fn update_receipt_status(
        &self,
        receipt_id: &str,
        payment_status: ReceiptPaymentStatus,
        escrow_status: Option<EscrowStatus>,
        delivered_at: Option<DateTime<Utc>>,
    ) -> Result<DigitalReceipt> {
        let now = Utc::now();
        let (receipt, ()) = self
            .records
            .update_receipt(receipt_id, |receipt| {
                receipt.payment_status = payment_status;
                if let Some(status) = escrow_status {
                    receipt.escrow_status = status;
                }
                if let Some(at) = delivered_at {
                    receipt.delivered_at = Some(at);
                }
                if payment_status == ReceiptPaymentStatus::Completed && receipt.confirmed_at.is_none() {
                    receipt.confirmed_at = Some(now);
                }
                Ok(())
            })
            .await?;
        tracing::info!(
            receipt_id,
            payment_status = payment_status.as_str(),
            escrow_status = receipt.escrow_status.as_str(),
            "receipt status updated"
        );
        Ok(receipt)
    }

    pub async fn render_presentation(&self, receipt_id: &str) -> Result<ReceiptDocument> {
        let receipt = self.records.receipt(receipt_id).await?;
        Ok(ReceiptDocument {
            receipt_id: receipt.receipt_id.clone(),
            content: receipt.render(),
            generated_at: Utc::now(),
        })
    }

    pub async fn email_receipt(&self, receipt_id: &str, recipient: &str) -> Result<DeliveryRecord> {
        self.send_receipt(receipt_id, Channel::Email, recipient).await
    }

    /// Sends the receipt and appends the attempt to its delivery history.
    ///
    /// Notifier failures and timeouts are recorded, not returned. For email,
    /// `emailed_at` keeps the first successful send.
    pub async fn send_receipt(
        &self,
        receipt_id: &str,
        channel: Channel,
        recipient: &str,
    ) -> Result<DeliveryRecord> {
        let receipt = self.records.receipt(receipt_id).await?;
        let content = match channel {
            Channel::Email => receipt.render(),
            Channel::Sms => sms_text(&receipt),
        };

        let sent = tokio::time::timeout(
            self.config.notifier_timeout(),
            self.notifier.send(channel, recipient, &content),
        )
        .await;
        let (success, error) = match sent {
            Ok(Ok(outcome)) => (outcome.success, outcome.error),
            Ok(Err(e)) => (false, Some(e.to_string())),
            Err(_) => (false, Some(SettlementError::Timeout("notifier").to_string())),
        };

        let attempted_at = Utc::now();
        let record = DeliveryRecord {
            receipt_id: receipt_id.to_string(),
            channel,
            recipient: recipient.to_string(),
            success,
            error,
            attempted_at,
        };
        self.records
            .append(&delivery_log_key(receipt_id), &record)
            .await?;

        if success && channel == Channel::Email && receipt.emailed_at.is_none() {
            self.records
                .update_receipt(receipt_id, |receipt| {
                    receipt.emailed_at.get_or_insert(attempted_at);
                    Ok(())
                })
                .await?;
        }
        if success {
            tracing::info!(receipt_id, ?channel, recipient, "receipt delivered");
        } else {
            tracing::warn!(receipt_id, ?channel, recipient, error = ?record.error, "receipt delivery failed");
        }
        Ok(record)
    }

    pub async fn delivery_history(&self, receipt_id: &str) -> Result<Vec<DeliveryRecord>> {
        self.records.list(&delivery_log_key(receipt_id)).await
    }

    pub async fn get_receipt(&self, receipt_id: &str) -> Result<DigitalReceipt> {
        self.records.receipt(receipt_id).await
    }

    pub async fn get_receipts_by_actor(
        &self,
        actor_id: &str,
        role: ActorRole,
    ) -> Result<Vec<DigitalReceipt>> {
        let ids = self.indexer.ids(role, actor_id, IndexKind::Receipts).await?;
        self.load_all(ids).await
    }

    /// Receipts issued in the given calendar month where the actor is either party.
    pub async fn get_month_summary(&self, actor_id: &str, year: i32, month: u32) -> Result<MonthSummary> {
        let ids = self.indexer.ids_any_role(actor_id, IndexKind::Receipts).await?;
        let receipts = self.load_all(ids).await?;
        MonthSummary::aggregate(actor_id, year, month, &receipts)
    }

    async fn issue_number(&self, receipt_id: &str, now: DateTime<Utc>) -> Result<String> {
        for _ in 0..RECEIPT_NUMBER_ATTEMPTS {
            let number = receipt_number(now, &mut rand::thread_rng());
            if self.indexer.reserve_receipt_number(&number, receipt_id).await? {
                return Ok(number);
            }
            tracing::debug!(%number, "receipt number collision");
        }
        Err(SettlementError::Conflict("receipt number".to_string()))
    }

    async fn load_all(&self, ids: Vec<String>) -> Result<Vec<DigitalReceipt>> {
        let mut receipts = Vec::with_capacity(ids.len());
        for id in ids {
            match self.records.get::<DigitalReceipt>(&receipt_key(&id)).await? {
                Some(receipt) => receipts.push(receipt),
                None => tracing::warn!(receipt_id = %id, "index points at missing receipt"),
            }
        }
        Ok(receipts)
    }
}

fn sms_text(receipt: &DigitalReceipt) -> String {
    format!(
        "Receipt {}: {} paid for {} ({} -> {}). Tracking {}.",
        receipt.receipt_number,
        format_minor(receipt.total_amount, &receipt.currency),
        receipt.cargo.description,
        receipt.cargo.pickup_location,
        receipt.cargo.delivery_location,
        receipt.tracking_number
    )
}
