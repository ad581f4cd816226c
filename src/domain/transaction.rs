use crate::domain::receipt::{CargoSnapshot, LineItemInput, PartySnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    #[serde(rename = "momo", alias = "mobile_money")]
    MobileMoney,
    Card,
    BankTransfer,
    Cash,
}

impl PaymentMethod {
    pub fn label(&self) -> &'static str {
        match self {
            PaymentMethod::MobileMoney => "Mobile Money",
            PaymentMethod::Card => "Card",
            PaymentMethod::BankTransfer => "Bank Transfer",
            PaymentMethod::Cash => "Cash",
        }
    }
}

/// Saga-level status of a transaction.
///
/// `pending -> payment_processing -> escrow_held -> {completed | refunded | disputed}`,
/// with `disputed -> {completed | refunded}` as the only exit from a dispute.
/// `pending` is only re-entered when the payment step fails. A paid transaction
/// whose escrow exists but whose later steps keep failing may still be
/// refunded or disputed straight from `payment_processing`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    PaymentProcessing,
    EscrowHeld,
    EscrowReleased,
    Completed,
    Refunded,
    Disputed,
}

impl TransactionStatus {
    pub fn can_transition_to(self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, PaymentProcessing)
                | (PaymentProcessing, Pending)
                | (PaymentProcessing, EscrowHeld)
                | (PaymentProcessing, Refunded)
                | (PaymentProcessing, Disputed)
                | (EscrowHeld, EscrowReleased)
                | (EscrowHeld, Completed)
                | (EscrowHeld, Refunded)
                | (EscrowHeld, Disputed)
                | (EscrowReleased, Completed)
                | (Disputed, Disputed)
                | (Disputed, EscrowReleased)
                | (Disputed, Completed)
                | (Disputed, Refunded)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::PaymentProcessing => "payment_processing",
            TransactionStatus::EscrowHeld => "escrow_held",
            TransactionStatus::EscrowReleased => "escrow_released",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Refunded => "refunded",
            TransactionStatus::Disputed => "disputed",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PaymentInitiated,
    PaymentFailed,
    PaymentCompleted,
    EscrowCreated,
    EscrowCreationFailed,
    ReceiptGenerated,
    ReceiptGenerationFailed,
    ReceiptEmailed,
    NotificationFailed,
    DeliveryConfirmed,
    EscrowReleased,
    EscrowRefunded,
    DisputeRaised,
    ReceiptSyncFailed,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct TransactionEvent {
    pub kind: EventKind,
    pub at: DateTime<Utc>,
    pub detail: Option<String>,
}

/// What a caller submits to start the forward saga.
///
/// Replayed requests from an offline queue use the same shape.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct TransactionRequest {
    pub order_id: String,
    pub farmer: PartySnapshot,
    pub transporter: PartySnapshot,
    pub cargo: CargoSnapshot,
    pub amount: i64,
    pub payment_method: PaymentMethod,
    /// Optional itemization; when absent the whole amount is billed as one
    /// transport line. When present its sum must equal `amount`.
    #[serde(default)]
    pub items: Vec<LineItemInput>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Root record of the settlement saga.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Transaction {
    pub transaction_id: String,
    pub order_id: String,
    pub farmer_id: String,
    pub transporter_id: String,
    pub status: TransactionStatus,
    pub payment_method: PaymentMethod,
    pub amount: i64,
    pub payment_id: Option<String>,
    pub escrow_id: Option<String>,
    pub receipt_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Append-only, chronological.
    pub events: Vec<TransactionEvent>,
    pub request: TransactionRequest,
}

impl Transaction {
    pub fn new(transaction_id: String, request: TransactionRequest, now: DateTime<Utc>) -> Self {
        Self {
            transaction_id,
            order_id: request.order_id.clone(),
            farmer_id: request.farmer.id.clone(),
            transporter_id: request.transporter.id.clone(),
            status: TransactionStatus::Pending,
            payment_method: request.payment_method,
            amount: request.amount,
            payment_id: None,
            escrow_id: None,
            receipt_id: None,
            created_at: now,
            updated_at: now,
            events: Vec::new(),
            request,
        }
    }

    pub fn record(&mut self, kind: EventKind, detail: Option<String>, now: DateTime<Utc>) {
        self.events.push(TransactionEvent {
            kind,
            at: now,
            detail,
        });
        self.updated_at = now;
    }

    /// Returns false, leaving the status untouched, if the move is not legal.
    pub fn transition(&mut self, next: TransactionStatus, now: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = now;
        true
    }

    pub fn has_event(&self, kind: EventKind) -> bool {
        self.events.iter().any(|e| e.kind == kind)
    }

    pub fn payment_captured(&self) -> bool {
        self.has_event(EventKind::PaymentCompleted)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Nothing was charged.
    PaymentDeclined,
    /// Money was captured but a later step failed; the saga is resumable.
    PostPaymentStep,
}

/// Caller-facing outcome of a saga entry point.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct TransactionResult {
    pub success: bool,
    pub transaction_id: String,
    pub status: TransactionStatus,
    pub escrow_id: Option<String>,
    pub receipt_id: Option<String>,
    pub failure: Option<FailureKind>,
    pub message: String,
}
