use miette::Diagnostic;
use thiserror::Error;

/// Errors produced by the settlement engine.
///
/// `InvalidAmount` and `PaymentDeclined` are raised before any financial record
/// exists. `InvalidStateTransition` is surfaced unchanged from the escrow ledger;
/// callers should re-fetch status instead of retrying blindly.
#[derive(Error, Diagnostic, Debug)]
pub enum SettlementError {
    #[error("Invalid amount: {0}")]
    #[diagnostic(code(cargoledger::invalid_amount))]
    InvalidAmount(String),

    #[error("Invalid state transition for {entity} {id}: {from} -> {to}")]
    #[diagnostic(
        code(cargoledger::invalid_state_transition),
        help("re-fetch the current status before retrying")
    )]
    InvalidStateTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    #[error("{entity} not found: {id}")]
    #[diagnostic(code(cargoledger::not_found))]
    NotFound { entity: &'static str, id: String },

    #[error("Payment declined: {0}")]
    #[diagnostic(code(cargoledger::payment_declined))]
    PaymentDeclined(String),

    #[error("Notification failed: {0}")]
    #[diagnostic(code(cargoledger::notification_failed))]
    NotificationFailed(String),

    #[error("Transaction {0} has no escrow")]
    #[diagnostic(code(cargoledger::missing_escrow))]
    MissingEscrow(String),

    #[error("Order {order_id} already has {entity} {id} owned by another transaction")]
    #[diagnostic(code(cargoledger::duplicate_record))]
    DuplicateRecord {
        entity: &'static str,
        order_id: String,
        id: String,
    },

    #[error("Declared total {declared} does not match computed total {computed}")]
    #[diagnostic(code(cargoledger::total_mismatch))]
    TotalMismatch { declared: i64, computed: i64 },

    #[error("Validation error: {0}")]
    #[diagnostic(code(cargoledger::validation))]
    Validation(String),

    #[error("{0} timed out")]
    #[diagnostic(code(cargoledger::timeout))]
    Timeout(&'static str),

    #[error("Concurrent update conflict on {0}")]
    #[diagnostic(code(cargoledger::conflict))]
    Conflict(String),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(cargoledger::serialization))]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    #[diagnostic(code(cargoledger::csv))]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    #[diagnostic(code(cargoledger::io))]
    Io(#[from] std::io::Error),

    #[cfg(feature = "storage-rocksdb")]
    #[error("Storage error: {0}")]
    #[diagnostic(code(cargoledger::storage))]
    Storage(#[from] rocksdb::Error),

    #[error("Internal error: {0}")]
    #[diagnostic(code(cargoledger::internal))]
    Internal(Box<dyn std::error::Error + Send + Sync>),
}

impl SettlementError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn invalid_transition(
        entity: &'static str,
        id: impl Into<String>,
        from: impl std::fmt::Debug,
        to: impl std::fmt::Debug,
    ) -> Self {
        Self::InvalidStateTransition {
            entity,
            id: id.into(),
            from: format!("{:?}", from),
            to: format!("{:?}", to),
        }
    }
}

pub type Result<T> = std::result::Result<T, SettlementError>;
