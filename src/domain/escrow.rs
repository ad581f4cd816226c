use crate::domain::money::Amount;
use crate::domain::transaction::PaymentMethod;
use crate::error::{Result, SettlementError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EscrowStatus {
    Held,
    Released,
    Refunded,
    Disputed,
}

impl EscrowStatus {
    /// `released` and `refunded` are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EscrowStatus::Released | EscrowStatus::Refunded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowStatus::Held => "held",
            EscrowStatus::Released => "released",
            EscrowStatus::Refunded => "refunded",
            EscrowStatus::Disputed => "disputed",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Dispute {
    pub reason: String,
    pub initiated_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub evidence: Vec<String>,
}

/// Custody record for funds held between payment capture and delivery.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct EscrowPayment {
    pub escrow_id: String,
    pub transaction_id: String,
    pub order_id: String,
    /// Payer (shipper).
    pub farmer_id: String,
    /// Payee.
    pub transporter_id: String,
    pub amount: Amount,
    pub currency: String,
    pub status: EscrowStatus,
    pub payment_method: PaymentMethod,
    pub created_at: DateTime<Utc>,
    /// SLA deadline. Informational only, never enforced automatically.
    pub held_until: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub dispute: Option<Dispute>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Entry appended to the release log; tells the caller what to pay out and to whom.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct EscrowRelease {
    pub escrow_id: String,
    pub transaction_id: String,
    pub transporter_id: String,
    pub amount: Amount,
    pub currency: String,
    pub confirmation_id: Option<String>,
    pub released_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct EscrowRefund {
    pub escrow_id: String,
    pub transaction_id: String,
    pub farmer_id: String,
    pub amount: Amount,
    pub currency: String,
    pub reason: String,
    pub confirmation_id: Option<String>,
    pub refunded_at: DateTime<Utc>,
}

/// Everything needed to open an escrow.
#[derive(Debug, Clone)]
pub struct NewEscrow {
    pub transaction_id: String,
    pub order_id: String,
    pub farmer_id: String,
    pub transporter_id: String,
    pub amount: i64,
    pub payment_method: PaymentMethod,
    pub metadata: Option<serde_json::Value>,
}

impl EscrowPayment {
    pub fn open(
        escrow_id: String,
        request: NewEscrow,
        currency: &str,
        sla: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let amount = Amount::new(request.amount)?;
        Ok(Self {
            escrow_id,
            transaction_id: request.transaction_id,
            order_id: request.order_id,
            farmer_id: request.farmer_id,
            transporter_id: request.transporter_id,
            amount,
            currency: currency.to_string(),
            status: EscrowStatus::Held,
            payment_method: request.payment_method,
            created_at: now,
            held_until: now + sla,
            released_at: None,
            refunded_at: None,
            reason: None,
            dispute: None,
            metadata: request.metadata,
        })
    }

    /// Held and disputed escrows may be released; a dispute is closed this way
    /// when the resolver sides with the transporter.
    pub fn release(
        &mut self,
        confirmation_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<EscrowRelease> {
        if self.status.is_terminal() {
            return Err(self.transition_error(EscrowStatus::Released));
        }
        self.status = EscrowStatus::Released;
        self.released_at = Some(now);
        Ok(EscrowRelease {
            escrow_id: self.escrow_id.clone(),
            transaction_id: self.transaction_id.clone(),
            transporter_id: self.transporter_id.clone(),
            amount: self.amount,
            currency: self.currency.clone(),
            confirmation_id,
            released_at: now,
        })
    }

    pub fn refund(
        &mut self,
        reason: &str,
        confirmation_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<EscrowRefund> {
        if self.status.is_terminal() {
            return Err(self.transition_error(EscrowStatus::Refunded));
        }
        self.status = EscrowStatus::Refunded;
        self.refunded_at = Some(now);
        self.reason = Some(reason.to_string());
        Ok(EscrowRefund {
            escrow_id: self.escrow_id.clone(),
            transaction_id: self.transaction_id.clone(),
            farmer_id: self.farmer_id.clone(),
            amount: self.amount,
            currency: self.currency.clone(),
            reason: reason.to_string(),
            confirmation_id,
            refunded_at: now,
        })
    }

    /// Re-disputing an already disputed escrow replaces the dispute payload.
    pub fn dispute(&mut self, dispute: Dispute) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.transition_error(EscrowStatus::Disputed));
        }
        self.status = EscrowStatus::Disputed;
        self.dispute = Some(dispute);
        Ok(())
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == EscrowStatus::Held && now > self.held_until
    }

    fn transition_error(&self, to: EscrowStatus) -> SettlementError {
        SettlementError::invalid_transition("escrow", &self.escrow_id, self.status, to)
    }
}

/// Per-actor escrow counts and amounts by status.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Default)]
pub struct EscrowStats {
    pub total_count: usize,
    pub held_count: usize,
    pub held_amount: i64,
    pub released_count: usize,
    pub released_amount: i64,
    pub refunded_count: usize,
    pub refunded_amount: i64,
    pub disputed_count: usize,
    pub disputed_amount: i64,
    pub overdue_count: usize,
}

impl EscrowStats {
    pub fn aggregate<'a>(
        escrows: impl IntoIterator<Item = &'a EscrowPayment>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut stats = EscrowStats::default();
        for escrow in escrows {
            let amount = escrow.amount.value();
            stats.total_count += 1;
            match escrow.status {
                EscrowStatus::Held => {
                    stats.held_count += 1;
                    stats.held_amount += amount;
                }
                EscrowStatus::Released => {
                    stats.released_count += 1;
                    stats.released_amount += amount;
                }
                EscrowStatus::Refunded => {
                    stats.refunded_count += 1;
                    stats.refunded_amount += amount;
                }
                EscrowStatus::Disputed => {
                    stats.disputed_count += 1;
                    stats.disputed_amount += amount;
                }
            }
            if escrow.is_overdue(now) {
                stats.overdue_count += 1;
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn held_escrow() -> EscrowPayment {
        EscrowPayment::open(
            "esc_1".to_string(),
            NewEscrow {
                transaction_id: "txn_1".to_string(),
                order_id: "order_1".to_string(),
                farmer_id: "farmer_1".to_string(),
                transporter_id: "transporter_1".to_string(),
                amount: 50000,
                payment_method: PaymentMethod::MobileMoney,
                metadata: None,
            },
            "RWF",
            Duration::hours(24),
            Utc::now(),
        )
        .unwrap()
    }

    fn escrow_in(status: EscrowStatus) -> EscrowPayment {
        let mut escrow = held_escrow();
        escrow.status = status;
        escrow
    }

    fn sample_dispute() -> Dispute {
        Dispute {
            reason: "late".to_string(),
            initiated_by: "farmer_1".to_string(),
            created_at: Utc::now(),
            evidence: vec![],
        }
    }

    #[test]
    fn test_open_rejects_non_positive_amount() {
        let result = EscrowPayment::open(
            "esc_0".to_string(),
            NewEscrow {
                transaction_id: "txn".to_string(),
                order_id: "order".to_string(),
                farmer_id: "f".to_string(),
                transporter_id: "t".to_string(),
                amount: 0,
                payment_method: PaymentMethod::Card,
                metadata: None,
            },
            "RWF",
            Duration::hours(24),
            Utc::now(),
        );
        assert!(matches!(result, Err(SettlementError::InvalidAmount(_))));
    }

    #[test]
    fn test_open_sets_sla_deadline() {
        let now = Utc::now();
        let escrow = EscrowPayment::open(
            "esc_2".to_string(),
            NewEscrow {
                transaction_id: "txn".to_string(),
                order_id: "order".to_string(),
                farmer_id: "f".to_string(),
                transporter_id: "t".to_string(),
                amount: 10,
                payment_method: PaymentMethod::Card,
                metadata: None,
            },
            "RWF",
            Duration::hours(24),
            now,
        )
        .unwrap();
        assert_eq!(escrow.held_until, now + Duration::hours(24));
        assert_eq!(escrow.status, EscrowStatus::Held);
    }

    #[test]
    fn test_release_twice_fails() {
        let mut escrow = held_escrow();
        let release = escrow.release(Some("conf".to_string()), Utc::now()).unwrap();
        assert_eq!(release.amount.value(), 50000);
        assert_eq!(release.transporter_id, "transporter_1");

        let released_at = escrow.released_at;
        let second = escrow.release(None, Utc::now());
        assert!(matches!(
            second,
            Err(SettlementError::InvalidStateTransition { .. })
        ));
        assert_eq!(escrow.status, EscrowStatus::Released);
        assert_eq!(escrow.released_at, released_at);
    }

    #[test]
    fn test_transition_table() {
        use EscrowStatus::*;
        // (source, release allowed, refund allowed)
        let table = [
            (Held, true, true),
            (Disputed, true, true),
            (Released, false, false),
            (Refunded, false, false),
        ];

        for (source, release_ok, refund_ok) in table {
            let mut escrow = escrow_in(source);
            assert_eq!(
                escrow.release(None, Utc::now()).is_ok(),
                release_ok,
                "release from {:?}",
                source
            );

            let mut escrow = escrow_in(source);
            let refund = escrow.refund("cargo lost", None, Utc::now());
            assert_eq!(refund.is_ok(), refund_ok, "refund from {:?}", source);
            if !refund_ok {
                assert_eq!(escrow.status, source);
                assert!(escrow.reason.is_none());
            }
        }
    }

    #[test]
    fn test_dispute_is_repeatable_but_not_after_settlement() {
        let mut escrow = held_escrow();
        escrow.dispute(sample_dispute()).unwrap();

        let mut second = sample_dispute();
        second.reason = "damaged".to_string();
        escrow.dispute(second).unwrap();
        assert_eq!(escrow.status, EscrowStatus::Disputed);
        assert_eq!(escrow.dispute.as_ref().unwrap().reason, "damaged");

        escrow.refund("damaged", None, Utc::now()).unwrap();
        assert!(escrow.dispute(sample_dispute()).is_err());
    }

    #[test]
    fn test_overdue_only_while_held() {
        let mut escrow = held_escrow();
        let later = escrow.held_until + Duration::minutes(1);
        assert!(escrow.is_overdue(later));
        assert!(!escrow.is_overdue(escrow.created_at));

        escrow.dispute(sample_dispute()).unwrap();
        assert!(!escrow.is_overdue(later));
    }

    #[test]
    fn test_stats_aggregate() {
        let held = held_escrow();
        let released = escrow_in(EscrowStatus::Released);
        let refunded = escrow_in(EscrowStatus::Refunded);
        let late = held.held_until + Duration::hours(1);

        let stats = EscrowStats::aggregate([&held, &released, &refunded], late);
        assert_eq!(stats.total_count, 3);
        assert_eq!(stats.held_amount, 50000);
        assert_eq!(stats.released_count, 1);
        assert_eq!(stats.refunded_amount, 50000);
        assert_eq!(stats.overdue_count, 1);
    }
}
