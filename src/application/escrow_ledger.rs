use super::index::{ActorRole, IndexKind, Indexer};
use super::records::{Records, escrow_key, new_id};
use crate::config::EngineConfig;
use crate::domain::escrow::{
    Dispute, EscrowPayment, EscrowRefund, EscrowRelease, EscrowStats, NewEscrow,
};
use crate::domain::money::Amount;
use crate::error::{Result, SettlementError};
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub const RELEASE_LOG: &str = "log:release";
pub const REFUND_LOG: &str = "log:refund";

/// Owns escrow records and their release/refund audit logs.
///
/// Every status change goes through a compare-and-swap on the escrow record
/// and re-checks the status against the freshly read value, so a duplicate
/// release or refund fails with `InvalidStateTransition` instead of settling
/// twice.
#[derive(Clone)]
pub struct EscrowLedger {
    records: Records,
    indexer: Indexer,
    config: Arc<EngineConfig>,
}

impl EscrowLedger {
    pub fn new(records: Records, indexer: Indexer, config: Arc<EngineConfig>) -> Self {
        Self {
            records,
            indexer,
            config,
        }
    }

    /// Opens an escrow in `held` status for the transaction.
    ///
    /// An order holds at most one escrow. Calling this again for the same
    /// transaction returns the escrow already opened for it; a different
    /// transaction on the same order gets `DuplicateRecord`.
    pub async fn create_escrow(&self, request: NewEscrow) -> Result<EscrowPayment> {
        Amount::new(request.amount)?;

        let candidate = new_id("esc");
        let links = self
            .indexer
            .update_order_links(&request.order_id, |links| {
                if let Some(owner) = &links.transaction_id
                    && owner != &request.transaction_id
                    && links.escrow_id.is_some()
                {
                    return Err(SettlementError::DuplicateRecord {
                        entity: "escrow",
                        order_id: request.order_id.clone(),
                        id: links.escrow_id.clone().unwrap_or_default(),
                    });
                }
                if links.escrow_id.is_none() {
                    links.escrow_id = Some(candidate.clone());
                }
                Ok(())
            })
            .await?;
        let escrow_id = links.escrow_id.unwrap_or(candidate);

        if let Some(existing) = self.records.get::<EscrowPayment>(&escrow_key(&escrow_id)).await? {
            if existing.transaction_id != request.transaction_id {
                return Err(SettlementError::DuplicateRecord {
                    entity: "escrow",
                    order_id: request.order_id,
                    id: escrow_id,
                });
            }
            tracing::info!(%escrow_id, transaction_id = %existing.transaction_id, "escrow already open");
            return Ok(existing);
        }

        let escrow = EscrowPayment::open(
            escrow_id.clone(),
            request,
            &self.config.currency,
            self.config.escrow_sla(),
            Utc::now(),
        )?;
        if !self.records.insert(&escrow_key(&escrow_id), &escrow).await? {
            // lost a race with a concurrent create for the same claim
            return self.records.escrow(&escrow_id).await;
        }
        self.indexer
            .link_parties(
                &escrow.farmer_id,
                &escrow.transporter_id,
                IndexKind::Escrows,
                &escrow.escrow_id,
            )
            .await?;

        tracing::info!(
            escrow_id = %escrow.escrow_id,
            transaction_id = %escrow.transaction_id,
            amount = escrow.amount.value(),
            held_until = %escrow.held_until,
            "escrow held"
        );
        Ok(escrow)
    }

    /// Pays the escrow out to the transporter. Legal from `held` and `disputed`.
    pub async fn release_escrow(
        &self,
        escrow_id: &str,
        confirmation_id: Option<String>,
    ) -> Result<EscrowRelease> {
        let now = Utc::now();
        let (_, release) = self
            .records
            .update_escrow(escrow_id, |escrow| escrow.release(confirmation_id.clone(), now))
            .await?;
        self.records.append(RELEASE_LOG, &release).await?;
        tracing::info!(
            escrow_id,
            amount = release.amount.value(),
            payee = %release.transporter_id,
            "escrow released"
        );
        Ok(release)
    }

    /// Returns the funds to the farmer. Legal from `held` and `disputed`.
    pub async fn refund_escrow(
        &self,
        escrow_id: &str,
        reason: &str,
        confirmation_id: Option<String>,
    ) -> Result<EscrowRefund> {
        let now = Utc::now();
        let (_, refund) = self
            .records
            .update_escrow(escrow_id, |escrow| {
                escrow.refund(reason, confirmation_id.clone(), now)
            })
            .await?;
        self.records.append(REFUND_LOG, &refund).await?;
        tracing::info!(escrow_id, amount = refund.amount.value(), reason, "escrow refunded");
        Ok(refund)
    }

    /// Flags the escrow as disputed. Resolution happens through a later
    /// release or refund.
    pub async fn dispute_escrow(
        &self,
        escrow_id: &str,
        reason: &str,
        initiated_by: &str,
        evidence: Vec<String>,
    ) -> Result<EscrowPayment> {
        let dispute = Dispute {
            reason: reason.to_string(),
            initiated_by: initiated_by.to_string(),
            created_at: Utc::now(),
            evidence,
        };
        let (escrow, ()) = self
            .records
            .update_escrow(escrow_id, |escrow| escrow.dispute(dispute.clone()))
            .await?;
        tracing::warn!(escrow_id, reason, initiated_by, "escrow disputed");
        Ok(escrow)
    }

    pub async fn get_escrow(&self, escrow_id: &str) -> Result<EscrowPayment> {
        self.records.escrow(escrow_id).await
    }

    pub async fn get_by_actor(&self, actor_id: &str, role: ActorRole) -> Result<Vec<EscrowPayment>> {
        let ids = self.indexer.ids(role, actor_id, IndexKind::Escrows).await?;
        self.load_all(ids).await
    }

    /// Held escrows past their SLA deadline, for either role.
    pub async fn get_overdue(&self, actor_id: &str) -> Result<Vec<EscrowPayment>> {
        self.get_overdue_at(actor_id, Utc::now()).await
    }

    pub async fn get_overdue_at(
        &self,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<EscrowPayment>> {
        let ids = self.indexer.ids_any_role(actor_id, IndexKind::Escrows).await?;
        Ok(self
            .load_all(ids)
            .await?
            .into_iter()
            .filter(|escrow| escrow.is_overdue(now))
            .collect())
    }

    pub async fn stats(&self, actor_id: &str, role: ActorRole) -> Result<EscrowStats> {
        let escrows = self.get_by_actor(actor_id, role).await?;
        Ok(EscrowStats::aggregate(&escrows, Utc::now()))
    }

    pub async fn release_log(&self) -> Result<Vec<EscrowRelease>> {
        self.records.list(RELEASE_LOG).await
    }

    pub async fn refund_log(&self) -> Result<Vec<EscrowRefund>> {
        self.records.list(REFUND_LOG).await
    }

    async fn load_all(&self, ids: Vec<String>) -> Result<Vec<EscrowPayment>> {
        let mut escrows = Vec::with_capacity(ids.len());
        for id in ids {
            match self.records.get::<EscrowPayment>(&escrow_key(&id)).await? {
                Some(escrow) => escrows.push(escrow),
                None => tracing::warn!(escrow_id = %id, "index points at missing escrow"),
            }
        }
        Ok(escrows)
    }
}
