use super::records::{ESCROW_NS, RECEIPT_NS, Records, TRANSACTION_NS};
use crate::domain::escrow::EscrowPayment;
use crate::domain::receipt::DigitalReceipt;
use crate::domain::transaction::Transaction;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

pub const INDEX_NS: &str = "index:";

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ActorRole {
    Farmer,
    Transporter,
}

impl fmt::Display for ActorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorRole::Farmer => write!(f, "farmer"),
            ActorRole::Transporter => write!(f, "transporter"),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum IndexKind {
    Transactions,
    Escrows,
    Receipts,
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKind::Transactions => write!(f, "transactions"),
            IndexKind::Escrows => write!(f, "escrows"),
            IndexKind::Receipts => write!(f, "receipts"),
        }
    }
}

pub fn actor_key(role: ActorRole, actor_id: &str, kind: IndexKind) -> String {
    format!("{}{}:{}:{}", INDEX_NS, role, actor_id, kind)
}

pub fn order_key(order_id: &str) -> String {
    format!("{}order:{}", INDEX_NS, order_id)
}

pub fn receipt_number_key(number: &str) -> String {
    format!("{}receipt_number:{}", INDEX_NS, number)
}

/// One-to-one links from an order to its current settlement records.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Default)]
pub struct OrderLinks {
    pub transaction_id: Option<String>,
    pub escrow_id: Option<String>,
    pub receipt_id: Option<String>,
}

#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct RebuildReport {
    pub transactions: usize,
    pub escrows: usize,
    pub receipts: usize,
    pub actor_lists: usize,
    pub orders: usize,
}

/// Maintains the secondary lookups. Indices are a cache over the primary
/// records: every entry can be recomputed by [`Indexer::rebuild`].
#[derive(Clone)]
pub struct Indexer {
    records: Records,
}

impl Indexer {
    pub fn new(records: Records) -> Self {
        Self { records }
    }

    /// Appends `id` to the actor's list unless it is already there.
    pub async fn link_actor(
        &self,
        role: ActorRole,
        actor_id: &str,
        kind: IndexKind,
        id: &str,
    ) -> Result<()> {
        let key = actor_key(role, actor_id, kind);
        if self
            .records
            .store()
            .append_unique(&key, id.as_bytes().to_vec())
            .await?
        {
            tracing::debug!(%key, id, "index append");
        }
        Ok(())
    }

    pub async fn link_parties(
        &self,
        farmer_id: &str,
        transporter_id: &str,
        kind: IndexKind,
        id: &str,
    ) -> Result<()> {
        self.link_actor(ActorRole::Farmer, farmer_id, kind, id).await?;
        self.link_actor(ActorRole::Transporter, transporter_id, kind, id)
            .await
    }

    pub async fn ids(&self, role: ActorRole, actor_id: &str, kind: IndexKind) -> Result<Vec<String>> {
        Ok(self
            .records
            .store()
            .list(&actor_key(role, actor_id, kind))
            .await?
            .into_iter()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .collect())
    }

    /// Ids under both roles, farmer list first, without duplicates.
    pub async fn ids_any_role(&self, actor_id: &str, kind: IndexKind) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for role in [ActorRole::Farmer, ActorRole::Transporter] {
            for id in self.ids(role, actor_id, kind).await? {
                if seen.insert(id.clone()) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }

    pub async fn order_links(&self, order_id: &str) -> Result<OrderLinks> {
        Ok(self
            .records
            .get(&order_key(order_id))
            .await?
            .unwrap_or_default())
    }

    /// Atomically edits the order's links. An error from `apply` leaves them untouched.
    pub async fn update_order_links<F>(&self, order_id: &str, apply: F) -> Result<OrderLinks>
    where
        F: FnMut(&mut OrderLinks) -> Result<()>,
    {
        let (links, ()) = self.records.upsert(&order_key(order_id), apply).await?;
        Ok(links)
    }

    /// Claims a receipt number. Returns false if it is already taken.
    pub async fn reserve_receipt_number(&self, number: &str, receipt_id: &str) -> Result<bool> {
        self.records
            .insert(&receipt_number_key(number), &receipt_id)
            .await
    }

    /// Recomputes every index from a full scan of the primary records.
    ///
    /// Actor lists are ordered by record creation time. An order links to its
    /// most recent transaction and to the escrow and receipt of that transaction.
    pub async fn rebuild(&self) -> Result<RebuildReport> {
        let transactions: Vec<Transaction> = self.records.scan(TRANSACTION_NS).await?;
        let escrows: Vec<EscrowPayment> = self.records.scan(ESCROW_NS).await?;
        let receipts: Vec<DigitalReceipt> = self.records.scan(RECEIPT_NS).await?;

        let mut lists: BTreeMap<String, Vec<(DateTime<Utc>, String)>> = BTreeMap::new();
        let mut push = |role, actor: &str, kind, at, id: &str| {
            lists
                .entry(actor_key(role, actor, kind))
                .or_default()
                .push((at, id.to_string()));
        };
        for t in &transactions {
            push(ActorRole::Farmer, &t.farmer_id, IndexKind::Transactions, t.created_at, &t.transaction_id);
            push(ActorRole::Transporter, &t.transporter_id, IndexKind::Transactions, t.created_at, &t.transaction_id);
        }
        for e in &escrows {
            push(ActorRole::Farmer, &e.farmer_id, IndexKind::Escrows, e.created_at, &e.escrow_id);
            push(ActorRole::Transporter, &e.transporter_id, IndexKind::Escrows, e.created_at, &e.escrow_id);
        }
        for r in &receipts {
            push(ActorRole::Farmer, &r.farmer.id, IndexKind::Receipts, r.issued_at, &r.receipt_id);
            push(ActorRole::Transporter, &r.transporter.id, IndexKind::Receipts, r.issued_at, &r.receipt_id);
        }

        let store = self.records.store();
        let stale: Vec<String> = store
            .list_keys(INDEX_NS)
            .await?
            .into_iter()
            .filter(|key| !lists.contains_key(key))
            .collect();
        for key in stale {
            store.replace_list(&key, Vec::new()).await?;
        }
        let actor_lists = lists.len();
        for (key, mut entries) in lists {
            entries.sort();
            let values = entries.into_iter().map(|(_, id)| id.into_bytes()).collect();
            store.replace_list(&key, values).await?;
        }

        let mut latest: BTreeMap<&str, &Transaction> = BTreeMap::new();
        for t in &transactions {
            let slot = latest.entry(t.order_id.as_str()).or_insert(t);
            if t.created_at > slot.created_at {
                *slot = t;
            }
        }
        let orders = latest.len();
        for (order_id, t) in latest {
            let links = OrderLinks {
                transaction_id: Some(t.transaction_id.clone()),
                escrow_id: escrows
                    .iter()
                    .find(|e| e.transaction_id == t.transaction_id)
                    .map(|e| e.escrow_id.clone()),
                receipt_id: receipts
                    .iter()
                    .find(|r| r.transaction_id == t.transaction_id)
                    .map(|r| r.receipt_id.clone()),
            };
            self.records.put(&order_key(order_id), &links).await?;
        }
        for r in &receipts {
            self.records
                .put(&receipt_number_key(&r.receipt_number), &r.receipt_id)
                .await?;
        }

        tracing::info!(
            transactions = transactions.len(),
            escrows = escrows.len(),
            receipts = receipts.len(),
            actor_lists,
            orders,
            "indices rebuilt"
        );

        Ok(RebuildReport {
            transactions: transactions.len(),
            escrows: escrows.len(),
            receipts: receipts.len(),
            actor_lists,
            orders,
        })
    }
}
