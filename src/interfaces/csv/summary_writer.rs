use crate::application::orchestrator::TransactionView;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

/// One output row per transaction.
#[derive(Debug, Serialize, PartialEq, Clone)]
pub struct SummaryRow {
    pub transaction_id: String,
    pub order_id: String,
    pub status: &'static str,
    pub escrow_status: Option<&'static str>,
    pub receipt_number: Option<String>,
    pub amount: i64,
    /// Event kinds joined with `|`, oldest first.
    pub events: String,
}

impl From<&TransactionView> for SummaryRow {
    fn from(view: &TransactionView) -> Self {
        let txn = &view.transaction;
        Self {
            transaction_id: txn.transaction_id.clone(),
            order_id: txn.order_id.clone(),
            status: txn.status.as_str(),
            escrow_status: view.escrow.as_ref().map(|e| e.status.as_str()),
            receipt_number: view.receipt.as_ref().map(|r| r.receipt_number.clone()),
            amount: txn.amount,
            events: txn
                .events
                .iter()
                .map(|e| event_name(e.kind))
                .collect::<Vec<_>>()
                .join("|"),
        }
    }
}

fn event_name(kind: crate::domain::transaction::EventKind) -> String {
    serde_json::to_value(kind)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{:?}", kind))
}

/// Writes the transaction summary as CSV with a header row.
pub struct SummaryWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> SummaryWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_views<'a, I>(&mut self, views: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a TransactionView>,
    {
        for view in views {
            self.writer.serialize(SummaryRow::from(view))?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
