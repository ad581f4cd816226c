use crate::domain::escrow::EscrowStatus;
use crate::domain::money::{self, format_minor};
use crate::domain::transaction::PaymentMethod;
use crate::error::{Result, SettlementError};
use chrono::{DateTime, Datelike, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Party details frozen at issuance; later profile edits do not touch receipts.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct PartySnapshot {
    pub id: String,
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct CargoSnapshot {
    pub description: String,
    pub quantity: Decimal,
    pub unit: String,
    pub pickup_location: String,
    pub delivery_location: String,
    #[serde(default)]
    pub distance_km: Option<Decimal>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct LineItemInput {
    pub description: String,
    pub quantity: u32,
    pub unit_price: i64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct LineItem {
    pub description: String,
    pub quantity: u32,
    pub unit_price: i64,
    pub total: i64,
}

impl LineItem {
    pub fn priced(input: LineItemInput) -> Result<Self> {
        if input.unit_price < 0 {
            return Err(SettlementError::InvalidAmount(format!(
                "negative unit price for '{}'",
                input.description
            )));
        }
        let total = input
            .unit_price
            .checked_mul(i64::from(input.quantity))
            .ok_or_else(|| {
                SettlementError::InvalidAmount(format!(
                    "line total overflows for '{}'",
                    input.description
                ))
            })?;
        Ok(Self {
            description: input.description,
            quantity: input.quantity,
            unit_price: input.unit_price,
            total,
        })
    }
}

/// Figures computed once at issuance and never recomputed.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
pub struct ReceiptTotals {
    pub subtotal: i64,
    pub platform_fee: i64,
    pub tax: i64,
    pub total_amount: i64,
}

impl ReceiptTotals {
    pub fn compute(items: &[LineItem], platform_fee: i64) -> Result<Self> {
        if platform_fee < 0 {
            return Err(SettlementError::InvalidAmount(
                "platform fee cannot be negative".to_string(),
            ));
        }
        let subtotal = items
            .iter()
            .try_fold(0i64, |acc, item| acc.checked_add(item.total))
            .ok_or_else(|| SettlementError::InvalidAmount("subtotal overflows".to_string()))?;
        let tax = money::tax_for(subtotal)?;
        let total_amount = subtotal
            .checked_add(platform_fee)
            .and_then(|v| v.checked_add(tax))
            .ok_or_else(|| SettlementError::InvalidAmount("total overflows".to_string()))?;
        Ok(Self {
            subtotal,
            platform_fee,
            tax,
            total_amount,
        })
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptPaymentStatus {
    Pending,
    Completed,
    Refunded,
}

impl ReceiptPaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptPaymentStatus::Pending => "pending",
            ReceiptPaymentStatus::Completed => "completed",
            ReceiptPaymentStatus::Refunded => "refunded",
        }
    }
}

/// Immutable proof of a transaction. Only status fields and timestamps change
/// after issuance.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct DigitalReceipt {
    pub receipt_id: String,
    pub receipt_number: String,
    pub transaction_id: String,
    pub order_id: String,
    pub farmer: PartySnapshot,
    pub transporter: PartySnapshot,
    pub cargo: CargoSnapshot,
    pub items: Vec<LineItem>,
    pub subtotal: i64,
    pub platform_fee: i64,
    pub tax: i64,
    pub total_amount: i64,
    pub currency: String,
    pub payment_method: PaymentMethod,
    pub payment_status: ReceiptPaymentStatus,
    pub escrow_status: EscrowStatus,
    pub tracking_number: String,
    pub notes: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    /// First successful email delivery; repeat sends leave it alone.
    pub emailed_at: Option<DateTime<Utc>>,
}

impl DigitalReceipt {
    pub fn totals(&self) -> ReceiptTotals {
        ReceiptTotals {
            subtotal: self.subtotal,
            platform_fee: self.platform_fee,
            tax: self.tax,
            total_amount: self.total_amount,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.total_amount == self.subtotal + self.platform_fee + self.tax
            && money::tax_for(self.subtotal).ok() == Some(self.tax)
    }

    /// Human-readable rendering of the stored state. Identical receipts render
    /// to identical text; the generation stamp lives outside the content.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let cur = self.currency.as_str();
        let _ = writeln!(out, "DIGITAL RECEIPT {}", self.receipt_number);
        let _ = writeln!(out, "Issued: {}", self.issued_at.format("%Y-%m-%d %H:%M:%S UTC"));
        let _ = writeln!(out, "Transaction: {}", self.transaction_id);
        let _ = writeln!(out, "Order: {}", self.order_id);
        let _ = writeln!(out, "Tracking: {}", self.tracking_number);
        let _ = writeln!(out);
        render_party(&mut out, "Shipper", &self.farmer);
        render_party(&mut out, "Transporter", &self.transporter);
        let _ = writeln!(out, "Cargo: {}", self.cargo.description);
        let _ = writeln!(out, "  Quantity: {} {}", self.cargo.quantity, self.cargo.unit);
        let _ = writeln!(
            out,
            "  Route: {} -> {}",
            self.cargo.pickup_location, self.cargo.delivery_location
        );
        if let Some(distance) = self.cargo.distance_km {
            let _ = writeln!(out, "  Distance: {} km", distance);
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "Items:");
        for item in &self.items {
            let _ = writeln!(
                out,
                "  {} x{} @ {} = {}",
                item.description,
                item.quantity,
                format_minor(item.unit_price, cur),
                format_minor(item.total, cur)
            );
        }
        let _ = writeln!(out, "Subtotal: {}", format_minor(self.subtotal, cur));
        let _ = writeln!(out, "Platform fee: {}", format_minor(self.platform_fee, cur));
        let _ = writeln!(out, "Tax (18%): {}", format_minor(self.tax, cur));
        let _ = writeln!(out, "TOTAL: {}", format_minor(self.total_amount, cur));
        let _ = writeln!(out);
        let _ = writeln!(out, "Payment method: {}", self.payment_method.label());
        let _ = writeln!(out, "Payment status: {}", self.payment_status.as_str());
        let _ = writeln!(out, "Escrow status: {}", self.escrow_status.as_str());
        if let Some(delivered_at) = self.delivered_at {
            let _ = writeln!(out, "Delivered: {}", delivered_at.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        if let Some(notes) = &self.notes {
            let _ = writeln!(out, "Notes: {}", notes);
        }
        out
    }
}

fn render_party(out: &mut String, label: &str, party: &PartySnapshot) {
    let _ = writeln!(out, "{}: {} ({})", label, party.name, party.id);
    let _ = writeln!(out, "  Phone: {}", party.phone);
    if let Some(email) = &party.email {
        let _ = writeln!(out, "  Email: {}", email);
    }
    if let Some(location) = &party.location {
        let _ = writeln!(out, "  Location: {}", location);
    }
}

/// `RCP-<year>-<6 random digits>-<last 6 digits of the millisecond timestamp>`.
pub fn receipt_number<R: Rng>(now: DateTime<Utc>, rng: &mut R) -> String {
    let random: u32 = rng.gen_range(0..1_000_000);
    let suffix = now.timestamp_millis().rem_euclid(1_000_000);
    format!("RCP-{}-{:06}-{:06}", now.year(), random, suffix)
}

pub fn tracking_number<R: Rng>(rng: &mut R) -> String {
    format!("TRK-{:08X}", rng.r#gen::<u32>())
}

/// A rendered receipt plus the moment it was rendered.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct ReceiptDocument {
    pub receipt_id: String,
    pub content: String,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Sms,
}

/// One attempt to deliver a receipt.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct DeliveryRecord {
    pub receipt_id: String,
    pub channel: Channel,
    pub recipient: String,
    pub success: bool,
    pub error: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

/// Per-actor receipt totals for one calendar month.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Default)]
pub struct MonthSummary {
    pub actor_id: String,
    pub year: i32,
    pub month: u32,
    pub receipt_count: usize,
    pub total_amount: i64,
    pub completed_count: usize,
    pub completed_amount: i64,
    pub pending_count: usize,
    pub pending_amount: i64,
    pub refunded_count: usize,
    pub refunded_amount: i64,
}

impl MonthSummary {
    pub fn aggregate<'a>(
        actor_id: &str,
        year: i32,
        month: u32,
        receipts: impl IntoIterator<Item = &'a DigitalReceipt>,
    ) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(SettlementError::Validation(format!(
                "month must be 1-12, got {}",
                month
            )));
        }
        let mut summary = MonthSummary {
            actor_id: actor_id.to_string(),
            year,
            month,
            ..Default::default()
        };
        for receipt in receipts
            .into_iter()
            .filter(|r| r.issued_at.year() == year && r.issued_at.month() == month)
        {
            summary.receipt_count += 1;
            summary.total_amount += receipt.total_amount;
            match receipt.payment_status {
                ReceiptPaymentStatus::Completed => {
                    summary.completed_count += 1;
                    summary.completed_amount += receipt.total_amount;
                }
                ReceiptPaymentStatus::Pending => {
                    summary.pending_count += 1;
                    summary.pending_amount += receipt.total_amount;
                }
                ReceiptPaymentStatus::Refunded => {
                    summary.refunded_count += 1;
                    summary.refunded_amount += receipt.total_amount;
                }
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rust_decimal_macros::dec;

    fn items() -> Vec<LineItem> {
        vec![
            LineItem::priced(LineItemInput {
                description: "Transport".to_string(),
                quantity: 1,
                unit_price: 40000,
            })
            .unwrap(),
            LineItem::priced(LineItemInput {
                description: "Loading".to_string(),
                quantity: 2,
                unit_price: 5000,
            })
            .unwrap(),
        ]
    }

    fn sample_receipt(issued_at: DateTime<Utc>, status: ReceiptPaymentStatus) -> DigitalReceipt {
        let items = items();
        let totals = ReceiptTotals::compute(&items, 1000).unwrap();
        DigitalReceipt {
            receipt_id: "rcp_1".to_string(),
            receipt_number: "RCP-2026-000001-000001".to_string(),
            transaction_id: "txn_1".to_string(),
            order_id: "order_1".to_string(),
            farmer: PartySnapshot {
                id: "farmer_1".to_string(),
                name: "Amina".to_string(),
                phone: "+250700000001".to_string(),
                email: Some("amina@example.com".to_string()),
                location: None,
            },
            transporter: PartySnapshot {
                id: "transporter_1".to_string(),
                name: "Jean".to_string(),
                phone: "+250700000002".to_string(),
                email: None,
                location: Some("Kigali".to_string()),
            },
            cargo: CargoSnapshot {
                description: "Maize".to_string(),
                quantity: dec!(1.5),
                unit: "t".to_string(),
                pickup_location: "Musanze".to_string(),
                delivery_location: "Kigali".to_string(),
                distance_km: Some(dec!(92.4)),
            },
            items,
            subtotal: totals.subtotal,
            platform_fee: totals.platform_fee,
            tax: totals.tax,
            total_amount: totals.total_amount,
            currency: "RWF".to_string(),
            payment_method: PaymentMethod::MobileMoney,
            payment_status: status,
            escrow_status: EscrowStatus::Held,
            tracking_number: "TRK-0000ABCD".to_string(),
            notes: None,
            issued_at,
            delivered_at: None,
            confirmed_at: None,
            emailed_at: None,
        }
    }

    #[test]
    fn test_totals_invariant() {
        let totals = ReceiptTotals::compute(&items(), 1000).unwrap();
        assert_eq!(totals.subtotal, 50000);
        assert_eq!(totals.tax, 9000);
        assert_eq!(totals.total_amount, 60000);
        assert_eq!(
            totals.total_amount,
            totals.subtotal + totals.platform_fee + totals.tax
        );
    }

    #[test]
    fn test_line_item_overflow_rejected() {
        let result = LineItem::priced(LineItemInput {
            description: "huge".to_string(),
            quantity: u32::MAX,
            unit_price: i64::MAX,
        });
        assert!(matches!(result, Err(SettlementError::InvalidAmount(_))));
    }

    #[test]
    fn test_render_is_deterministic() {
        let issued = Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 0).unwrap();
        let receipt = sample_receipt(issued, ReceiptPaymentStatus::Pending);
        let first = receipt.render();
        assert_eq!(first, receipt.clone().render());
        assert!(first.contains("TOTAL: 600.00 RWF"));
        assert!(first.contains("Route: Musanze -> Kigali"));
        assert!(first.contains("Payment method: Mobile Money"));
    }

    #[test]
    fn test_receipt_number_format() {
        let mut rng = StdRng::seed_from_u64(7);
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap();
        let number = receipt_number(now, &mut rng);
        let parts: Vec<&str> = number.split('-').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "RCP");
        assert_eq!(parts[1], "2026");
        assert_eq!(parts[2].len(), 6);
        assert_eq!(parts[3].len(), 6);
    }

    #[test]
    fn test_month_summary_splits_by_status() {
        let march = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        let april = Utc.with_ymd_and_hms(2026, 4, 2, 0, 0, 0).unwrap();
        let receipts = vec![
            sample_receipt(march, ReceiptPaymentStatus::Completed),
            sample_receipt(march, ReceiptPaymentStatus::Refunded),
            sample_receipt(march, ReceiptPaymentStatus::Pending),
            sample_receipt(april, ReceiptPaymentStatus::Completed),
        ];

        let summary = MonthSummary::aggregate("farmer_1", 2026, 3, &receipts).unwrap();
        assert_eq!(summary.receipt_count, 3);
        assert_eq!(summary.total_amount, 180000);
        assert_eq!(summary.completed_count, 1);
        assert_eq!(summary.refunded_amount, 60000);
        assert_eq!(summary.pending_count, 1);

        assert!(MonthSummary::aggregate("farmer_1", 2026, 13, &receipts).is_err());
    }
}
