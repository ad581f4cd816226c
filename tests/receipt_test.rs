mod common;

use cargoledger::application::index::{ActorRole, Indexer};
use cargoledger::application::receipts::{ReceiptDraft, ReceiptGenerator};
use cargoledger::application::records::Records;
use cargoledger::config::EngineConfig;
use cargoledger::domain::escrow::EscrowStatus;
use cargoledger::domain::receipt::{Channel, LineItemInput, ReceiptPaymentStatus};
use cargoledger::domain::transaction::PaymentMethod;
use cargoledger::error::SettlementError;
use cargoledger::infrastructure::in_memory::InMemoryStore;
use common::{FlakyNotifier, party, request};
use std::collections::HashSet;
use std::sync::Arc;

fn generator(notifier: Arc<FlakyNotifier>) -> ReceiptGenerator {
    let records = Records::new(Arc::new(InMemoryStore::new()), 8);
    let indexer = Indexer::new(records.clone());
    ReceiptGenerator::new(records, indexer, notifier, Arc::new(EngineConfig::default()))
}

fn draft(order: &str, items: Vec<LineItemInput>, platform_fee: i64) -> ReceiptDraft {
    let req = request(order, 1);
    ReceiptDraft {
        transaction_id: format!("txn_{}", order),
        order_id: order.to_string(),
        farmer: party("farmer_r", Some("f@example.com")),
        transporter: party("transporter_r", None),
        cargo: req.cargo,
        items,
        payment_method: PaymentMethod::BankTransfer,
        platform_fee,
        declared_total: None,
        notes: Some("fragile".to_string()),
    }
}

fn item(description: &str, quantity: u32, unit_price: i64) -> LineItemInput {
    LineItemInput {
        description: description.to_string(),
        quantity,
        unit_price,
    }
}

#[tokio::test]
async fn test_totals_follow_the_invariants() {
    let generator = generator(FlakyNotifier::reliable());
    let receipt = generator
        .generate_receipt(draft(
            "ord_items",
            vec![item("Loading", 2, 1_250), item("Haulage", 1, 7_333)],
            300,
        ))
        .await
        .unwrap();

    assert_eq!(receipt.subtotal, 9_833);
    // 9833 * 0.18 = 1769.94
    assert_eq!(receipt.tax, 1_770);
    assert_eq!(receipt.total_amount, 9_833 + 300 + 1_770);
    assert!(receipt.is_consistent());
    assert_eq!(receipt.items.iter().map(|i| i.total).sum::<i64>(), receipt.subtotal);
    assert_eq!(receipt.payment_status, ReceiptPaymentStatus::Pending);
    assert_eq!(receipt.escrow_status, EscrowStatus::Held);
    assert!(receipt.receipt_number.starts_with("RCP-"));
    assert!(receipt.tracking_number.starts_with("TRK-"));
}

#[tokio::test]
async fn test_declared_total_mismatch_rejected() {
    let generator = generator(FlakyNotifier::reliable());
    let mut bad = draft("ord_decl", vec![item("Haulage", 1, 10_000)], 0);
    bad.declared_total = Some(10_000);
    match generator.generate_receipt(bad).await {
        Err(SettlementError::TotalMismatch { declared, computed }) => {
            assert_eq!(declared, 10_000);
            assert_eq!(computed, 11_800);
        }
        other => panic!("unexpected {:?}", other.map(|r| r.receipt_id)),
    }

    let mut good = draft("ord_decl", vec![item("Haulage", 1, 10_000)], 0);
    good.declared_total = Some(11_800);
    assert!(generator.generate_receipt(good).await.is_ok());
}

#[tokio::test]
async fn test_receipt_requires_items() {
    let generator = generator(FlakyNotifier::reliable());
    let result = generator.generate_receipt(draft("ord_empty", Vec::new(), 0)).await;
    assert!(matches!(result, Err(SettlementError::Validation(_))));
}

#[tokio::test]
async fn test_receipt_numbers_are_unique() {
    let generator = generator(FlakyNotifier::reliable());
    let mut numbers = HashSet::new();
    for i in 0..25 {
        let receipt = generator
            .generate_receipt(draft(&format!("ord_u{}", i), vec![item("Haulage", 1, 100)], 0))
            .await
            .unwrap();
        assert!(numbers.insert(receipt.receipt_number));
    }
    let listed = generator
        .get_receipts_by_actor("farmer_r", ActorRole::Farmer)
        .await
        .unwrap();
    assert_eq!(listed.len(), 25);
}

#[tokio::test]
async fn test_only_status_fields_change_after_issue() {
    let generator = generator(FlakyNotifier::reliable());
    let issued = generator
        .generate_receipt(draft("ord_status", vec![item("Haulage", 3, 2_000)], 120))
        .await
        .unwrap();

    let updated = generator
        .update_receipt_status(
            &issued.receipt_id,
            ReceiptPaymentStatus::Completed,
            Some(EscrowStatus::Released),
            Some(chrono::Utc::now()),
        )
        .await
        .unwrap();
    assert_eq!(updated.totals(), issued.totals());
    assert_eq!(updated.items, issued.items);
    assert_eq!(updated.receipt_number, issued.receipt_number);
    let confirmed_at = updated.confirmed_at.unwrap();

    let again = generator
        .update_receipt_status(&issued.receipt_id, ReceiptPaymentStatus::Completed, None, None)
        .await
        .unwrap();
    assert_eq!(again.confirmed_at, Some(confirmed_at));
    assert_eq!(again.escrow_status, EscrowStatus::Released);
}

#[tokio::test]
async fn test_email_retry_records_history() {
    let notifier = FlakyNotifier::failing(1);
    let generator = generator(notifier.clone());
    let receipt = generator
        .generate_receipt(draft("ord_mail", vec![item("Haulage", 1, 4_000)], 0))
        .await
        .unwrap();

    let first = generator.email_receipt(&receipt.receipt_id, "f@example.com").await.unwrap();
    assert!(!first.success);
    assert!(first.error.unwrap().contains("mailbox full"));
    assert!(generator.get_receipt(&receipt.receipt_id).await.unwrap().emailed_at.is_none());

    let second = generator.email_receipt(&receipt.receipt_id, "f@example.com").await.unwrap();
    assert!(second.success);
    let sms = generator
        .send_receipt(&receipt.receipt_id, Channel::Sms, "+250788000000")
        .await
        .unwrap();
    assert!(sms.success);

    let stored = generator.get_receipt(&receipt.receipt_id).await.unwrap();
    assert_eq!(stored.emailed_at, Some(second.attempted_at));
    let history = generator.delivery_history(&receipt.receipt_id).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(notifier.sent().len(), 2);

    let document = generator.render_presentation(&receipt.receipt_id).await.unwrap();
    assert!(document.content.contains(&stored.receipt_number));
    assert_eq!(document.content, stored.render());
}
