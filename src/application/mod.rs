//! Settlement services built on the domain ports.
//!
//! `TransactionOrchestrator` is the entry point. It composes the escrow ledger
//! and the receipt generator over shared typed records and secondary indices.

pub mod escrow_ledger;
pub mod index;
pub mod orchestrator;
pub mod receipts;
pub mod records;
