use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

#[test]
fn test_cli_end_to_end() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::new(cargo_bin!("cargoledger"));
    cmd.arg("tests/fixtures/commands.jsonl");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains(
            "transaction_id,order_id,status,escrow_status,receipt_number,amount,events",
        ))
        .stdout(predicate::str::contains("ord_a,completed,released,RCP-"))
        .stdout(predicate::str::contains("ord_b,refunded,refunded,RCP-"))
        .stdout(predicate::str::contains("ord_c,disputed,disputed,RCP-"))
        .stdout(predicate::str::contains(
            ",50000,payment_initiated|payment_completed|escrow_created|receipt_generated|receipt_emailed|delivery_confirmed|escrow_released",
        ))
        .stderr(predicate::str::contains("Error reading command"))
        .stderr(predicate::str::contains("Error processing command for order ord_unknown"));

    Ok(())
}

#[test]
fn test_cli_declined_payments() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::new(cargo_bin!("cargoledger"));
    cmd.arg("tests/fixtures/commands.jsonl").arg("--decline-payments");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains(
            "ord_a,pending,,,50000,payment_initiated|payment_failed",
        ))
        .stdout(predicate::str::contains("escrow_held").not())
        .stderr(predicate::str::contains("has no escrow"));

    Ok(())
}

#[test]
fn test_cli_platform_fee_from_env() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::new(cargo_bin!("cargoledger"));
    cmd.arg("tests/fixtures/commands.jsonl")
        .env("CARGOLEDGER_PLATFORM_FEE_BPS", "0");

    cmd.assert().success().stdout(predicate::str::contains("ord_a,completed"));

    Ok(())
}

#[test]
fn test_cli_missing_input_fails() {
    let mut cmd = Command::new(cargo_bin!("cargoledger"));
    cmd.arg("tests/fixtures/does_not_exist.jsonl");
    cmd.assert().failure();
}
