#![cfg(feature = "storage-rocksdb")]

use assert_cmd::cargo_bin;
use payrecon::application::PaymentLedger;
use payrecon::domain::money::{Amount, Currency};
use payrecon::domain::order::OrderId;
use payrecon::domain::payment::PaymentStatus;
use payrecon::domain::ports::PaymentStoreRef;
use payrecon::domain::provider::Provider;
use payrecon::infrastructure::rocksdb::RocksDbStore;
use std::process::Command;
use std::sync::Arc;
use tempfile::tempdir;

#[tokio::test]
async fn test_report_reads_payments_written_by_earlier_process() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test_db");

    let payment_id = {
        let store: PaymentStoreRef = Arc::new(RocksDbStore::open(&db_path).unwrap());
        let ledger = PaymentLedger::new(store);
        let payment = ledger
            .open(
                OrderId::new(),
                Provider::CardWallet,
                Amount::new(2599).unwrap(),
                Currency::new("USD").unwrap(),
            )
            .await
            .unwrap();
        ledger.attach_provider_ref(payment.id, "CW-PERSISTED").await.unwrap();
        ledger
            .transition(payment.id, PaymentStatus::Pending, PaymentStatus::Completed, None)
            .await
            .unwrap();
        payment.id
    };

    let output = Command::new(cargo_bin!("payrecon"))
        .args(["report", "--status", "completed", "--db-path"])
        .arg(&db_path)
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let row = stdout
        .lines()
        .find(|line| line.starts_with(&payment_id.to_string()))
        .unwrap();
    assert!(row.contains(",card_wallet,CW-PERSISTED,completed,25.99,USD,0,"));
}
