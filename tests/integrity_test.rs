mod common;

use anyhow::Result;
use common::{db_path, test_bank, Fixtures};
use khata::domain::{rupees, IntegrityIssue, TransferRail};
use khata::io::{DatabaseSnapshot, Exporter};
use sqlx::SqlitePool;

#[tokio::test]
async fn test_integrity_holds_after_service_operations() -> Result<()> {
    let (bank, _temp) = test_bank().await?;
    let (a, b) = Fixtures::two_savings(&bank).await?;

    bank.ledger.deposit(&a.account_number, rupees(1_000), None).await?;
    bank.ledger.withdraw(&b.account_number, rupees(2_000), None).await?;
    let neft = bank
        .ledger
        .transfer(
            &a.account_number,
            &b.account_number,
            rupees(25_000),
            TransferRail::Neft,
            None,
        )
        .await?;
    bank.ledger
        .reverse_transaction(neft.transaction.id, None)
        .await?;

    let report = bank.ledger.check_integrity().await?;
    assert!(report.is_ok(), "issues: {:?}", report.issues);
    assert_eq!(report.account_count, 2);
    assert_eq!(report.transaction_count, 6);

    Ok(())
}

#[tokio::test]
async fn test_integrity_detects_tampered_balance() -> Result<()> {
    let (bank, temp) = test_bank().await?;
    let (a, _) = Fixtures::two_savings(&bank).await?;

    let pool = SqlitePool::connect(&format!("sqlite:{}", db_path(&temp))).await?;
    sqlx::query("UPDATE accounts SET balance = balance + 100 WHERE account_number = ?")
        .bind(&a.account_number)
        .execute(&pool)
        .await?;
    pool.close().await;

    let report = bank.ledger.check_integrity().await?;
    assert!(!report.is_ok());
    assert!(report.issues.iter().any(|issue| matches!(
        issue,
        IntegrityIssue::BalanceMismatch { account_number, .. } if *account_number == a.account_number
    )));

    Ok(())
}

#[tokio::test]
async fn test_exports_cover_the_ledger() -> Result<()> {
    let (bank, _temp) = test_bank().await?;
    let (a, b) = Fixtures::two_savings(&bank).await?;
    bank.ledger
        .transfer(
            &a.account_number,
            &b.account_number,
            rupees(500),
            TransferRail::Imps,
            Some("Rent share".into()),
        )
        .await?;

    let exporter = Exporter::new(&bank);

    let mut statement = Vec::new();
    let rows = exporter
        .export_statement_csv(&a.account_number, &mut statement)
        .await?;
    assert_eq!(rows, 2);
    let csv = String::from_utf8(statement)?;
    assert!(csv.starts_with("id,sequence,created_at,type"));
    assert!(csv.contains("Rent share"));

    let mut accounts = Vec::new();
    assert_eq!(exporter.export_accounts_csv(&mut accounts).await?, 2);

    let mut json = Vec::new();
    exporter.export_full_json(&mut json).await?;
    let snapshot: DatabaseSnapshot = serde_json::from_slice(&json)?;
    assert_eq!(snapshot.branches.len(), 1);
    assert_eq!(snapshot.customers.len(), 2);
    assert_eq!(snapshot.accounts.len(), 2);
    assert_eq!(snapshot.transactions.len(), 3);
    assert!(snapshot.loans.is_empty());

    Ok(())
}
