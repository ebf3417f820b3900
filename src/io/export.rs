use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;

use crate::application::Bank;
use crate::domain::{format_cents, Account, Branch, Customer, Loan, Transaction};

/// Full database snapshot for archival
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSnapshot {
    pub version: String,
    pub exported_at: DateTime<Utc>,
    pub branches: Vec<Branch>,
    pub customers: Vec<Customer>,
    pub accounts: Vec<Account>,
    pub transactions: Vec<Transaction>,
    pub loans: Vec<Loan>,
}

/// Exporter for statements, account lists and snapshots
pub struct Exporter<'a> {
    bank: &'a Bank,
}

impl<'a> Exporter<'a> {
    pub fn new(bank: &'a Bank) -> Self {
        Self { bank }
    }

    /// Export an account statement to CSV, newest transaction first
    pub async fn export_statement_csv<W: Write>(
        &self,
        account_number: &str,
        writer: W,
    ) -> Result<usize> {
        let statement = self.bank.ledger.statement(account_number, None).await?;
        let mut csv_writer = csv::Writer::from_writer(writer);

        csv_writer.write_record([
            "id",
            "sequence",
            "created_at",
            "type",
            "reference",
            "from_account",
            "to_account",
            "amount",
            "charges",
            "gst",
            "total_debit",
            "status",
            "balance_after",
            "description",
        ])?;

        let mut count = 0;
        for txn in &statement.transactions {
            csv_writer.write_record([
                txn.id.to_string(),
                txn.sequence.to_string(),
                txn.created_at.to_rfc3339(),
                txn.transaction_type.to_string(),
                txn.reference_number.clone().unwrap_or_default(),
                txn.from_account
                    .as_ref()
                    .map(|s| s.account_number.clone())
                    .unwrap_or_default(),
                txn.to_account
                    .as_ref()
                    .map(|s| s.account_number.clone())
                    .unwrap_or_default(),
                format_cents(txn.amount),
                format_cents(txn.charges),
                format_cents(txn.gst),
                format_cents(txn.total_debit),
                txn.status.to_string(),
                txn.balance_after.map(format_cents).unwrap_or_default(),
                txn.description.clone().unwrap_or_default(),
            ])?;
            count += 1;
        }

        csv_writer.flush()?;
        Ok(count)
    }

    /// Export every account with its balance to CSV
    pub async fn export_accounts_csv<W: Write>(&self, writer: W) -> Result<usize> {
        let accounts = self.bank.ledger.list_accounts(None).await?;
        let mut csv_writer = csv::Writer::from_writer(writer);

        csv_writer.write_record([
            "account_number",
            "customer_id",
            "type",
            "status",
            "balance",
            "minimum_balance",
            "upi_id",
        ])?;

        let mut count = 0;
        for account in &accounts {
            csv_writer.write_record([
                account.account_number.clone(),
                account.customer_id.to_string(),
                account.account_type.to_string(),
                account.status.to_string(),
                format_cents(account.balance),
                format_cents(account.minimum_balance),
                account.upi_id.clone().unwrap_or_default(),
            ])?;
            count += 1;
        }

        csv_writer.flush()?;
        Ok(count)
    }

    /// Export the full database as a JSON snapshot
    pub async fn export_full_json<W: Write>(&self, mut writer: W) -> Result<DatabaseSnapshot> {
        let snapshot = DatabaseSnapshot {
            version: env!("CARGO_PKG_VERSION").to_string(),
            exported_at: Utc::now(),
            branches: self.bank.ledger.list_branches().await?,
            customers: self.bank.ledger.list_customers().await?,
            accounts: self.bank.ledger.list_accounts(None).await?,
            transactions: self.bank.ledger.list_transactions().await?,
            loans: self.bank.loans.list_loans(None).await?,
        };

        let json = serde_json::to_string_pretty(&snapshot)?;
        writer.write_all(json.as_bytes())?;
        writer.flush()?;

        Ok(snapshot)
    }
}
