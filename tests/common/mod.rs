// Allow dead_code because these helpers are used across different test files
// which are compiled separately
#![allow(dead_code)]

use anyhow::Result;
use khata::application::NewAccount;
use khata::config::Policy;
use khata::domain::{rupees, Account, AccountType, Cents, Customer, KycStatus};
use khata::Bank;
use tempfile::TempDir;

pub const BRANCH_IFSC: &str = "KHAT0000001";

/// Helper to create a test bank with a temporary database
pub async fn test_bank() -> Result<(Bank, TempDir)> {
    let temp_dir = TempDir::new()?;
    let bank = Bank::init(db_path(&temp_dir).as_str(), Policy::default()).await?;
    Ok((bank, temp_dir))
}

pub fn db_path(temp_dir: &TempDir) -> String {
    temp_dir.path().join("test.db").to_string_lossy().into_owned()
}

/// Test fixture: a branch and KYC-verified customers with funded accounts
pub struct Fixtures;

impl Fixtures {
    pub async fn branch(bank: &Bank) -> Result<()> {
        bank.ledger.create_branch("Main Branch", BRANCH_IFSC).await?;
        Ok(())
    }

    /// Register a customer and mark their KYC verified
    pub async fn verified_customer(bank: &Bank, name: &str) -> Result<Customer> {
        let customer = bank.ledger.create_customer(name, None).await?;
        Ok(bank
            .ledger
            .set_kyc_status(customer.id, KycStatus::Verified)
            .await?)
    }

    /// Open an account with an opening deposit and an explicit minimum balance
    pub async fn account(
        bank: &Bank,
        customer: &Customer,
        account_type: AccountType,
        deposit: Cents,
        minimum_balance: Option<Cents>,
    ) -> Result<Account> {
        Ok(bank
            .ledger
            .open_account(NewAccount {
                customer_id: customer.id,
                branch_ifsc: BRANCH_IFSC.to_string(),
                account_type,
                initial_deposit: deposit,
                minimum_balance,
            })
            .await?)
    }

    /// Branch plus two customers, each with a savings account holding ₹50,000
    pub async fn two_savings(bank: &Bank) -> Result<(Account, Account)> {
        Self::branch(bank).await?;
        let asha = Self::verified_customer(bank, "Asha Rao").await?;
        let vikram = Self::verified_customer(bank, "Vikram Shah").await?;
        let a = Self::account(bank, &asha, AccountType::Savings, rupees(50_000), None).await?;
        let b = Self::account(bank, &vikram, AccountType::Savings, rupees(50_000), None).await?;
        Ok((a, b))
    }
}
