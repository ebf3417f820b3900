use anyhow::Context;
use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

use crate::config::Policy;
use crate::domain::{
    build_integrity_report, format_cents, is_valid_ifsc, is_valid_upi_id, Account, AccountStatus,
    AccountType, Branch, Cents, Customer, CustomerId, FeeQuote, IntegrityReport, KycStatus,
    RailLimit, Transaction, TransactionId, TransactionStatus, TransferRail,
};
use crate::storage::Repository;

use super::AppError;

/// Branches, customers, accounts and every balance-affecting posting.
#[derive(Clone)]
pub struct LedgerService {
    repo: Repository,
    policy: Policy,
}

/// Request to open an account.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub customer_id: CustomerId,
    pub branch_ifsc: String,
    pub account_type: AccountType,
    pub initial_deposit: Cents,
    /// Overrides the account type's default minimum balance
    pub minimum_balance: Option<Cents>,
}

/// Result of a transfer between two accounts
#[derive(Debug, Clone, Serialize)]
pub struct TransferResult {
    pub transaction: Transaction,
    pub from_balance: Cents,
    pub to_balance: Cents,
}

/// Result of reversing a transaction
#[derive(Debug, Clone, Serialize)]
pub struct ReversalResult {
    pub reversal: Transaction,
    pub original: Transaction,
}

/// An account and its most recent transactions
#[derive(Debug, Clone, Serialize)]
pub struct Statement {
    pub account: Account,
    pub transactions: Vec<Transaction>,
}

impl LedgerService {
    pub fn new(repo: Repository, policy: Policy) -> Self {
        Self { repo, policy }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    // ========================
    // Branches and customers
    // ========================

    pub async fn create_branch(&self, name: &str, ifsc: &str) -> Result<Branch, AppError> {
        if name.trim().is_empty() {
            return Err(AppError::InvalidInput("Branch name is required".to_string()));
        }
        if !is_valid_ifsc(ifsc) {
            return Err(AppError::InvalidInput(format!("Invalid IFSC code: {}", ifsc)));
        }
        if self.repo.get_branch_by_ifsc(ifsc).await?.is_some() {
            return Err(AppError::AlreadyExists(format!("Branch {}", ifsc)));
        }

        let branch = Branch::new(name.trim(), ifsc);
        self.repo.save_branch(&branch).await?;
        info!(ifsc = %branch.ifsc, "branch created");
        Ok(branch)
    }

    pub async fn get_branch(&self, ifsc: &str) -> Result<Branch, AppError> {
        self.repo
            .get_branch_by_ifsc(ifsc)
            .await?
            .ok_or_else(|| AppError::BranchNotFound(ifsc.to_string()))
    }

    pub async fn list_branches(&self) -> Result<Vec<Branch>, AppError> {
        Ok(self.repo.list_branches().await?)
    }

    pub async fn create_customer(
        &self,
        full_name: &str,
        email: Option<String>,
    ) -> Result<Customer, AppError> {
        if full_name.trim().is_empty() {
            return Err(AppError::InvalidInput("Customer name is required".to_string()));
        }

        let mut customer = Customer::new(full_name.trim());
        if let Some(email) = email {
            customer = customer.with_email(email);
        }
        self.repo.save_customer(&customer).await?;
        info!(customer = %customer.id, "customer created");
        Ok(customer)
    }

    pub async fn get_customer(&self, id: CustomerId) -> Result<Customer, AppError> {
        self.repo
            .get_customer(id)
            .await?
            .ok_or_else(|| AppError::CustomerNotFound(id.to_string()))
    }

    pub async fn list_customers(&self) -> Result<Vec<Customer>, AppError> {
        Ok(self.repo.list_customers().await?)
    }

    pub async fn set_kyc_status(
        &self,
        id: CustomerId,
        status: KycStatus,
    ) -> Result<Customer, AppError> {
        let mut customer = self.get_customer(id).await?;
        self.repo.update_kyc_status(id, status).await?;
        customer.kyc_status = status;
        info!(customer = %id, kyc = %status, "KYC status updated");
        Ok(customer)
    }

    // ========================
    // Account lifecycle
    // ========================

    /// Open an account for a KYC-verified customer. A non-zero opening
    /// deposit is posted in the same database transaction.
    pub async fn open_account(&self, request: NewAccount) -> Result<Account, AppError> {
        let customer = self.get_customer(request.customer_id).await?;
        if !customer.is_kyc_verified() {
            return Err(AppError::KycNotVerified(customer.id.to_string()));
        }
        let branch = self.get_branch(&request.branch_ifsc).await?;
        if request.initial_deposit < 0 {
            return Err(AppError::InvalidAmount(
                "Initial deposit cannot be negative".to_string(),
            ));
        }
        if matches!(request.minimum_balance, Some(m) if m < 0) {
            return Err(AppError::InvalidAmount(
                "Minimum balance cannot be negative".to_string(),
            ));
        }

        let mut account = Account::new(customer.id, branch.id, request.account_type);
        if let Some(minimum) = request.minimum_balance {
            account = account.with_minimum_balance(minimum);
        }

        let mut tx = self.repo.begin().await?;
        Repository::insert_account(&mut tx, &account).await?;
        if request.initial_deposit > 0 {
            let txn = Self::post_deposit(
                &mut tx,
                &account.account_number,
                request.initial_deposit,
                Some("Initial deposit".to_string()),
            )
            .await?;
            account.balance = txn.balance_after.unwrap_or(request.initial_deposit);
        }
        tx.commit().await.context("Failed to commit account opening")?;

        info!(
            account = %account.account_number,
            account_type = %account.account_type,
            "account opened"
        );
        Ok(account)
    }

    pub async fn get_account(&self, account_number: &str) -> Result<Account, AppError> {
        self.repo
            .get_account(account_number)
            .await?
            .ok_or_else(|| AppError::AccountNotFound(account_number.to_string()))
    }

    pub async fn list_accounts(
        &self,
        customer_id: Option<CustomerId>,
    ) -> Result<Vec<Account>, AppError> {
        Ok(self.repo.list_accounts(customer_id).await?)
    }

    /// The account and its transactions, newest first.
    pub async fn statement(
        &self,
        account_number: &str,
        limit: Option<usize>,
    ) -> Result<Statement, AppError> {
        let account = self.get_account(account_number).await?;
        let transactions = self
            .repo
            .list_transactions_for_account(account_number, limit)
            .await?;
        Ok(Statement {
            account,
            transactions,
        })
    }

    /// Freeze, unfreeze or mark dormant. Closing goes through `close_account`.
    pub async fn set_account_status(
        &self,
        account_number: &str,
        status: AccountStatus,
    ) -> Result<Account, AppError> {
        if status == AccountStatus::Closed {
            return self.close_account(account_number).await;
        }

        let mut account = self.get_account(account_number).await?;
        if account.status == AccountStatus::Closed {
            return Err(AppError::InvalidState(format!(
                "Account {} is closed",
                account_number
            )));
        }

        self.repo.update_account_status(account_number, status).await?;
        info!(account = %account_number, from = %account.status, to = %status, "account status changed");
        account.status = status;
        Ok(account)
    }

    pub async fn close_account(&self, account_number: &str) -> Result<Account, AppError> {
        let mut account = self.get_account(account_number).await?;
        if account.status == AccountStatus::Closed {
            return Err(AppError::InvalidState(format!(
                "Account {} is already closed",
                account_number
            )));
        }
        if account.balance != 0 {
            return Err(AppError::BalanceNotZero {
                account_number: account_number.to_string(),
                balance: account.balance,
            });
        }

        if !self.repo.close_account(account_number).await? {
            return Err(AppError::LedgerInconsistency(format!(
                "balance of account {} changed while closing",
                account_number
            )));
        }
        info!(account = %account_number, "account closed");
        account.status = AccountStatus::Closed;
        Ok(account)
    }

    pub async fn link_upi(&self, account_number: &str, upi_id: &str) -> Result<Account, AppError> {
        if !is_valid_upi_id(upi_id) {
            return Err(AppError::InvalidInput(format!("Invalid UPI id: {}", upi_id)));
        }
        let mut account = self.get_account(account_number).await?;
        Self::ensure_active(&account)?;
        if let Some(holder) = self.repo.get_account_by_upi(upi_id).await? {
            if holder.account_number != account.account_number {
                return Err(AppError::AlreadyExists(format!("UPI id {}", upi_id)));
            }
        }

        self.repo.set_upi_id(account_number, upi_id).await?;
        account.upi_id = Some(upi_id.to_lowercase());
        info!(account = %account_number, "UPI id linked");
        Ok(account)
    }

    // ========================
    // Postings
    // ========================

    pub async fn deposit(
        &self,
        account_number: &str,
        amount: Cents,
        description: Option<String>,
    ) -> Result<Transaction, AppError> {
        ensure_positive(amount)?;
        let mut tx = self.repo.begin().await?;
        let txn = Self::post_deposit(&mut tx, account_number, amount, description).await?;
        tx.commit().await.context("Failed to commit deposit")?;

        info!(account = %account_number, amount, "deposit posted");
        Ok(txn)
    }

    pub async fn withdraw(
        &self,
        account_number: &str,
        amount: Cents,
        description: Option<String>,
    ) -> Result<Transaction, AppError> {
        ensure_positive(amount)?;
        let mut tx = self.repo.begin().await?;
        let txn = Self::post_withdrawal(&mut tx, account_number, amount, description)
            .await
            .inspect_err(|e| warn!(account = %account_number, amount, "withdrawal rejected: {e}"))?;
        tx.commit().await.context("Failed to commit withdrawal")?;

        info!(account = %account_number, amount, "withdrawal posted");
        Ok(txn)
    }

    /// Fees owed for moving `amount` over `rail`, at the configured GST rate.
    pub fn quote_transfer(&self, rail: TransferRail, amount: Cents) -> Result<FeeQuote, AppError> {
        ensure_positive(amount)?;
        FeeQuote::with_gst_rate(rail, amount, self.policy.gst_rate_bps).ok_or_else(|| {
            AppError::InvalidAmount(format!(
                "Transfer of {} plus charges exceeds the largest representable amount",
                format_cents(amount)
            ))
        })
    }

    /// Move `amount` between two accounts. The sender is debited the amount
    /// plus charges and GST; the receiver is credited the amount.
    pub async fn transfer(
        &self,
        from_account: &str,
        to_account: &str,
        amount: Cents,
        rail: TransferRail,
        description: Option<String>,
    ) -> Result<TransferResult, AppError> {
        let quote = self.quote_transfer(rail, amount)?;
        rail.check_bounds(amount).map_err(|limit| rail_limit_error(rail, limit))?;
        if from_account == to_account {
            return Err(AppError::InvalidInput(
                "Cannot transfer to the same account".to_string(),
            ));
        }

        let mut tx = self.repo.begin().await?;
        let result = Self::post_transfer(&mut tx, from_account, to_account, &quote, description)
            .await
            .inspect_err(|e| warn!(from = %from_account, to = %to_account, amount, "transfer rejected: {e}"))?;
        tx.commit().await.context("Failed to commit transfer")?;

        info!(
            from = %from_account,
            to = %to_account,
            rail = %rail,
            amount,
            fees = quote.fee_total,
            "transfer posted"
        );
        Ok(result)
    }

    /// Transfer over UPI to whichever account holds `to_upi_id`.
    pub async fn upi_transfer(
        &self,
        from_account: &str,
        to_upi_id: &str,
        amount: Cents,
        description: Option<String>,
    ) -> Result<TransferResult, AppError> {
        let payee = self
            .repo
            .get_account_by_upi(to_upi_id)
            .await?
            .ok_or_else(|| AppError::AccountNotFound(to_upi_id.to_string()))?;
        self.transfer(
            from_account,
            &payee.account_number,
            amount,
            TransferRail::Upi,
            description,
        )
        .await
    }

    /// Undo a successful transaction with a compensating `reversal` record.
    /// The original debited account gets back the full `total_debit` and the
    /// credited account gives back `amount`.
    pub async fn reverse_transaction(
        &self,
        id: TransactionId,
        reason: Option<String>,
    ) -> Result<ReversalResult, AppError> {
        let mut tx = self.repo.begin().await?;
        let original = Repository::fetch_transaction(&mut tx, id)
            .await?
            .ok_or_else(|| AppError::TransactionNotFound(id.to_string()))?;

        if original.is_reversal() {
            return Err(AppError::NotReversible(id));
        }
        match original.status {
            TransactionStatus::Success => {}
            TransactionStatus::Reversed => return Err(AppError::AlreadyReversed(id)),
            other => {
                return Err(AppError::InvalidState(format!(
                    "Transaction {} is {} and cannot be reversed",
                    id, other
                )));
            }
        }

        let mut reversal = original.create_reversal(reason.as_deref());
        let mut debited_balance = None;
        let mut credited_balance = None;

        // Claw back from the party that was credited.
        if let Some(snapshot) = &original.to_account {
            let account = Self::load_account(&mut tx, &snapshot.account_number).await?;
            Self::ensure_not_closed(&account)?;
            if account.balance < original.amount {
                return Err(AppError::InsufficientFunds {
                    account_number: account.account_number,
                    balance: account.balance,
                    required: original.amount,
                });
            }
            debited_balance = Some(Self::move_balance(&mut tx, &account, -original.amount).await?);
        }

        // Refund the party that was debited, fees included.
        if let Some(snapshot) = &original.from_account {
            let account = Self::load_account(&mut tx, &snapshot.account_number).await?;
            Self::ensure_not_closed(&account)?;
            credited_balance =
                Some(Self::move_balance(&mut tx, &account, original.total_debit).await?);
        }

        if !Repository::swap_transaction_status(
            &mut tx,
            id,
            TransactionStatus::Success,
            TransactionStatus::Reversed,
        )
        .await?
        {
            return Err(AppError::AlreadyReversed(id));
        }

        reversal.balance_after = debited_balance.or(credited_balance);
        Repository::insert_transaction(&mut tx, &mut reversal).await?;
        tx.commit().await.context("Failed to commit reversal")?;

        info!(original = %id, reversal = %reversal.id, "transaction reversed");

        let mut original = original;
        original.status = TransactionStatus::Reversed;
        Ok(ReversalResult { reversal, original })
    }

    pub async fn get_transaction(&self, id: TransactionId) -> Result<Transaction, AppError> {
        self.repo
            .get_transaction(id)
            .await?
            .ok_or_else(|| AppError::TransactionNotFound(id.to_string()))
    }

    /// Every transaction in posting order.
    pub async fn list_transactions(&self) -> Result<Vec<Transaction>, AppError> {
        Ok(self.repo.list_transactions().await?)
    }

    /// The reversal that compensates `id`, if any.
    pub async fn get_reversal_of(&self, id: TransactionId) -> Result<Option<Transaction>, AppError> {
        Ok(self.repo.get_reversal_of(id).await?)
    }

    /// Replay every transaction and compare with stored balances.
    pub async fn check_integrity(&self) -> Result<IntegrityReport, AppError> {
        let accounts = self.repo.list_accounts(None).await?;
        let transactions = self.repo.list_transactions().await?;
        let report = build_integrity_report(&accounts, &transactions);

        if report.is_ok() {
            debug!(
                accounts = report.account_count,
                transactions = report.transaction_count,
                "ledger integrity verified"
            );
        } else {
            for issue in &report.issues {
                warn!("integrity issue: {issue}");
            }
        }
        Ok(report)
    }

    // ========================
    // In-transaction postings
    // ========================

    /// Credit `amount` to an active account and record the deposit.
    pub(crate) async fn post_deposit(
        conn: &mut SqliteConnection,
        account_number: &str,
        amount: Cents,
        description: Option<String>,
    ) -> Result<Transaction, AppError> {
        let account = Self::load_account(conn, account_number).await?;
        Self::ensure_active(&account)?;

        let balance = Self::move_balance(conn, &account, amount).await?;
        let snapshot = Repository::fetch_snapshot(conn, &account).await?;
        let mut txn = Transaction::deposit(snapshot, amount).with_balance_after(balance);
        txn.description = description;
        Repository::insert_transaction(conn, &mut txn).await?;
        Ok(txn)
    }

    /// Debit `amount` from an active account, enforcing funds, the savings
    /// minimum balance and the daily limit.
    pub(crate) async fn post_withdrawal(
        conn: &mut SqliteConnection,
        account_number: &str,
        amount: Cents,
        description: Option<String>,
    ) -> Result<Transaction, AppError> {
        let account = Self::load_account(conn, account_number).await?;
        Self::ensure_active(&account)?;
        if account.balance < amount {
            return Err(AppError::InsufficientFunds {
                account_number: account.account_number,
                balance: account.balance,
                required: amount,
            });
        }
        if account.violates_minimum_balance(amount) {
            return Err(AppError::MinimumBalanceViolation {
                account_number: account.account_number,
                minimum_balance: account.minimum_balance,
            });
        }
        if account.exceeds_daily_limit(amount) {
            return Err(AppError::LimitExceeded {
                amount,
                limit: account.daily_limit,
            });
        }

        let balance = Self::move_balance(conn, &account, -amount).await?;
        let snapshot = Repository::fetch_snapshot(conn, &account).await?;
        let mut txn = Transaction::withdrawal(snapshot, amount).with_balance_after(balance);
        txn.description = description;
        Repository::insert_transaction(conn, &mut txn).await?;
        Ok(txn)
    }

    async fn post_transfer(
        conn: &mut SqliteConnection,
        from_account: &str,
        to_account: &str,
        quote: &FeeQuote,
        description: Option<String>,
    ) -> Result<TransferResult, AppError> {
        let from = Self::load_account(conn, from_account).await?;
        let to = Self::load_account(conn, to_account).await?;
        Self::ensure_active(&from)?;
        Self::ensure_active(&to)?;
        if from.balance < quote.total_debit {
            return Err(AppError::InsufficientFunds {
                account_number: from.account_number,
                balance: from.balance,
                required: quote.total_debit,
            });
        }

        let from_balance = Self::move_balance(conn, &from, -quote.total_debit).await?;
        let to_balance = Self::move_balance(conn, &to, quote.amount).await?;

        let from_snapshot = Repository::fetch_snapshot(conn, &from).await?;
        let to_snapshot = Repository::fetch_snapshot(conn, &to).await?;
        let mut txn = Transaction::transfer(from_snapshot, to_snapshot, quote)
            .with_balance_after(from_balance);
        txn.description = description;
        Repository::insert_transaction(conn, &mut txn).await?;

        Ok(TransferResult {
            transaction: txn,
            from_balance,
            to_balance,
        })
    }

    async fn load_account(
        conn: &mut SqliteConnection,
        account_number: &str,
    ) -> Result<Account, AppError> {
        Repository::fetch_account(conn, account_number)
            .await?
            .ok_or_else(|| AppError::AccountNotFound(account_number.to_string()))
    }

    /// Apply `delta` to the balance read into `account`. Fails the whole
    /// posting if the stored balance moved since it was read.
    async fn move_balance(
        conn: &mut SqliteConnection,
        account: &Account,
        delta: Cents,
    ) -> Result<Cents, AppError> {
        let new_balance = account.balance.checked_add(delta).ok_or_else(|| {
            AppError::InvalidAmount(format!(
                "Posting of {} would overflow the balance of account {}",
                format_cents(delta),
                account.account_number
            ))
        })?;
        if new_balance < 0 {
            return Err(AppError::LedgerInconsistency(format!(
                "posting would leave account {} negative",
                account.account_number
            )));
        }
        if !Repository::swap_balance(conn, &account.account_number, account.balance, new_balance)
            .await?
        {
            return Err(AppError::LedgerInconsistency(format!(
                "balance of account {} changed during posting",
                account.account_number
            )));
        }
        Ok(new_balance)
    }

    fn ensure_active(account: &Account) -> Result<(), AppError> {
        if account.is_active() {
            Ok(())
        } else {
            Err(AppError::InvalidState(format!(
                "Account {} is {}",
                account.account_number, account.status
            )))
        }
    }

    fn ensure_not_closed(account: &Account) -> Result<(), AppError> {
        if account.status == AccountStatus::Closed {
            Err(AppError::InvalidState(format!(
                "Account {} is closed",
                account.account_number
            )))
        } else {
            Ok(())
        }
    }
}

fn ensure_positive(amount: Cents) -> Result<(), AppError> {
    if amount <= 0 {
        return Err(AppError::InvalidAmount("Amount must be positive".to_string()));
    }
    Ok(())
}

fn rail_limit_error(rail: TransferRail, limit: RailLimit) -> AppError {
    let rail = rail.as_str().to_uppercase();
    AppError::LimitViolation(match limit {
        RailLimit::BelowMinimum { minimum } => {
            format!("{} transfers require at least {}", rail, format_cents(minimum))
        }
        RailLimit::AboveMaximum { maximum } => {
            format!("{} transfers are limited to {}", rail, format_cents(maximum))
        }
    })
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::application::Bank;
    use crate::domain::rupees;

    async fn bank_with_account(temp: &TempDir) -> anyhow::Result<(Bank, Account)> {
        let path = temp.path().join("ledger.db");
        let bank = Bank::init(&path.to_string_lossy(), Policy::default()).await?;
        bank.ledger.create_branch("Main Branch", "KHAT0000001").await?;
        let customer = bank.ledger.create_customer("Asha Rao", None).await?;
        bank.ledger
            .set_kyc_status(customer.id, KycStatus::Verified)
            .await?;
        let account = bank
            .ledger
            .open_account(NewAccount {
                customer_id: customer.id,
                branch_ifsc: "KHAT0000001".to_string(),
                account_type: AccountType::Current,
                initial_deposit: rupees(1_000),
                minimum_balance: None,
            })
            .await?;
        Ok((bank, account))
    }

    #[tokio::test]
    async fn test_stale_balance_aborts_posting() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let (bank, account) = bank_with_account(&temp).await?;

        let mut tx = bank.ledger.repo.begin().await?;
        let stale = LedgerService::load_account(&mut tx, &account.account_number).await?;
        // Another writer moves the balance after it was read
        assert!(
            Repository::swap_balance(
                &mut tx,
                &stale.account_number,
                stale.balance,
                stale.balance + rupees(5),
            )
            .await?
        );

        let err = LedgerService::move_balance(&mut tx, &stale, rupees(10))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::LedgerInconsistency(_)));
        assert_eq!(err.status_code(), 500);
        tx.rollback().await?;

        assert_eq!(
            bank.ledger.get_account(&account.account_number).await?.balance,
            rupees(1_000)
        );
        assert!(bank.ledger.check_integrity().await?.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_balance_overflow_is_an_invalid_amount() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let (bank, account) = bank_with_account(&temp).await?;

        let mut tx = bank.ledger.repo.begin().await?;
        let current = LedgerService::load_account(&mut tx, &account.account_number).await?;
        let err = LedgerService::move_balance(&mut tx, &current, i64::MAX)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidAmount(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_quote_overflow_is_an_invalid_amount() {
        let pool = sqlx::SqlitePool::connect_lazy("sqlite::memory:").unwrap();
        let service = LedgerService::new(Repository::new(pool), Policy::default());
        let err = service
            .quote_transfer(TransferRail::Neft, i64::MAX - 10)
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidAmount(_)));
        assert!(service.quote_transfer(TransferRail::Neft, rupees(10_000)).is_ok());
    }
}
