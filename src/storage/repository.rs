use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::domain::{
    Account, AccountSnapshot, AccountStatus, Action, Branch, Cents, Customer, CustomerId,
    JobKind, JobStatus, KycStatus, Loan, LoanStatus, Permission, PermissionId, Role, RoleId,
    ScheduledJob, Transaction, TransactionId, TransactionStatus, TransactionType, User, UserId,
};

use super::{MIGRATION_001_INITIAL, MIGRATION_002_LOANS, MIGRATION_003_RBAC};

/// An open database transaction. Every balance mutation and the records that
/// describe it are written through one of these and committed together.
pub type DbTransaction = sqlx::Transaction<'static, Sqlite>;

const ACCOUNT_COLUMNS: &str = "id, account_number, customer_id, branch_id, account_type, balance, status, minimum_balance, daily_limit, monthly_limit, upi_id, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, sequence, reference_number, transaction_type, from_account_number, from_ifsc, from_holder_name, to_account_number, to_ifsc, to_holder_name, amount, charges, gst, total_debit, status, balance_after, description, reverses, created_at";

const LOAN_COLUMNS: &str = "id, loan_number, customer_id, account_number, branch_id, loan_type, principal, sanctioned_amount, disbursed_amount, interest_rate, tenure_months, emi, status, outstanding, principal_outstanding, interest_outstanding, emis_paid, emis_remaining, start_date, end_date, first_emi_date, next_emi_date, overdue_days, overdue_amount, penalty_amount, rejection_reason, purpose, created_at, updated_at";

/// How long a writer waits for another writer's lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const JOB_COLUMNS: &str =
    "id, kind, subject, run_at, status, attempts, last_error, created_at, completed_at";

/// Repository for persisting and querying the bank's records.
///
/// Reads that must observe the same snapshot as a pending write, and all
/// writes that move money, take a `&mut SqliteConnection` so callers can run
/// them inside a [`DbTransaction`]. Everything else goes through the pool.
#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Create a new repository with the given SQLite connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a SQLite database.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .context("Invalid database URL")?
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to database")?;
        Ok(Self::new(pool))
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<()> {
        for (name, sql) in [
            ("001", MIGRATION_001_INITIAL),
            ("002", MIGRATION_002_LOANS),
            ("003", MIGRATION_003_RBAC),
        ] {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to run migration {}", name))?;
        }
        Ok(())
    }

    /// Initialize a new database (connect + migrate).
    pub async fn init(database_url: &str) -> Result<Self> {
        let repo = Self::connect(database_url).await?;
        repo.migrate().await?;
        Ok(repo)
    }

    /// Start a database transaction. Dropping it without `commit` rolls back.
    ///
    /// The write lock is taken up front, so concurrent postings queue behind
    /// each other instead of deadlocking on a read-to-write upgrade.
    pub async fn begin(&self) -> Result<DbTransaction> {
        self.pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .context("Failed to begin transaction")
    }

    // ========================
    // Branches
    // ========================

    pub async fn save_branch(&self, branch: &Branch) -> Result<()> {
        sqlx::query("INSERT INTO branches (id, name, ifsc, created_at) VALUES (?, ?, ?, ?)")
            .bind(branch.id.to_string())
            .bind(&branch.name)
            .bind(&branch.ifsc)
            .bind(branch.created_at.to_rfc3339())
            .execute(&self.pool)
            .await
            .context("Failed to save branch")?;
        Ok(())
    }

    pub async fn get_branch_by_ifsc(&self, ifsc: &str) -> Result<Option<Branch>> {
        let row = sqlx::query("SELECT id, name, ifsc, created_at FROM branches WHERE ifsc = ?")
            .bind(ifsc.to_uppercase())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch branch by IFSC")?;
        row.as_ref().map(Self::row_to_branch).transpose()
    }

    pub async fn list_branches(&self) -> Result<Vec<Branch>> {
        let rows = sqlx::query("SELECT id, name, ifsc, created_at FROM branches ORDER BY ifsc")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list branches")?;
        rows.iter().map(Self::row_to_branch).collect()
    }

    fn row_to_branch(row: &SqliteRow) -> Result<Branch> {
        Ok(Branch {
            id: parse_uuid(row.get("id"), "branch id")?,
            name: row.get("name"),
            ifsc: row.get("ifsc"),
            created_at: parse_timestamp(row.get("created_at"), "created_at")?,
        })
    }

    // ========================
    // Customers
    // ========================

    pub async fn save_customer(&self, customer: &Customer) -> Result<()> {
        sqlx::query(
            "INSERT INTO customers (id, full_name, email, kyc_status, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(customer.id.to_string())
        .bind(&customer.full_name)
        .bind(&customer.email)
        .bind(customer.kyc_status.as_str())
        .bind(customer.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to save customer")?;
        Ok(())
    }

    pub async fn get_customer(&self, id: CustomerId) -> Result<Option<Customer>> {
        let row = sqlx::query(
            "SELECT id, full_name, email, kyc_status, created_at FROM customers WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch customer")?;
        row.as_ref().map(Self::row_to_customer).transpose()
    }

    pub async fn list_customers(&self) -> Result<Vec<Customer>> {
        let rows = sqlx::query(
            "SELECT id, full_name, email, kyc_status, created_at FROM customers ORDER BY full_name",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list customers")?;
        rows.iter().map(Self::row_to_customer).collect()
    }

    pub async fn update_kyc_status(&self, id: CustomerId, status: KycStatus) -> Result<()> {
        sqlx::query("UPDATE customers SET kyc_status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to update KYC status")?;
        Ok(())
    }

    fn row_to_customer(row: &SqliteRow) -> Result<Customer> {
        let kyc: String = row.get("kyc_status");
        Ok(Customer {
            id: parse_uuid(row.get("id"), "customer id")?,
            full_name: row.get("full_name"),
            email: row.get("email"),
            kyc_status: kyc
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .context("Invalid KYC status")?,
            created_at: parse_timestamp(row.get("created_at"), "created_at")?,
        })
    }

    // ========================
    // Accounts
    // ========================

    pub async fn insert_account(conn: &mut SqliteConnection, account: &Account) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO accounts ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            ACCOUNT_COLUMNS
        ))
        .bind(account.id.to_string())
        .bind(&account.account_number)
        .bind(account.customer_id.to_string())
        .bind(account.branch_id.to_string())
        .bind(account.account_type.as_str())
        .bind(account.balance)
        .bind(account.status.as_str())
        .bind(account.minimum_balance)
        .bind(account.daily_limit)
        .bind(account.monthly_limit)
        .bind(&account.upi_id)
        .bind(account.created_at.to_rfc3339())
        .bind(account.updated_at.to_rfc3339())
        .execute(&mut *conn)
        .await
        .context("Failed to save account")?;
        Ok(())
    }

    pub async fn fetch_account(
        conn: &mut SqliteConnection,
        account_number: &str,
    ) -> Result<Option<Account>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM accounts WHERE account_number = ?",
            ACCOUNT_COLUMNS
        ))
        .bind(account_number)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to fetch account")?;
        row.as_ref().map(Self::row_to_account).transpose()
    }

    pub async fn get_account(&self, account_number: &str) -> Result<Option<Account>> {
        let mut conn = self.pool.acquire().await.context("Failed to acquire connection")?;
        Self::fetch_account(&mut conn, account_number).await
    }

    pub async fn fetch_account_by_upi(
        conn: &mut SqliteConnection,
        upi_id: &str,
    ) -> Result<Option<Account>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM accounts WHERE upi_id = ?",
            ACCOUNT_COLUMNS
        ))
        .bind(upi_id.to_lowercase())
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to fetch account by UPI id")?;
        row.as_ref().map(Self::row_to_account).transpose()
    }

    pub async fn get_account_by_upi(&self, upi_id: &str) -> Result<Option<Account>> {
        let mut conn = self.pool.acquire().await.context("Failed to acquire connection")?;
        Self::fetch_account_by_upi(&mut conn, upi_id).await
    }

    /// List accounts, optionally only those of one customer.
    pub async fn list_accounts(&self, customer_id: Option<CustomerId>) -> Result<Vec<Account>> {
        let rows = match customer_id {
            Some(id) => {
                sqlx::query(&format!(
                    "SELECT {} FROM accounts WHERE customer_id = ? ORDER BY created_at",
                    ACCOUNT_COLUMNS
                ))
                .bind(id.to_string())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM accounts ORDER BY created_at",
                    ACCOUNT_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("Failed to list accounts")?;
        rows.iter().map(Self::row_to_account).collect()
    }

    /// Compare-and-swap the balance: only succeeds if the stored balance is
    /// still `expected`. Returns false when another writer got there first.
    pub async fn swap_balance(
        conn: &mut SqliteConnection,
        account_number: &str,
        expected: Cents,
        new_balance: Cents,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE accounts SET balance = ?, updated_at = ? WHERE account_number = ? AND balance = ?",
        )
        .bind(new_balance)
        .bind(Utc::now().to_rfc3339())
        .bind(account_number)
        .bind(expected)
        .execute(&mut *conn)
        .await
        .context("Failed to update balance")?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn update_account_status(
        &self,
        account_number: &str,
        status: AccountStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE accounts SET status = ?, updated_at = ? WHERE account_number = ?")
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(account_number)
            .execute(&self.pool)
            .await
            .context("Failed to update account status")?;
        Ok(())
    }

    /// Close only if the balance is still exactly zero.
    pub async fn close_account(&self, account_number: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE accounts SET status = 'closed', updated_at = ? WHERE account_number = ? AND balance = 0",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(account_number)
        .execute(&self.pool)
        .await
        .context("Failed to close account")?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_upi_id(&self, account_number: &str, upi_id: &str) -> Result<()> {
        sqlx::query("UPDATE accounts SET upi_id = ?, updated_at = ? WHERE account_number = ?")
            .bind(upi_id.to_lowercase())
            .bind(Utc::now().to_rfc3339())
            .bind(account_number)
            .execute(&self.pool)
            .await
            .context("Failed to link UPI id")?;
        Ok(())
    }

    /// Account number, IFSC and holder name as recorded on a transaction.
    pub async fn fetch_snapshot(
        conn: &mut SqliteConnection,
        account: &Account,
    ) -> Result<AccountSnapshot> {
        let row = sqlx::query(
            r#"
            SELECT b.ifsc AS ifsc, c.full_name AS holder_name
            FROM accounts a
            JOIN branches b ON b.id = a.branch_id
            JOIN customers c ON c.id = a.customer_id
            WHERE a.account_number = ?
            "#,
        )
        .bind(&account.account_number)
        .fetch_one(&mut *conn)
        .await
        .context("Failed to load account holder details")?;

        Ok(AccountSnapshot {
            account_number: account.account_number.clone(),
            ifsc: row.get("ifsc"),
            holder_name: row.get("holder_name"),
        })
    }

    fn row_to_account(row: &SqliteRow) -> Result<Account> {
        let account_type: String = row.get("account_type");
        let status: String = row.get("status");
        Ok(Account {
            id: parse_uuid(row.get("id"), "account id")?,
            account_number: row.get("account_number"),
            customer_id: parse_uuid(row.get("customer_id"), "customer id")?,
            branch_id: parse_uuid(row.get("branch_id"), "branch id")?,
            account_type: account_type
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?,
            balance: row.get("balance"),
            status: status.parse().map_err(|e: String| anyhow::anyhow!(e))?,
            minimum_balance: row.get("minimum_balance"),
            daily_limit: row.get("daily_limit"),
            monthly_limit: row.get("monthly_limit"),
            upi_id: row.get("upi_id"),
            created_at: parse_timestamp(row.get("created_at"), "created_at")?,
            updated_at: parse_timestamp(row.get("updated_at"), "updated_at")?,
        })
    }

    // ========================
    // Transactions
    // ========================

    /// Insert a transaction, assigning the next sequence number.
    pub async fn insert_transaction(
        conn: &mut SqliteConnection,
        txn: &mut Transaction,
    ) -> Result<()> {
        txn.sequence = Self::next_sequence(conn).await?;

        let (from_number, from_ifsc, from_holder) = split_snapshot(txn.from_account.as_ref());
        let (to_number, to_ifsc, to_holder) = split_snapshot(txn.to_account.as_ref());

        sqlx::query(&format!(
            "INSERT INTO transactions ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            TRANSACTION_COLUMNS
        ))
        .bind(txn.id.to_string())
        .bind(txn.sequence)
        .bind(&txn.reference_number)
        .bind(txn.transaction_type.as_str())
        .bind(from_number)
        .bind(from_ifsc)
        .bind(from_holder)
        .bind(to_number)
        .bind(to_ifsc)
        .bind(to_holder)
        .bind(txn.amount)
        .bind(txn.charges)
        .bind(txn.gst)
        .bind(txn.total_debit)
        .bind(txn.status.as_str())
        .bind(txn.balance_after)
        .bind(&txn.description)
        .bind(txn.reverses.map(|id| id.to_string()))
        .bind(txn.created_at.to_rfc3339())
        .execute(&mut *conn)
        .await
        .context("Failed to save transaction")?;

        Ok(())
    }

    async fn next_sequence(conn: &mut SqliteConnection) -> Result<i64> {
        let row = sqlx::query(
            r#"
            UPDATE sequence_counter
            SET value = value + 1
            WHERE name = 'transaction_sequence'
            RETURNING value
            "#,
        )
        .fetch_one(&mut *conn)
        .await
        .context("Failed to get next sequence number")?;

        Ok(row.get("value"))
    }

    pub async fn fetch_transaction(
        conn: &mut SqliteConnection,
        id: TransactionId,
    ) -> Result<Option<Transaction>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM transactions WHERE id = ?",
            TRANSACTION_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to fetch transaction")?;
        row.as_ref().map(Self::row_to_transaction).transpose()
    }

    pub async fn get_transaction(&self, id: TransactionId) -> Result<Option<Transaction>> {
        let mut conn = self.pool.acquire().await.context("Failed to acquire connection")?;
        Self::fetch_transaction(&mut conn, id).await
    }

    /// Move a transaction from `expected` to `status`. Returns false if the
    /// stored status was not `expected`.
    pub async fn swap_transaction_status(
        conn: &mut SqliteConnection,
        id: TransactionId,
        expected: TransactionStatus,
        status: TransactionStatus,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE transactions SET status = ? WHERE id = ? AND status = ?")
            .bind(status.as_str())
            .bind(id.to_string())
            .bind(expected.as_str())
            .execute(&mut *conn)
            .await
            .context("Failed to update transaction status")?;
        Ok(result.rows_affected() == 1)
    }

    /// All transactions, ordered by sequence number.
    pub async fn list_transactions(&self) -> Result<Vec<Transaction>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM transactions ORDER BY sequence",
            TRANSACTION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list transactions")?;
        rows.iter().map(Self::row_to_transaction).collect()
    }

    /// Transactions touching an account, newest first.
    pub async fn list_transactions_for_account(
        &self,
        account_number: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Transaction>> {
        let mut query = format!(
            "SELECT {} FROM transactions WHERE from_account_number = ? OR to_account_number = ? ORDER BY sequence DESC",
            TRANSACTION_COLUMNS
        );
        if let Some(limit) = limit {
            query.push_str(&format!(" LIMIT {}", limit));
        }

        let rows = sqlx::query(&query)
            .bind(account_number)
            .bind(account_number)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list transactions for account")?;
        rows.iter().map(Self::row_to_transaction).collect()
    }

    /// The compensating transaction for `id`, if it has been reversed.
    pub async fn get_reversal_of(&self, id: TransactionId) -> Result<Option<Transaction>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM transactions WHERE reverses = ?",
            TRANSACTION_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch reversal")?;
        row.as_ref().map(Self::row_to_transaction).transpose()
    }

    fn row_to_transaction(row: &SqliteRow) -> Result<Transaction> {
        let txn_type: String = row.get("transaction_type");
        let status: String = row.get("status");
        let reverses: Option<String> = row.get("reverses");

        Ok(Transaction {
            id: parse_uuid(row.get("id"), "transaction id")?,
            sequence: row.get("sequence"),
            reference_number: row.get("reference_number"),
            transaction_type: TransactionType::from_str(&txn_type)
                .ok_or_else(|| anyhow::anyhow!("Invalid transaction type: {}", txn_type))?,
            from_account: join_snapshot(
                row.get("from_account_number"),
                row.get("from_ifsc"),
                row.get("from_holder_name"),
            ),
            to_account: join_snapshot(
                row.get("to_account_number"),
                row.get("to_ifsc"),
                row.get("to_holder_name"),
            ),
            amount: row.get("amount"),
            charges: row.get("charges"),
            gst: row.get("gst"),
            total_debit: row.get("total_debit"),
            status: TransactionStatus::from_str(&status)
                .ok_or_else(|| anyhow::anyhow!("Invalid transaction status: {}", status))?,
            balance_after: row.get("balance_after"),
            description: row.get("description"),
            reverses: reverses
                .map(|s| Uuid::parse_str(&s))
                .transpose()
                .context("Invalid reverses ID")?,
            created_at: parse_timestamp(row.get("created_at"), "created_at")?,
        })
    }

    // ========================
    // Loans
    // ========================

    pub async fn save_loan(&self, loan: &Loan) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO loans ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            LOAN_COLUMNS
        ))
        .bind(loan.id.to_string())
        .bind(&loan.loan_number)
        .bind(loan.customer_id.to_string())
        .bind(&loan.account_number)
        .bind(loan.branch_id.to_string())
        .bind(loan.loan_type.as_str())
        .bind(loan.principal)
        .bind(loan.sanctioned_amount)
        .bind(loan.disbursed_amount)
        .bind(loan.interest_rate)
        .bind(loan.tenure_months as i64)
        .bind(loan.emi)
        .bind(loan.status.as_str())
        .bind(loan.outstanding)
        .bind(loan.principal_outstanding)
        .bind(loan.interest_outstanding)
        .bind(loan.emis_paid as i64)
        .bind(loan.emis_remaining as i64)
        .bind(loan.start_date.map(|d| d.to_rfc3339()))
        .bind(loan.end_date.map(|d| d.to_rfc3339()))
        .bind(loan.first_emi_date.map(|d| d.to_rfc3339()))
        .bind(loan.next_emi_date.map(|d| d.to_rfc3339()))
        .bind(loan.overdue_days)
        .bind(loan.overdue_amount)
        .bind(loan.penalty_amount)
        .bind(&loan.rejection_reason)
        .bind(&loan.purpose)
        .bind(loan.created_at.to_rfc3339())
        .bind(loan.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to save loan")?;
        Ok(())
    }

    /// Write back every mutable loan field, guarded on the status the caller
    /// read. Returns false if the loan moved on in the meantime.
    pub async fn update_loan(
        conn: &mut SqliteConnection,
        loan: &Loan,
        expected_status: LoanStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE loans SET
                sanctioned_amount = ?, disbursed_amount = ?, emi = ?, status = ?,
                outstanding = ?, principal_outstanding = ?, interest_outstanding = ?,
                emis_paid = ?, emis_remaining = ?,
                start_date = ?, end_date = ?, first_emi_date = ?, next_emi_date = ?,
                overdue_days = ?, overdue_amount = ?, penalty_amount = ?,
                rejection_reason = ?, updated_at = ?
            WHERE loan_number = ? AND status = ?
            "#,
        )
        .bind(loan.sanctioned_amount)
        .bind(loan.disbursed_amount)
        .bind(loan.emi)
        .bind(loan.status.as_str())
        .bind(loan.outstanding)
        .bind(loan.principal_outstanding)
        .bind(loan.interest_outstanding)
        .bind(loan.emis_paid as i64)
        .bind(loan.emis_remaining as i64)
        .bind(loan.start_date.map(|d| d.to_rfc3339()))
        .bind(loan.end_date.map(|d| d.to_rfc3339()))
        .bind(loan.first_emi_date.map(|d| d.to_rfc3339()))
        .bind(loan.next_emi_date.map(|d| d.to_rfc3339()))
        .bind(loan.overdue_days)
        .bind(loan.overdue_amount)
        .bind(loan.penalty_amount)
        .bind(&loan.rejection_reason)
        .bind(loan.updated_at.to_rfc3339())
        .bind(&loan.loan_number)
        .bind(expected_status.as_str())
        .execute(&mut *conn)
        .await
        .context("Failed to update loan")?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn fetch_loan(conn: &mut SqliteConnection, loan_number: &str) -> Result<Option<Loan>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM loans WHERE loan_number = ?",
            LOAN_COLUMNS
        ))
        .bind(loan_number)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to fetch loan")?;
        row.as_ref().map(Self::row_to_loan).transpose()
    }

    pub async fn get_loan(&self, loan_number: &str) -> Result<Option<Loan>> {
        let mut conn = self.pool.acquire().await.context("Failed to acquire connection")?;
        Self::fetch_loan(&mut conn, loan_number).await
    }

    pub async fn list_loans(&self, status: Option<LoanStatus>) -> Result<Vec<Loan>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {} FROM loans WHERE status = ? ORDER BY created_at",
                    LOAN_COLUMNS
                ))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!("SELECT {} FROM loans ORDER BY created_at", LOAN_COLUMNS))
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .context("Failed to list loans")?;
        rows.iter().map(Self::row_to_loan).collect()
    }

    fn row_to_loan(row: &SqliteRow) -> Result<Loan> {
        let loan_type: String = row.get("loan_type");
        let status: String = row.get("status");
        let tenure: i64 = row.get("tenure_months");
        let emis_paid: i64 = row.get("emis_paid");
        let emis_remaining: i64 = row.get("emis_remaining");

        Ok(Loan {
            id: parse_uuid(row.get("id"), "loan id")?,
            loan_number: row.get("loan_number"),
            customer_id: parse_uuid(row.get("customer_id"), "customer id")?,
            account_number: row.get("account_number"),
            branch_id: parse_uuid(row.get("branch_id"), "branch id")?,
            loan_type: loan_type.parse().map_err(|e: String| anyhow::anyhow!(e))?,
            principal: row.get("principal"),
            sanctioned_amount: row.get("sanctioned_amount"),
            disbursed_amount: row.get("disbursed_amount"),
            interest_rate: row.get("interest_rate"),
            tenure_months: u32::try_from(tenure).context("Invalid tenure")?,
            emi: row.get("emi"),
            status: status.parse().map_err(|e: String| anyhow::anyhow!(e))?,
            outstanding: row.get("outstanding"),
            principal_outstanding: row.get("principal_outstanding"),
            interest_outstanding: row.get("interest_outstanding"),
            emis_paid: u32::try_from(emis_paid).context("Invalid emis_paid")?,
            emis_remaining: u32::try_from(emis_remaining).context("Invalid emis_remaining")?,
            start_date: parse_optional_timestamp(row.get("start_date"), "start_date")?,
            end_date: parse_optional_timestamp(row.get("end_date"), "end_date")?,
            first_emi_date: parse_optional_timestamp(row.get("first_emi_date"), "first_emi_date")?,
            next_emi_date: parse_optional_timestamp(row.get("next_emi_date"), "next_emi_date")?,
            overdue_days: row.get("overdue_days"),
            overdue_amount: row.get("overdue_amount"),
            penalty_amount: row.get("penalty_amount"),
            rejection_reason: row.get("rejection_reason"),
            purpose: row.get("purpose"),
            created_at: parse_timestamp(row.get("created_at"), "created_at")?,
            updated_at: parse_timestamp(row.get("updated_at"), "updated_at")?,
        })
    }

    // ========================
    // Scheduled jobs
    // ========================

    pub async fn insert_job(conn: &mut SqliteConnection, job: &ScheduledJob) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO scheduled_jobs ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            JOB_COLUMNS
        ))
        .bind(job.id.to_string())
        .bind(job.kind.as_str())
        .bind(&job.subject)
        .bind(job.run_at.to_rfc3339())
        .bind(job.status.as_str())
        .bind(job.attempts)
        .bind(&job.last_error)
        .bind(job.created_at.to_rfc3339())
        .bind(job.completed_at.map(|d| d.to_rfc3339()))
        .execute(&mut *conn)
        .await
        .context("Failed to enqueue job")?;
        Ok(())
    }

    pub async fn update_job(conn: &mut SqliteConnection, job: &ScheduledJob) -> Result<()> {
        sqlx::query(
            "UPDATE scheduled_jobs SET status = ?, attempts = ?, last_error = ?, completed_at = ? WHERE id = ?",
        )
        .bind(job.status.as_str())
        .bind(job.attempts)
        .bind(&job.last_error)
        .bind(job.completed_at.map(|d| d.to_rfc3339()))
        .bind(job.id.to_string())
        .execute(&mut *conn)
        .await
        .context("Failed to update job")?;
        Ok(())
    }

    /// Pending jobs whose `run_at` is at or before `now`, oldest first.
    pub async fn list_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM scheduled_jobs WHERE status = 'pending' AND run_at <= ? ORDER BY run_at",
            JOB_COLUMNS
        ))
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list due jobs")?;
        rows.iter().map(Self::row_to_job).collect()
    }

    pub async fn list_jobs(&self, subject: Option<&str>) -> Result<Vec<ScheduledJob>> {
        let rows = match subject {
            Some(subject) => {
                sqlx::query(&format!(
                    "SELECT {} FROM scheduled_jobs WHERE subject = ? ORDER BY run_at",
                    JOB_COLUMNS
                ))
                .bind(subject)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM scheduled_jobs ORDER BY run_at",
                    JOB_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("Failed to list jobs")?;
        rows.iter().map(Self::row_to_job).collect()
    }

    fn row_to_job(row: &SqliteRow) -> Result<ScheduledJob> {
        let kind: String = row.get("kind");
        let status: String = row.get("status");
        Ok(ScheduledJob {
            id: parse_uuid(row.get("id"), "job id")?,
            kind: JobKind::from_str(&kind)
                .ok_or_else(|| anyhow::anyhow!("Invalid job kind: {}", kind))?,
            subject: row.get("subject"),
            run_at: parse_timestamp(row.get("run_at"), "run_at")?,
            status: JobStatus::from_str(&status)
                .ok_or_else(|| anyhow::anyhow!("Invalid job status: {}", status))?,
            attempts: row.get("attempts"),
            last_error: row.get("last_error"),
            created_at: parse_timestamp(row.get("created_at"), "created_at")?,
            completed_at: parse_optional_timestamp(row.get("completed_at"), "completed_at")?,
        })
    }

    // ========================
    // Permissions, roles, users
    // ========================

    pub async fn save_permission(&self, permission: &Permission) -> Result<()> {
        sqlx::query("INSERT INTO permissions (id, resource, action, description) VALUES (?, ?, ?, ?)")
            .bind(permission.id.to_string())
            .bind(&permission.resource)
            .bind(permission.action.as_str())
            .bind(&permission.description)
            .execute(&self.pool)
            .await
            .context("Failed to save permission")?;
        Ok(())
    }

    pub async fn get_permission(&self, id: PermissionId) -> Result<Option<Permission>> {
        let row = sqlx::query("SELECT id, resource, action, description FROM permissions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch permission")?;
        row.as_ref().map(Self::row_to_permission).transpose()
    }

    pub async fn find_permission(&self, resource: &str, action: Action) -> Result<Option<Permission>> {
        let row = sqlx::query(
            "SELECT id, resource, action, description FROM permissions WHERE resource = ? AND action = ?",
        )
        .bind(resource.to_lowercase())
        .bind(action.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch permission")?;
        row.as_ref().map(Self::row_to_permission).transpose()
    }

    pub async fn list_permissions(&self) -> Result<Vec<Permission>> {
        let rows = sqlx::query(
            "SELECT id, resource, action, description FROM permissions ORDER BY resource, action",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list permissions")?;
        rows.iter().map(Self::row_to_permission).collect()
    }

    /// Permissions granted to a role.
    pub async fn permissions_for_role(&self, role_id: RoleId) -> Result<Vec<Permission>> {
        let rows = sqlx::query(
            r#"
            SELECT p.id AS id, p.resource AS resource, p.action AS action, p.description AS description
            FROM permissions p
            JOIN role_permissions rp ON rp.permission_id = p.id
            WHERE rp.role_id = ?
            ORDER BY p.resource, p.action
            "#,
        )
        .bind(role_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to load role permissions")?;
        rows.iter().map(Self::row_to_permission).collect()
    }

    fn row_to_permission(row: &SqliteRow) -> Result<Permission> {
        let action: String = row.get("action");
        Ok(Permission {
            id: parse_uuid(row.get("id"), "permission id")?,
            resource: row.get("resource"),
            action: action.parse().map_err(|e: String| anyhow::anyhow!(e))?,
            description: row.get("description"),
        })
    }

    /// Save a role and its permission set.
    pub async fn save_role(&self, role: &Role) -> Result<()> {
        let mut tx = self.begin().await?;
        sqlx::query(
            "INSERT INTO roles (id, name, display_name, priority, is_system, is_active, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(role.id.to_string())
        .bind(&role.name)
        .bind(&role.display_name)
        .bind(role.priority)
        .bind(role.is_system)
        .bind(role.is_active)
        .bind(role.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .context("Failed to save role")?;

        for permission_id in &role.permissions {
            Self::link_permission(&mut tx, role.id, *permission_id).await?;
        }
        tx.commit().await.context("Failed to commit role")?;
        Ok(())
    }

    async fn link_permission(
        conn: &mut SqliteConnection,
        role_id: RoleId,
        permission_id: PermissionId,
    ) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO role_permissions (role_id, permission_id) VALUES (?, ?)")
            .bind(role_id.to_string())
            .bind(permission_id.to_string())
            .execute(&mut *conn)
            .await
            .context("Failed to grant permission")?;
        Ok(())
    }

    pub async fn add_role_permission(&self, role_id: RoleId, permission_id: PermissionId) -> Result<()> {
        let mut conn = self.pool.acquire().await.context("Failed to acquire connection")?;
        Self::link_permission(&mut conn, role_id, permission_id).await
    }

    pub async fn remove_role_permission(
        &self,
        role_id: RoleId,
        permission_id: PermissionId,
    ) -> Result<()> {
        sqlx::query("DELETE FROM role_permissions WHERE role_id = ? AND permission_id = ?")
            .bind(role_id.to_string())
            .bind(permission_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to revoke permission")?;
        Ok(())
    }

    pub async fn set_role_active(&self, role_id: RoleId, active: bool) -> Result<()> {
        sqlx::query("UPDATE roles SET is_active = ? WHERE id = ?")
            .bind(active)
            .bind(role_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to update role")?;
        Ok(())
    }

    pub async fn delete_role(&self, role_id: RoleId) -> Result<()> {
        let mut tx = self.begin().await?;
        sqlx::query("DELETE FROM role_permissions WHERE role_id = ?")
            .bind(role_id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to delete role permissions")?;
        sqlx::query("DELETE FROM roles WHERE id = ?")
            .bind(role_id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to delete role")?;
        tx.commit().await.context("Failed to commit role deletion")?;
        Ok(())
    }

    pub async fn get_role(&self, id: RoleId) -> Result<Option<Role>> {
        let row = sqlx::query(
            "SELECT id, name, display_name, priority, is_system, is_active, created_at FROM roles WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch role")?;
        match row {
            Some(row) => Ok(Some(self.row_to_role(&row).await?)),
            None => Ok(None),
        }
    }

    pub async fn get_role_by_name(&self, name: &str) -> Result<Option<Role>> {
        let row = sqlx::query(
            "SELECT id, name, display_name, priority, is_system, is_active, created_at FROM roles WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch role by name")?;
        match row {
            Some(row) => Ok(Some(self.row_to_role(&row).await?)),
            None => Ok(None),
        }
    }

    /// Roles ordered by priority, highest first.
    pub async fn list_roles(&self) -> Result<Vec<Role>> {
        let rows = sqlx::query(
            "SELECT id, name, display_name, priority, is_system, is_active, created_at FROM roles ORDER BY priority DESC, name",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list roles")?;

        let mut roles = Vec::with_capacity(rows.len());
        for row in &rows {
            roles.push(self.row_to_role(row).await?);
        }
        Ok(roles)
    }

    async fn row_to_role(&self, row: &SqliteRow) -> Result<Role> {
        let id = parse_uuid(row.get("id"), "role id")?;
        let permissions = self
            .permissions_for_role(id)
            .await?
            .into_iter()
            .map(|p| p.id)
            .collect();

        Ok(Role {
            id,
            name: row.get("name"),
            display_name: row.get("display_name"),
            priority: row.get("priority"),
            is_system: row.get::<i32, _>("is_system") != 0,
            is_active: row.get::<i32, _>("is_active") != 0,
            permissions,
            created_at: parse_timestamp(row.get("created_at"), "created_at")?,
        })
    }

    pub async fn count_users_with_role(&self, role_id: RoleId) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM users WHERE role_id = ?")
            .bind(role_id.to_string())
            .fetch_one(&self.pool)
            .await
            .context("Failed to count role users")?;
        Ok(row.get("count"))
    }

    pub async fn save_user(&self, user: &User) -> Result<()> {
        sqlx::query("INSERT INTO users (id, username, role_id, created_at) VALUES (?, ?, ?, ?)")
            .bind(user.id.to_string())
            .bind(&user.username)
            .bind(user.role_id.map(|id| id.to_string()))
            .bind(user.created_at.to_rfc3339())
            .execute(&self.pool)
            .await
            .context("Failed to save user")?;
        Ok(())
    }

    pub async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        let row = sqlx::query("SELECT id, username, role_id, created_at FROM users WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user")?;
        row.as_ref().map(Self::row_to_user).transpose()
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT id, username, role_id, created_at FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user by username")?;
        row.as_ref().map(Self::row_to_user).transpose()
    }

    pub async fn set_user_role(&self, user_id: UserId, role_id: Option<RoleId>) -> Result<()> {
        sqlx::query("UPDATE users SET role_id = ? WHERE id = ?")
            .bind(role_id.map(|id| id.to_string()))
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to assign role")?;
        Ok(())
    }

    fn row_to_user(row: &SqliteRow) -> Result<User> {
        let role_id: Option<String> = row.get("role_id");
        Ok(User {
            id: parse_uuid(row.get("id"), "user id")?,
            username: row.get("username"),
            role_id: role_id
                .map(|s| Uuid::parse_str(&s))
                .transpose()
                .context("Invalid role ID")?,
            created_at: parse_timestamp(row.get("created_at"), "created_at")?,
        })
    }
}

fn parse_uuid(value: String, what: &str) -> Result<Uuid> {
    Uuid::parse_str(&value).with_context(|| format!("Invalid {}", what))
}

fn parse_timestamp(value: String, field: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(&value)
        .with_context(|| format!("Invalid {} timestamp", field))?
        .with_timezone(&Utc))
}

fn parse_optional_timestamp(value: Option<String>, field: &str) -> Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_timestamp(v, field)).transpose()
}

fn split_snapshot(
    snapshot: Option<&AccountSnapshot>,
) -> (Option<&str>, Option<&str>, Option<&str>) {
    match snapshot {
        Some(s) => (
            Some(s.account_number.as_str()),
            Some(s.ifsc.as_str()),
            Some(s.holder_name.as_str()),
        ),
        None => (None, None, None),
    }
}

fn join_snapshot(
    account_number: Option<String>,
    ifsc: Option<String>,
    holder_name: Option<String>,
) -> Option<AccountSnapshot> {
    account_number.map(|account_number| AccountSnapshot {
        account_number,
        ifsc: ifsc.unwrap_or_default(),
        holder_name: holder_name.unwrap_or_default(),
    })
}
