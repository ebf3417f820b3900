use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

use crate::config::Policy;
use crate::domain::{
    format_cents, Cents, CustomerId, JobKind, Loan, LoanStatus, LoanType, RepaymentSplit,
    ScheduledJob, Transaction,
};
use crate::storage::Repository;

use super::{AppError, LedgerService};

/// Loan lifecycle. Money moves through the ledger's in-transaction postings
/// so the loan update and the matching transaction commit together.
#[derive(Clone)]
pub struct LoanService {
    repo: Repository,
    policy: Policy,
}

/// Loan application as submitted by a customer.
#[derive(Debug, Clone)]
pub struct LoanApplication {
    pub customer_id: CustomerId,
    pub account_number: String,
    pub loan_type: LoanType,
    pub principal: Cents,
    /// Annual percent, e.g. 10.5
    pub interest_rate: f64,
    pub tenure_months: u32,
    pub purpose: Option<String>,
}

/// Result of a disbursement or foreclosure
#[derive(Debug, Clone, Serialize)]
pub struct LoanPosting {
    pub loan: Loan,
    pub transaction: Transaction,
}

/// Result of an EMI repayment
#[derive(Debug, Clone, Serialize)]
pub struct RepaymentResult {
    pub loan: Loan,
    pub transaction: Transaction,
    pub split: RepaymentSplit,
}

/// Outcome of one `run_due_jobs` pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobRun {
    pub completed: usize,
    pub failed: usize,
}

impl LoanService {
    pub fn new(repo: Repository, policy: Policy) -> Self {
        Self { repo, policy }
    }

    // ========================
    // Application and approval
    // ========================

    pub async fn apply_loan(&self, application: LoanApplication) -> Result<Loan, AppError> {
        if application.principal <= 0 {
            return Err(AppError::InvalidAmount(
                "Principal must be positive".to_string(),
            ));
        }
        if application.tenure_months == 0 {
            return Err(AppError::InvalidInput(
                "Tenure must be at least one month".to_string(),
            ));
        }
        if !application.interest_rate.is_finite() || application.interest_rate < 0.0 {
            return Err(AppError::InvalidInput(format!(
                "Invalid interest rate: {}",
                application.interest_rate
            )));
        }

        let customer = self
            .repo
            .get_customer(application.customer_id)
            .await?
            .ok_or_else(|| AppError::CustomerNotFound(application.customer_id.to_string()))?;
        if !customer.is_kyc_verified() {
            return Err(AppError::KycNotVerified(customer.id.to_string()));
        }

        let account = self
            .repo
            .get_account(&application.account_number)
            .await?
            .ok_or_else(|| AppError::AccountNotFound(application.account_number.clone()))?;
        if account.customer_id != customer.id {
            return Err(AppError::InvalidInput(format!(
                "Account {} does not belong to customer {}",
                account.account_number, customer.id
            )));
        }
        if !account.is_active() {
            return Err(AppError::InvalidState(format!(
                "Account {} is {}",
                account.account_number, account.status
            )));
        }

        let mut loan = Loan::new(
            customer.id,
            account.account_number,
            account.branch_id,
            application.loan_type,
            application.principal,
            application.interest_rate,
            application.tenure_months,
        );
        if let Some(purpose) = application.purpose {
            loan = loan.with_purpose(purpose);
        }

        self.repo.save_loan(&loan).await?;
        info!(loan = %loan.loan_number, principal = loan.principal, emi = loan.emi, "loan application submitted");
        Ok(loan)
    }

    pub async fn review_loan(&self, loan_number: &str) -> Result<Loan, AppError> {
        let mut loan = self.get_loan(loan_number).await?;
        let expected = loan.status;
        ensure_transition(&loan, LoanStatus::UnderReview)?;

        loan.status = LoanStatus::UnderReview;
        loan.updated_at = Utc::now();
        self.store(&loan, expected).await?;
        info!(loan = %loan_number, "loan under review");
        Ok(loan)
    }

    /// Approve, optionally for a different amount than applied for.
    pub async fn approve_loan(
        &self,
        loan_number: &str,
        sanctioned_amount: Option<Cents>,
    ) -> Result<Loan, AppError> {
        let mut loan = self.get_loan(loan_number).await?;
        let expected = loan.status;
        ensure_transition(&loan, LoanStatus::Approved)?;
        if matches!(sanctioned_amount, Some(amount) if amount <= 0) {
            return Err(AppError::InvalidAmount(
                "Sanctioned amount must be positive".to_string(),
            ));
        }

        loan.sanction(sanctioned_amount);
        loan.updated_at = Utc::now();
        self.store(&loan, expected).await?;
        info!(loan = %loan_number, sanctioned = loan.amount_to_disburse(), emi = loan.emi, "loan approved");
        Ok(loan)
    }

    pub async fn reject_loan(&self, loan_number: &str, reason: &str) -> Result<Loan, AppError> {
        let mut loan = self.get_loan(loan_number).await?;
        let expected = loan.status;
        ensure_transition(&loan, LoanStatus::Rejected)?;

        loan.status = LoanStatus::Rejected;
        loan.rejection_reason = Some(reason.to_string());
        loan.updated_at = Utc::now();
        self.store(&loan, expected).await?;
        info!(loan = %loan_number, "loan rejected");
        Ok(loan)
    }

    // ========================
    // Money movements
    // ========================

    /// Pay the sanctioned amount into the linked account and schedule the
    /// loan's activation after the cooling period.
    pub async fn disburse_loan(&self, loan_number: &str) -> Result<LoanPosting, AppError> {
        let mut loan = self.get_loan(loan_number).await?;
        ensure_transition(&loan, LoanStatus::Disbursed)?;

        let now = Utc::now();
        let amount = loan.amount_to_disburse();
        let job = ScheduledJob::new(
            JobKind::ActivateLoan,
            loan.loan_number.clone(),
            now + self.policy.activation_delay(),
        );

        let mut tx = self.repo.begin().await?;
        let transaction = LedgerService::post_deposit(
            &mut tx,
            &loan.account_number,
            amount,
            Some(format!("Loan disbursement {}", loan.loan_number)),
        )
        .await?;
        loan.mark_disbursed(now);
        loan.updated_at = now;
        Self::store_in(&mut tx, &loan, LoanStatus::Approved).await?;
        Repository::insert_job(&mut tx, &job).await?;
        tx.commit().await.context("Failed to commit disbursement")?;

        info!(loan = %loan_number, amount, activates_at = %job.run_at, "loan disbursed");
        Ok(LoanPosting { loan, transaction })
    }

    /// Pay `amount` towards the loan from its linked account. The interest
    /// for the month is taken first; the rest reduces principal.
    pub async fn repay_emi(
        &self,
        loan_number: &str,
        amount: Cents,
    ) -> Result<RepaymentResult, AppError> {
        if amount <= 0 {
            return Err(AppError::InvalidAmount(
                "Repayment must be positive".to_string(),
            ));
        }

        let mut tx = self.repo.begin().await?;
        let mut loan = Self::load_loan(&mut tx, loan_number).await?;
        let expected = loan.status;
        if !matches!(expected, LoanStatus::Active | LoanStatus::Overdue) {
            return Err(AppError::InvalidState(format!(
                "Loan {} is {} and does not accept repayments",
                loan_number, expected
            )));
        }
        let max = loan.max_repayment();
        if amount > max {
            return Err(AppError::InvalidAmount(format!(
                "Repayment of {} exceeds the {} currently due",
                format_cents(amount),
                format_cents(max)
            )));
        }

        let transaction = LedgerService::post_withdrawal(
            &mut tx,
            &loan.account_number,
            amount,
            Some(format!("EMI repayment {}", loan.loan_number)),
        )
        .await
        .inspect_err(|e| warn!(loan = %loan_number, amount, "repayment rejected: {e}"))?;
        let split = loan.apply_repayment(amount);
        loan.updated_at = Utc::now();
        Self::store_in(&mut tx, &loan, expected).await?;
        tx.commit().await.context("Failed to commit repayment")?;

        info!(
            loan = %loan_number,
            amount,
            interest = split.interest,
            principal = split.principal,
            outstanding = loan.outstanding,
            "EMI repaid"
        );
        if loan.status == LoanStatus::Closed {
            info!(loan = %loan_number, "loan closed");
        }
        Ok(RepaymentResult {
            loan,
            transaction,
            split,
        })
    }

    /// Settle an active loan early: outstanding plus the foreclosure penalty.
    pub async fn foreclose(&self, loan_number: &str) -> Result<LoanPosting, AppError> {
        let mut loan = self.get_loan(loan_number).await?;
        if loan.status != LoanStatus::Active {
            return Err(AppError::InvalidState(format!(
                "Only active loans can be foreclosed; {} is {}",
                loan_number, loan.status
            )));
        }

        let amount = loan.foreclosure_amount(self.policy.foreclosure_penalty_bps);
        let mut tx = self.repo.begin().await?;
        let transaction = LedgerService::post_withdrawal(
            &mut tx,
            &loan.account_number,
            amount,
            Some(format!("Loan foreclosure {}", loan.loan_number)),
        )
        .await?;
        loan.settle();
        loan.updated_at = Utc::now();
        Self::store_in(&mut tx, &loan, LoanStatus::Active).await?;
        tx.commit().await.context("Failed to commit foreclosure")?;

        info!(loan = %loan_number, amount, "loan foreclosed");
        Ok(LoanPosting { loan, transaction })
    }

    /// Flag every active loan whose next EMI date has passed.
    pub async fn mark_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Loan>, AppError> {
        let mut flagged = Vec::new();
        for mut loan in self.repo.list_loans(Some(LoanStatus::Active)).await? {
            let Some(days) = loan.days_past_due(now) else {
                continue;
            };
            loan.mark_overdue(days, self.policy.overdue_penalty_bps_per_day);
            loan.updated_at = now;
            self.store(&loan, LoanStatus::Active).await?;
            warn!(loan = %loan.loan_number, days, penalty = loan.penalty_amount, "loan overdue");
            flagged.push(loan);
        }
        Ok(flagged)
    }

    // ========================
    // Scheduled jobs
    // ========================

    /// Run every pending job whose time has come. A failed job records its
    /// error and stays pending until it runs out of attempts.
    pub async fn run_due_jobs(&self, now: DateTime<Utc>) -> Result<JobRun, AppError> {
        let mut run = JobRun::default();
        for job in self.repo.list_due_jobs(now).await? {
            match self.run_job(&job, now).await {
                Ok(()) => run.completed += 1,
                Err(err) => {
                    warn!(job = %job.id, kind = %job.kind, subject = %job.subject, "job failed: {err}");
                    let mut job = job;
                    job.fail(err.to_string());
                    let mut tx = self.repo.begin().await?;
                    Repository::update_job(&mut tx, &job).await?;
                    tx.commit().await.context("Failed to record job failure")?;
                    run.failed += 1;
                }
            }
        }
        if run.completed + run.failed > 0 {
            info!(completed = run.completed, failed = run.failed, "scheduled jobs run");
        }
        Ok(run)
    }

    pub async fn list_jobs(&self, subject: Option<&str>) -> Result<Vec<ScheduledJob>, AppError> {
        Ok(self.repo.list_jobs(subject).await?)
    }

    async fn run_job(&self, job: &ScheduledJob, now: DateTime<Utc>) -> Result<(), AppError> {
        let mut tx = self.repo.begin().await?;
        match job.kind {
            JobKind::ActivateLoan => Self::activate(&mut tx, &job.subject, now).await?,
        }
        let mut done = job.clone();
        done.complete(now);
        Repository::update_job(&mut tx, &done).await?;
        tx.commit().await.context("Failed to commit job")?;
        Ok(())
    }

    /// Disbursed → active. Loans that already moved on are left alone.
    async fn activate(
        conn: &mut SqliteConnection,
        loan_number: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let mut loan = Self::load_loan(conn, loan_number).await?;
        if loan.status != LoanStatus::Disbursed {
            debug!(loan = %loan_number, status = %loan.status, "activation skipped");
            return Ok(());
        }

        loan.status = LoanStatus::Active;
        loan.updated_at = now;
        Self::store_in(conn, &loan, LoanStatus::Disbursed).await?;
        info!(loan = %loan_number, "loan activated");
        Ok(())
    }

    // ========================
    // Queries
    // ========================

    pub async fn get_loan(&self, loan_number: &str) -> Result<Loan, AppError> {
        self.repo
            .get_loan(loan_number)
            .await?
            .ok_or_else(|| AppError::LoanNotFound(loan_number.to_string()))
    }

    pub async fn list_loans(&self, status: Option<LoanStatus>) -> Result<Vec<Loan>, AppError> {
        Ok(self.repo.list_loans(status).await?)
    }

    async fn store(&self, loan: &Loan, expected: LoanStatus) -> Result<(), AppError> {
        let mut tx = self.repo.begin().await?;
        Self::store_in(&mut tx, loan, expected).await?;
        tx.commit().await.context("Failed to commit loan update")?;
        Ok(())
    }

    async fn load_loan(conn: &mut SqliteConnection, loan_number: &str) -> Result<Loan, AppError> {
        Repository::fetch_loan(conn, loan_number)
            .await?
            .ok_or_else(|| AppError::LoanNotFound(loan_number.to_string()))
    }

    async fn store_in(
        conn: &mut SqliteConnection,
        loan: &Loan,
        expected: LoanStatus,
    ) -> Result<(), AppError> {
        if !Repository::update_loan(conn, loan, expected).await? {
            return Err(AppError::LedgerInconsistency(format!(
                "loan {} changed while it was being updated",
                loan.loan_number
            )));
        }
        Ok(())
    }
}

fn ensure_transition(loan: &Loan, next: LoanStatus) -> Result<(), AppError> {
    if loan.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(AppError::InvalidTransition {
            loan_number: loan.loan_number.clone(),
            from: loan.status,
            to: next,
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::application::{Bank, NewAccount};
    use crate::domain::{rupees, AccountType, KycStatus};

    #[tokio::test]
    async fn test_status_moved_underneath_update_is_inconsistent() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("loans.db");
        let bank = Bank::init(&path.to_string_lossy(), Policy::default()).await?;
        bank.ledger.create_branch("Main Branch", "KHAT0000001").await?;
        let customer = bank.ledger.create_customer("Sunita Menon", None).await?;
        bank.ledger
            .set_kyc_status(customer.id, KycStatus::Verified)
            .await?;
        let account = bank
            .ledger
            .open_account(NewAccount {
                customer_id: customer.id,
                branch_ifsc: "KHAT0000001".to_string(),
                account_type: AccountType::Current,
                initial_deposit: rupees(10_000),
                minimum_balance: None,
            })
            .await?;
        let loan = bank
            .loans
            .apply_loan(LoanApplication {
                customer_id: customer.id,
                account_number: account.account_number.clone(),
                loan_type: LoanType::Personal,
                principal: rupees(50_000),
                interest_rate: 12.0,
                tenure_months: 6,
                purpose: None,
            })
            .await?;

        // The caller believes the loan was already approved
        let mut tx = bank.loans.repo.begin().await?;
        let mut stored = LoanService::load_loan(&mut tx, &loan.loan_number).await?;
        stored.status = LoanStatus::Disbursed;
        let err = LoanService::store_in(&mut tx, &stored, LoanStatus::Approved)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::LedgerInconsistency(_)));
        tx.rollback().await?;

        assert_eq!(
            bank.loans.get_loan(&loan.loan_number).await?.status,
            LoanStatus::Submitted
        );
        Ok(())
    }
}
