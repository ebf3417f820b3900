mod common;

use anyhow::Result;
use chrono::{Duration, Utc};
use common::{db_path, test_bank, Fixtures};
use khata::application::{AppError, LoanApplication};
use khata::domain::{
    format_cents, percent_of, rupees, Account, AccountType, Customer, JobKind, JobStatus,
    LoanStatus, LoanType, ScheduledJob, MAX_JOB_ATTEMPTS,
};
use khata::{Bank, Repository};

/// A verified customer with a current account holding ₹2,00,000
async fn borrower(bank: &Bank) -> Result<(Customer, Account)> {
    Fixtures::branch(bank).await?;
    let customer = Fixtures::verified_customer(bank, "Sunita Menon").await?;
    let account =
        Fixtures::account(bank, &customer, AccountType::Current, rupees(200_000), None).await?;
    Ok((customer, account))
}

fn personal_loan(customer: &Customer, account: &Account) -> LoanApplication {
    LoanApplication {
        customer_id: customer.id,
        account_number: account.account_number.clone(),
        loan_type: LoanType::Personal,
        principal: rupees(120_000),
        interest_rate: 10.5,
        tenure_months: 12,
        purpose: Some("Home renovation".to_string()),
    }
}

/// Apply, approve, disburse and let the activation job run
async fn active_loan(bank: &Bank, customer: &Customer, account: &Account) -> Result<String> {
    let loan = bank.loans.apply_loan(personal_loan(customer, account)).await?;
    bank.loans.approve_loan(&loan.loan_number, None).await?;
    bank.loans.disburse_loan(&loan.loan_number).await?;
    bank.loans
        .run_due_jobs(Utc::now() + Duration::hours(25))
        .await?;
    Ok(loan.loan_number)
}

#[tokio::test]
async fn test_loan_lifecycle_to_active() -> Result<()> {
    let (bank, _temp) = test_bank().await?;
    let (customer, account) = borrower(&bank).await?;

    let loan = bank.loans.apply_loan(personal_loan(&customer, &account)).await?;
    assert_eq!(loan.status, LoanStatus::Submitted);
    // ₹1,20,000 at 10.5% over 12 months
    assert!((1_057_700..=1_057_900).contains(&loan.emi), "emi {}", loan.emi);

    let loan = bank.loans.review_loan(&loan.loan_number).await?;
    assert_eq!(loan.status, LoanStatus::UnderReview);

    let loan = bank.loans.approve_loan(&loan.loan_number, None).await?;
    assert_eq!(loan.status, LoanStatus::Approved);

    let posting = bank.loans.disburse_loan(&loan.loan_number).await?;
    assert_eq!(posting.loan.status, LoanStatus::Disbursed);
    assert_eq!(posting.loan.outstanding, rupees(120_000));
    assert_eq!(posting.transaction.amount, rupees(120_000));
    assert!(posting.loan.next_emi_date.is_some());
    assert_eq!(
        bank.ledger.get_account(&account.account_number).await?.balance,
        rupees(320_000)
    );

    // The activation job is not due yet
    let run = bank.loans.run_due_jobs(Utc::now()).await?;
    assert_eq!(run.completed, 0);
    assert_eq!(
        bank.loans.get_loan(&loan.loan_number).await?.status,
        LoanStatus::Disbursed
    );

    let later = Utc::now() + Duration::hours(25);
    let run = bank.loans.run_due_jobs(later).await?;
    assert_eq!(run.completed, 1);
    assert_eq!(run.failed, 0);
    assert_eq!(
        bank.loans.get_loan(&loan.loan_number).await?.status,
        LoanStatus::Active
    );

    let jobs = bank.loans.list_jobs(Some(&loan.loan_number)).await?;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Done);

    // Completed jobs do not run again
    let run = bank.loans.run_due_jobs(later).await?;
    assert_eq!(run.completed, 0);

    Ok(())
}

#[tokio::test]
async fn test_invalid_transitions_are_rejected() -> Result<()> {
    let (bank, _temp) = test_bank().await?;
    let (customer, account) = borrower(&bank).await?;

    let loan = bank.loans.apply_loan(personal_loan(&customer, &account)).await?;

    let err = bank.loans.disburse_loan(&loan.loan_number).await.unwrap_err();
    assert!(matches!(
        err,
        AppError::InvalidTransition {
            from: LoanStatus::Submitted,
            to: LoanStatus::Disbursed,
            ..
        }
    ));

    let rejected = bank
        .loans
        .reject_loan(&loan.loan_number, "Insufficient income")
        .await?;
    assert_eq!(rejected.status, LoanStatus::Rejected);
    assert_eq!(
        rejected.rejection_reason.as_deref(),
        Some("Insufficient income")
    );

    let err = bank
        .loans
        .approve_loan(&loan.loan_number, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition { .. }));

    // Nothing was paid out
    assert_eq!(
        bank.ledger.get_account(&account.account_number).await?.balance,
        rupees(200_000)
    );

    Ok(())
}

#[tokio::test]
async fn test_application_is_validated() -> Result<()> {
    let (bank, _temp) = test_bank().await?;
    let (customer, account) = borrower(&bank).await?;
    let other = Fixtures::verified_customer(&bank, "Someone Else").await?;

    let mut application = personal_loan(&customer, &account);
    application.tenure_months = 0;
    let err = bank.loans.apply_loan(application).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));

    let mut application = personal_loan(&customer, &account);
    application.principal = 0;
    let err = bank.loans.apply_loan(application).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidAmount(_)));

    let mut application = personal_loan(&customer, &account);
    application.customer_id = other.id;
    let err = bank.loans.apply_loan(application).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));

    assert!(bank.loans.list_loans(None).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_sanctioned_amount_changes_disbursement() -> Result<()> {
    let (bank, _temp) = test_bank().await?;
    let (customer, account) = borrower(&bank).await?;

    let loan = bank.loans.apply_loan(personal_loan(&customer, &account)).await?;
    let approved = bank
        .loans
        .approve_loan(&loan.loan_number, Some(rupees(100_000)))
        .await?;
    assert_eq!(approved.sanctioned_amount, Some(rupees(100_000)));
    assert!(approved.emi < loan.emi);

    let posting = bank.loans.disburse_loan(&loan.loan_number).await?;
    assert_eq!(posting.transaction.amount, rupees(100_000));
    assert_eq!(posting.loan.outstanding, rupees(100_000));

    Ok(())
}

#[tokio::test]
async fn test_emi_repayment_splits_interest_first() -> Result<()> {
    let (bank, _temp) = test_bank().await?;
    let (customer, account) = borrower(&bank).await?;
    let loan_number = active_loan(&bank, &customer, &account).await?;
    let loan = bank.loans.get_loan(&loan_number).await?;

    let result = bank.loans.repay_emi(&loan_number, loan.emi).await?;
    // One month of 10.5% on ₹1,20,000
    assert_eq!(result.split.interest, rupees(1_050));
    assert_eq!(result.split.principal, loan.emi - rupees(1_050));
    assert_eq!(result.loan.emis_paid, 1);
    assert_eq!(result.loan.emis_remaining, 11);
    assert_eq!(result.loan.outstanding, rupees(120_000) - loan.emi);
    assert_eq!(result.loan.status, LoanStatus::Active);
    assert_eq!(
        bank.ledger.get_account(&account.account_number).await?.balance,
        rupees(320_000) - loan.emi
    );

    Ok(())
}

#[tokio::test]
async fn test_repaying_everything_closes_the_loan() -> Result<()> {
    let (bank, _temp) = test_bank().await?;
    let (customer, account) = borrower(&bank).await?;
    let loan_number = active_loan(&bank, &customer, &account).await?;
    let loan = bank.loans.get_loan(&loan_number).await?;
    let max = loan.max_repayment();

    let err = bank
        .loans
        .repay_emi(&loan_number, max + 1)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidAmount(_)));
    // Amounts are reported in rupees, not paise
    let message = err.to_string();
    assert!(message.contains(&format_cents(max)), "{message}");
    assert!(message.contains(&format_cents(max + 1)), "{message}");

    let result = bank.loans.repay_emi(&loan_number, max).await?;
    assert_eq!(result.loan.status, LoanStatus::Closed);
    assert_eq!(result.loan.outstanding, 0);

    let err = bank
        .loans
        .repay_emi(&loan_number, rupees(1))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));

    Ok(())
}

#[tokio::test]
async fn test_foreclosure_charges_penalty() -> Result<()> {
    let (bank, _temp) = test_bank().await?;
    let (customer, account) = borrower(&bank).await?;
    let loan_number = active_loan(&bank, &customer, &account).await?;

    let posting = bank.loans.foreclose(&loan_number).await?;
    // Outstanding plus 2% of principal outstanding
    assert_eq!(posting.transaction.amount, rupees(122_400));
    assert_eq!(posting.loan.status, LoanStatus::Closed);
    assert_eq!(
        bank.ledger.get_account(&account.account_number).await?.balance,
        rupees(320_000) - rupees(122_400)
    );

    let err = bank.loans.foreclose(&loan_number).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));

    Ok(())
}

#[tokio::test]
async fn test_failed_repayment_leaves_loan_unchanged() -> Result<()> {
    let (bank, _temp) = test_bank().await?;
    let (customer, account) = borrower(&bank).await?;
    let loan_number = active_loan(&bank, &customer, &account).await?;
    let loan = bank.loans.get_loan(&loan_number).await?;

    // Drain the account so the EMI cannot be paid
    let balance = bank.ledger.get_account(&account.account_number).await?.balance;
    bank.ledger
        .withdraw(&account.account_number, balance - rupees(100), None)
        .await?;

    let err = bank
        .loans
        .repay_emi(&loan_number, loan.emi)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InsufficientFunds { .. }));

    let after = bank.loans.get_loan(&loan_number).await?;
    assert_eq!(after.outstanding, loan.outstanding);
    assert_eq!(after.emis_paid, 0);

    Ok(())
}

#[tokio::test]
async fn test_overdue_penalty_and_recovery() -> Result<()> {
    let (bank, _temp) = test_bank().await?;
    let (customer, account) = borrower(&bank).await?;
    let loan_number = active_loan(&bank, &customer, &account).await?;
    let loan = bank.loans.get_loan(&loan_number).await?;

    // Nothing is late yet
    assert!(bank.loans.mark_overdue(Utc::now()).await?.is_empty());

    let now = Utc::now() + Duration::days(40);
    let due = loan.next_emi_date.unwrap();
    let days = (now - due).num_days();

    let flagged = bank.loans.mark_overdue(now).await?;
    assert_eq!(flagged.len(), 1);
    let overdue = bank.loans.get_loan(&loan_number).await?;
    assert_eq!(overdue.status, LoanStatus::Overdue);
    assert_eq!(overdue.overdue_days, days);
    assert_eq!(overdue.penalty_amount, percent_of(loan.emi * days, 200));

    let err = bank.loans.foreclose(&loan_number).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));

    let result = bank.loans.repay_emi(&loan_number, loan.emi).await?;
    assert_eq!(result.loan.status, LoanStatus::Active);
    assert_eq!(result.loan.overdue_days, 0);
    assert_eq!(result.loan.penalty_amount, 0);

    Ok(())
}

#[tokio::test]
async fn test_failing_job_is_retried_then_marked_failed() -> Result<()> {
    let (bank, temp) = test_bank().await?;

    // Activation job for a loan that does not exist
    let now = Utc::now();
    let job = ScheduledJob::new(JobKind::ActivateLoan, "LN0000000000", now);
    let repo = Repository::connect(&format!("sqlite:{}", db_path(&temp))).await?;
    let mut tx = repo.begin().await?;
    Repository::insert_job(&mut tx, &job).await?;
    tx.commit().await?;

    for attempt in 1..=MAX_JOB_ATTEMPTS {
        let run = bank.loans.run_due_jobs(now).await?;
        assert_eq!((run.completed, run.failed), (0, 1));

        let jobs = bank.loans.list_jobs(Some("LN0000000000")).await?;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].attempts, attempt);
        let last_error = jobs[0].last_error.as_deref().unwrap_or_default();
        assert!(last_error.contains("Loan not found"), "{last_error}");

        let expected = if attempt < MAX_JOB_ATTEMPTS {
            JobStatus::Pending
        } else {
            JobStatus::Failed
        };
        assert_eq!(jobs[0].status, expected);
        assert!(jobs[0].completed_at.is_none());
    }

    // A failed job is no longer due
    let run = bank.loans.run_due_jobs(now + Duration::days(1)).await?;
    assert_eq!((run.completed, run.failed), (0, 0));

    Ok(())
}
