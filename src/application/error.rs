use thiserror::Error;

use crate::domain::{Cents, LoanStatus, TransactionId};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Customer not found: {0}")]
    CustomerNotFound(String),

    #[error("Branch not found: {0}")]
    BranchNotFound(String),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Loan not found: {0}")]
    LoanNotFound(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Role not found: {0}")]
    RoleNotFound(String),

    #[error("Permission not found: {0}")]
    PermissionNotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("Customer {0} has not completed KYC verification")]
    KycNotVerified(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Insufficient funds in account {account_number}: balance {balance}, required {required}")]
    InsufficientFunds {
        account_number: String,
        balance: Cents,
        required: Cents,
    },

    #[error("Withdrawal would leave account {account_number} below its minimum balance of {minimum_balance}")]
    MinimumBalanceViolation {
        account_number: String,
        minimum_balance: Cents,
    },

    #[error("Amount {amount} exceeds the daily transaction limit of {limit}")]
    LimitExceeded { amount: Cents, limit: Cents },

    #[error("{0}")]
    LimitViolation(String),

    #[error("Transaction {0} has already been reversed")]
    AlreadyReversed(TransactionId),

    #[error("Transaction {0} cannot be reversed")]
    NotReversible(TransactionId),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Loan {loan_number} cannot move from {from} to {to}")]
    InvalidTransition {
        loan_number: String,
        from: LoanStatus,
        to: LoanStatus,
    },

    #[error("Account {account_number} still holds {balance}; only zero-balance accounts can be closed")]
    BalanceNotZero {
        account_number: String,
        balance: Cents,
    },

    #[error("System role '{0}' cannot be modified")]
    SystemRoleProtected(String),

    #[error("Role '{0}' is still assigned to users")]
    RoleInUse(String),

    #[error("You do not have permission to perform this action")]
    PermissionDenied,

    #[error("Ledger inconsistency: {0}")]
    LedgerInconsistency(String),

    #[error("Database error: {0}")]
    Database(#[from] anyhow::Error),
}

impl AppError {
    /// HTTP-style status used in the response envelope.
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::AccountNotFound(_)
            | AppError::CustomerNotFound(_)
            | AppError::BranchNotFound(_)
            | AppError::TransactionNotFound(_)
            | AppError::LoanNotFound(_)
            | AppError::UserNotFound(_)
            | AppError::RoleNotFound(_)
            | AppError::PermissionNotFound(_) => 404,
            AppError::AlreadyExists(_)
            | AppError::AlreadyReversed(_)
            | AppError::RoleInUse(_) => 409,
            AppError::PermissionDenied | AppError::SystemRoleProtected(_) => 403,
            AppError::LedgerInconsistency(_) | AppError::Database(_) => 500,
            _ => 400,
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(AppError::AccountNotFound("1".into()).status_code(), 404);
        assert_eq!(AppError::AlreadyReversed(Uuid::new_v4()).status_code(), 409);
        assert_eq!(AppError::PermissionDenied.status_code(), 403);
        assert_eq!(
            AppError::LimitExceeded {
                amount: 10,
                limit: 5
            }
            .status_code(),
            400
        );
        assert_eq!(
            AppError::Database(anyhow::anyhow!("disk full")).status_code(),
            500
        );
    }

    #[test]
    fn test_permission_denied_message() {
        assert_eq!(
            AppError::PermissionDenied.to_string(),
            "You do not have permission to perform this action"
        );
    }
}
