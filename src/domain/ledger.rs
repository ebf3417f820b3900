use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{Account, Cents, Transaction, TransactionId};

/// Replay transaction legs into per-account balances.
/// Every posting starts from an empty account, so a stored balance must equal
/// the sum of its legs.
pub fn compute_balances(transactions: &[Transaction]) -> HashMap<String, Cents> {
    let mut balances: HashMap<String, Cents> = HashMap::new();
    for txn in transactions {
        for (account_number, delta) in txn.legs() {
            let balance = balances.entry(account_number.to_string()).or_insert(0);
            *balance = balance.saturating_add(delta);
        }
    }
    balances
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntegrityIssue {
    /// Stored balance disagrees with the replayed transaction legs
    BalanceMismatch {
        account_number: String,
        stored: Cents,
        derived: Cents,
    },
    NegativeBalance {
        account_number: String,
        balance: Cents,
    },
    /// `total_debit != amount + charges + gst`
    TotalMismatch { transaction_id: TransactionId },
    /// A leg points at an account number that does not exist
    UnknownAccount {
        transaction_id: TransactionId,
        account_number: String,
    },
    SequenceGap { expected: i64, found: i64 },
}

impl std::fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrityIssue::BalanceMismatch {
                account_number,
                stored,
                derived,
            } => write!(
                f,
                "account {}: stored balance {} but transactions sum to {}",
                account_number, stored, derived
            ),
            IntegrityIssue::NegativeBalance {
                account_number,
                balance,
            } => write!(f, "account {}: negative balance {}", account_number, balance),
            IntegrityIssue::TotalMismatch { transaction_id } => write!(
                f,
                "transaction {}: total debit is not amount + charges + gst",
                transaction_id
            ),
            IntegrityIssue::UnknownAccount {
                transaction_id,
                account_number,
            } => write!(
                f,
                "transaction {}: references unknown account {}",
                transaction_id, account_number
            ),
            IntegrityIssue::SequenceGap { expected, found } => {
                write!(f, "sequence gap: expected {}, found {}", expected, found)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub account_count: usize,
    pub transaction_count: usize,
    pub issues: Vec<IntegrityIssue>,
}

impl IntegrityReport {
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Cross-check stored account balances against the transaction log.
/// `transactions` must be ordered by sequence.
pub fn build_integrity_report(accounts: &[Account], transactions: &[Transaction]) -> IntegrityReport {
    let mut issues = Vec::new();
    let derived = compute_balances(transactions);
    let known: HashMap<&str, &Account> = accounts
        .iter()
        .map(|a| (a.account_number.as_str(), a))
        .collect();

    let mut expected_sequence = transactions.first().map(|t| t.sequence);
    for txn in transactions {
        if let Some(expected) = expected_sequence {
            if txn.sequence != expected {
                issues.push(IntegrityIssue::SequenceGap {
                    expected,
                    found: txn.sequence,
                });
            }
        }
        expected_sequence = Some(txn.sequence + 1);

        if !txn.totals_balance() {
            issues.push(IntegrityIssue::TotalMismatch {
                transaction_id: txn.id,
            });
        }
        for (number, _) in txn.legs() {
            if !known.contains_key(number) {
                issues.push(IntegrityIssue::UnknownAccount {
                    transaction_id: txn.id,
                    account_number: number.to_string(),
                });
            }
        }
    }

    for account in accounts {
        let replayed = derived.get(&account.account_number).copied().unwrap_or(0);
        if replayed != account.balance {
            issues.push(IntegrityIssue::BalanceMismatch {
                account_number: account.account_number.clone(),
                stored: account.balance,
                derived: replayed,
            });
        }
        if account.balance < 0 {
            issues.push(IntegrityIssue::NegativeBalance {
                account_number: account.account_number.clone(),
                balance: account.balance,
            });
        }
    }

    IntegrityReport {
        account_count: accounts.len(),
        transaction_count: transactions.len(),
        issues,
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::domain::{rupees, AccountSnapshot, AccountType, FeeQuote, TransferRail};

    fn account(balance: Cents) -> Account {
        let mut account = Account::new(Uuid::new_v4(), Uuid::new_v4(), AccountType::Current);
        account.balance = balance;
        account
    }

    fn snap(account: &Account) -> AccountSnapshot {
        AccountSnapshot::of(account, "KHAT0000001", "Holder")
    }

    fn sequenced(mut txns: Vec<Transaction>) -> Vec<Transaction> {
        for (i, txn) in txns.iter_mut().enumerate() {
            txn.sequence = i as i64 + 1;
        }
        txns
    }

    #[test]
    fn test_consistent_ledger() {
        let quote = FeeQuote::new(TransferRail::Neft, rupees(1_000)).unwrap();
        let a = account(rupees(10_000) - quote.total_debit);
        let b = account(rupees(1_000));
        let txns = sequenced(vec![
            Transaction::deposit(snap(&a), rupees(10_000)),
            Transaction::transfer(snap(&a), snap(&b), &quote),
        ]);

        let report = build_integrity_report(&[a.clone(), b.clone()], &txns);
        assert!(report.is_ok(), "{:?}", report.issues);
        assert_eq!(compute_balances(&txns)[&a.account_number], a.balance);
    }

    #[test]
    fn test_reversal_restores_balances() {
        let quote = FeeQuote::new(TransferRail::Imps, rupees(2_000)).unwrap();
        let a = account(rupees(5_000));
        let b = account(0);
        let transfer = Transaction::transfer(snap(&a), snap(&b), &quote);
        let reversal = transfer.create_reversal(None);
        let txns = sequenced(vec![
            Transaction::deposit(snap(&a), rupees(5_000)),
            transfer,
            reversal,
        ]);

        assert!(build_integrity_report(&[a, b], &txns).is_ok());
    }

    #[test]
    fn test_detects_tampered_balance() {
        let a = account(rupees(600));
        let txns = sequenced(vec![Transaction::deposit(snap(&a), rupees(500))]);

        let report = build_integrity_report(&[a.clone()], &txns);
        assert_eq!(
            report.issues,
            vec![IntegrityIssue::BalanceMismatch {
                account_number: a.account_number,
                stored: rupees(600),
                derived: rupees(500),
            }]
        );
    }

    #[test]
    fn test_detects_sequence_gap_and_unknown_account() {
        let a = account(rupees(300));
        let ghost = account(0);
        let mut txns = sequenced(vec![
            Transaction::deposit(snap(&a), rupees(300)),
            Transaction::deposit(snap(&ghost), rupees(1)),
        ]);
        txns[1].sequence = 5;

        let report = build_integrity_report(&[a], &txns);
        assert!(report
            .issues
            .contains(&IntegrityIssue::SequenceGap { expected: 2, found: 5 }));
        assert!(report
            .issues
            .iter()
            .any(|i| matches!(i, IntegrityIssue::UnknownAccount { .. })));
    }
}
