use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Account, Cents, FeeQuote, TransferRail};

pub type TransactionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    Transfer,
    Neft,
    Rtgs,
    Imps,
    Upi,
    Reversal,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "deposit",
            TransactionType::Withdrawal => "withdrawal",
            TransactionType::Transfer => "transfer",
            TransactionType::Neft => "neft",
            TransactionType::Rtgs => "rtgs",
            TransactionType::Imps => "imps",
            TransactionType::Upi => "upi",
            TransactionType::Reversal => "reversal",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "deposit" => Some(TransactionType::Deposit),
            "withdrawal" => Some(TransactionType::Withdrawal),
            "transfer" => Some(TransactionType::Transfer),
            "neft" => Some(TransactionType::Neft),
            "rtgs" => Some(TransactionType::Rtgs),
            "imps" => Some(TransactionType::Imps),
            "upi" => Some(TransactionType::Upi),
            "reversal" => Some(TransactionType::Reversal),
            _ => None,
        }
    }
}

impl From<TransferRail> for TransactionType {
    fn from(rail: TransferRail) -> Self {
        match rail {
            TransferRail::Transfer => TransactionType::Transfer,
            TransferRail::Neft => TransactionType::Neft,
            TransferRail::Rtgs => TransactionType::Rtgs,
            TransferRail::Imps => TransactionType::Imps,
            TransferRail::Upi => TransactionType::Upi,
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Success,
    Failed,
    Reversed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Processing => "processing",
            TransactionStatus::Success => "success",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Reversed => "reversed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TransactionStatus::Pending),
            "processing" => Some(TransactionStatus::Processing),
            "success" => Some(TransactionStatus::Success),
            "failed" => Some(TransactionStatus::Failed),
            "reversed" => Some(TransactionStatus::Reversed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Point-in-time copy of the account details a transaction touched, so the
/// record stays readable after the account is renamed or closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub account_number: String,
    pub ifsc: String,
    pub holder_name: String,
}

impl AccountSnapshot {
    pub fn of(account: &Account, ifsc: impl Into<String>, holder_name: impl Into<String>) -> Self {
        Self {
            account_number: account.account_number.clone(),
            ifsc: ifsc.into(),
            holder_name: holder_name.into(),
        }
    }
}

/// A posted movement of money. Transactions are never edited after posting
/// except for the status flip to `reversed`; corrections are compensating
/// `reversal` transactions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    /// Monotonically increasing, assigned by the repository
    pub sequence: i64,
    /// UTR for interbank rails
    pub reference_number: Option<String>,
    pub transaction_type: TransactionType,
    /// Debited party, if any
    pub from_account: Option<AccountSnapshot>,
    /// Credited party, if any
    pub to_account: Option<AccountSnapshot>,
    pub amount: Cents,
    pub charges: Cents,
    pub gst: Cents,
    pub total_debit: Cents,
    pub status: TransactionStatus,
    /// Balance of the debited account after posting (credited account when
    /// nothing was debited)
    pub balance_after: Option<Cents>,
    pub description: Option<String>,
    pub reverses: Option<TransactionId>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    fn new(transaction_type: TransactionType, amount: Cents) -> Self {
        assert!(amount > 0, "Transaction amount must be positive");
        let id = Uuid::new_v4();
        Self {
            id,
            sequence: 0,
            reference_number: None,
            transaction_type,
            from_account: None,
            to_account: None,
            amount,
            charges: 0,
            gst: 0,
            total_debit: amount,
            status: TransactionStatus::Success,
            balance_after: None,
            description: None,
            reverses: None,
            created_at: Utc::now(),
        }
    }

    pub fn deposit(to: AccountSnapshot, amount: Cents) -> Self {
        let mut txn = Self::new(TransactionType::Deposit, amount);
        txn.to_account = Some(to);
        txn
    }

    pub fn withdrawal(from: AccountSnapshot, amount: Cents) -> Self {
        let mut txn = Self::new(TransactionType::Withdrawal, amount);
        txn.from_account = Some(from);
        txn
    }

    pub fn transfer(from: AccountSnapshot, to: AccountSnapshot, quote: &FeeQuote) -> Self {
        let mut txn = Self::new(quote.rail.into(), quote.amount);
        txn.from_account = Some(from);
        txn.to_account = Some(to);
        txn.charges = quote.charges;
        txn.gst = quote.gst;
        txn.total_debit = quote.total_debit;
        if quote.rail.issues_reference() {
            txn.reference_number = Some(reference_number(quote.rail, txn.id));
        }
        txn
    }

    /// Build the compensating record for this transaction. Parties swap:
    /// the original debited account is credited `total_debit`, the original
    /// credited account is debited `amount`. Fees are carried over so the
    /// record keeps `total_debit = amount + charges + gst`.
    pub fn create_reversal(&self, reason: Option<&str>) -> Self {
        let mut txn = Self::new(TransactionType::Reversal, self.amount);
        txn.from_account = self.to_account.clone();
        txn.to_account = self.from_account.clone();
        txn.charges = self.charges;
        txn.gst = self.gst;
        txn.total_debit = self.total_debit;
        txn.reverses = Some(self.id);
        txn.description = Some(match reason {
            Some(reason) => format!("Reversal of {}: {}", self.id, reason),
            None => format!("Reversal of {}", self.id),
        });
        txn
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_balance_after(mut self, balance: Cents) -> Self {
        self.balance_after = Some(balance);
        self
    }

    pub fn is_reversal(&self) -> bool {
        self.transaction_type == TransactionType::Reversal
    }

    /// `total_debit == amount + charges + gst`
    pub fn totals_balance(&self) -> bool {
        self.amount
            .checked_add(self.charges)
            .and_then(|sum| sum.checked_add(self.gst))
            == Some(self.total_debit)
    }

    /// Signed balance effect per account number. A reversal credits its
    /// `to` party with `total_debit` and debits its `from` party `amount`;
    /// every other type debits `from` by `total_debit` and credits `to` by
    /// `amount`.
    pub fn legs(&self) -> Vec<(&str, Cents)> {
        let (debit, credit) = if self.is_reversal() {
            (self.amount, self.total_debit)
        } else {
            (self.total_debit, self.amount)
        };
        let mut legs = Vec::with_capacity(2);
        if let Some(from) = &self.from_account {
            legs.push((from.account_number.as_str(), -debit));
        }
        if let Some(to) = &self.to_account {
            legs.push((to.account_number.as_str(), credit));
        }
        legs
    }
}

/// Unique transaction reference for interbank rails, e.g. `NEFT104857392017`.
fn reference_number(rail: TransferRail, id: TransactionId) -> String {
    format!(
        "{}{:012}",
        rail.as_str().to_uppercase(),
        id.as_u128() % 1_000_000_000_000
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::rupees;

    fn snapshot(number: &str) -> AccountSnapshot {
        AccountSnapshot {
            account_number: number.to_string(),
            ifsc: "KHAT0000001".to_string(),
            holder_name: "Holder".to_string(),
        }
    }

    #[test]
    fn test_neft_transfer_carries_fees_and_reference() {
        let quote = FeeQuote::new(TransferRail::Neft, rupees(10_000)).unwrap();
        let txn = Transaction::transfer(snapshot("1"), snapshot("2"), &quote);

        assert_eq!(txn.transaction_type, TransactionType::Neft);
        assert_eq!(txn.total_debit, rupees(10_000) + 295);
        assert!(txn.totals_balance());
        let reference = txn.reference_number.unwrap();
        assert!(reference.starts_with("NEFT"));
        assert_eq!(reference.len(), 16);
    }

    #[test]
    fn test_upi_transfer_has_no_reference() {
        let quote = FeeQuote::new(TransferRail::Upi, rupees(500)).unwrap();
        let txn = Transaction::transfer(snapshot("1"), snapshot("2"), &quote);
        assert!(txn.reference_number.is_none());
    }

    #[test]
    fn test_legs_of_transfer() {
        let quote = FeeQuote::new(TransferRail::Imps, rupees(500)).unwrap();
        let txn = Transaction::transfer(snapshot("A"), snapshot("B"), &quote);
        assert_eq!(
            txn.legs(),
            vec![("A", -(rupees(500) + 590)), ("B", rupees(500))]
        );
    }

    #[test]
    fn test_reversal_swaps_parties_and_inverts_legs() {
        let quote = FeeQuote::new(TransferRail::Imps, rupees(500)).unwrap();
        let original = Transaction::transfer(snapshot("A"), snapshot("B"), &quote);
        let reversal = original.create_reversal(Some("duplicate"));

        assert!(reversal.is_reversal());
        assert_eq!(reversal.reverses, Some(original.id));
        assert!(reversal.totals_balance());
        assert_eq!(
            reversal.legs(),
            vec![("B", -rupees(500)), ("A", rupees(500) + 590)]
        );
        assert!(reversal.description.unwrap().ends_with("duplicate"));
    }

    #[test]
    fn test_deposit_legs() {
        let txn = Transaction::deposit(snapshot("A"), 700);
        assert_eq!(txn.legs(), vec![("A", 700)]);
        assert_eq!(txn.charges, 0);
    }

    #[test]
    #[should_panic(expected = "Transaction amount must be positive")]
    fn test_transaction_requires_positive_amount() {
        Transaction::deposit(snapshot("A"), 0);
    }
}
