use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{rupees, BranchId, Cents, CustomerId};

pub type AccountId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Savings,
    Current,
    FixedDeposit,
    RecurringDeposit,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Savings => "savings",
            AccountType::Current => "current",
            AccountType::FixedDeposit => "fixed_deposit",
            AccountType::RecurringDeposit => "recurring_deposit",
        }
    }

    /// Minimum balance applied when the account is opened without an override.
    pub fn default_minimum_balance(&self) -> Cents {
        match self {
            AccountType::Savings => rupees(1_000),
            AccountType::Current => rupees(5_000),
            AccountType::FixedDeposit | AccountType::RecurringDeposit => 0,
        }
    }

    /// Default (daily, monthly) transaction limits. Zero means no limit.
    pub fn default_limits(&self) -> (Cents, Cents) {
        match self {
            AccountType::Savings => (rupees(100_000), rupees(1_000_000)),
            AccountType::Current => (rupees(1_000_000), rupees(10_000_000)),
            AccountType::FixedDeposit | AccountType::RecurringDeposit => (0, 0),
        }
    }
}

impl std::str::FromStr for AccountType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "savings" => Ok(AccountType::Savings),
            "current" => Ok(AccountType::Current),
            "fixed_deposit" | "fd" => Ok(AccountType::FixedDeposit),
            "recurring_deposit" | "rd" => Ok(AccountType::RecurringDeposit),
            other => Err(format!("unknown account type '{}'", other)),
        }
    }
}

impl std::fmt::Display for AccountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Frozen,
    Dormant,
    Closed,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Frozen => "frozen",
            AccountStatus::Dormant => "dormant",
            AccountStatus::Closed => "closed",
        }
    }
}

impl std::str::FromStr for AccountStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(AccountStatus::Active),
            "frozen" => Ok(AccountStatus::Frozen),
            "dormant" => Ok(AccountStatus::Dormant),
            "closed" => Ok(AccountStatus::Closed),
            other => Err(format!("unknown account status '{}'", other)),
        }
    }
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    /// 16-digit customer-facing number
    pub account_number: String,
    pub customer_id: CustomerId,
    pub branch_id: BranchId,
    pub account_type: AccountType,
    pub balance: Cents,
    pub status: AccountStatus,
    pub minimum_balance: Cents,
    pub daily_limit: Cents,
    pub monthly_limit: Cents,
    pub upi_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// A fresh account always starts at zero; an opening deposit is posted
    /// through the ledger so it shows up in the statement.
    pub fn new(customer_id: CustomerId, branch_id: BranchId, account_type: AccountType) -> Self {
        let id = Uuid::new_v4();
        let (daily_limit, monthly_limit) = account_type.default_limits();
        let now = Utc::now();
        Self {
            id,
            account_number: account_number_from(id),
            customer_id,
            branch_id,
            account_type,
            balance: 0,
            status: AccountStatus::Active,
            minimum_balance: account_type.default_minimum_balance(),
            daily_limit,
            monthly_limit,
            upi_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_minimum_balance(mut self, minimum_balance: Cents) -> Self {
        self.minimum_balance = minimum_balance;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }

    pub fn is_savings(&self) -> bool {
        self.account_type == AccountType::Savings
    }

    /// Zero disables the check.
    pub fn exceeds_daily_limit(&self, amount: Cents) -> bool {
        self.daily_limit > 0 && amount > self.daily_limit
    }

    /// Balance left after a savings withdrawal must stay at or above the minimum.
    pub fn violates_minimum_balance(&self, amount: Cents) -> bool {
        self.is_savings() && self.balance - amount < self.minimum_balance
    }
}

/// Derive a 16-digit account number (leading digit non-zero) from the account id.
pub fn account_number_from(id: AccountId) -> String {
    const SPAN: u128 = 9_000_000_000_000_000;
    const FLOOR: u128 = 1_000_000_000_000_000;
    (FLOOR + id.as_u128() % SPAN).to_string()
}

/// UPI handles look like `name@bank`: one `@`, non-empty on both sides, no spaces.
pub fn is_valid_upi_id(upi_id: &str) -> bool {
    match upi_id.split_once('@') {
        Some((handle, provider)) => {
            !handle.is_empty()
                && !provider.is_empty()
                && !provider.contains('@')
                && !upi_id.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn savings() -> Account {
        Account::new(Uuid::new_v4(), Uuid::new_v4(), AccountType::Savings)
    }

    #[test]
    fn test_account_number_is_sixteen_digits() {
        for _ in 0..100 {
            let account = savings();
            assert_eq!(account.account_number.len(), 16);
            assert!(!account.account_number.starts_with('0'));
            assert!(account.account_number.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_type_defaults() {
        let account = savings();
        assert_eq!(account.minimum_balance, rupees(1_000));
        assert_eq!(account.daily_limit, rupees(100_000));
        assert_eq!(account.balance, 0);
        assert!(account.is_active());

        let fd = Account::new(Uuid::new_v4(), Uuid::new_v4(), AccountType::FixedDeposit);
        assert_eq!(fd.minimum_balance, 0);
        assert!(!fd.exceeds_daily_limit(rupees(50_000_000)));
    }

    #[test]
    fn test_minimum_balance_only_binds_savings() {
        let mut account = savings().with_minimum_balance(rupees(5_000));
        account.balance = rupees(5_000);
        assert!(account.violates_minimum_balance(1));

        let mut current = Account::new(Uuid::new_v4(), Uuid::new_v4(), AccountType::Current);
        current.balance = rupees(5_000);
        assert!(!current.violates_minimum_balance(rupees(5_000)));
    }

    #[test]
    fn test_account_type_parse() {
        assert_eq!("fixed-deposit".parse::<AccountType>(), Ok(AccountType::FixedDeposit));
        assert_eq!("RD".parse::<AccountType>(), Ok(AccountType::RecurringDeposit));
        assert!("loan".parse::<AccountType>().is_err());
    }

    #[test]
    fn test_upi_id_validation() {
        assert!(is_valid_upi_id("asha@okbank"));
        assert!(!is_valid_upi_id("asha"));
        assert!(!is_valid_upi_id("@okbank"));
        assert!(!is_valid_upi_id("a@b@c"));
        assert!(!is_valid_upi_id("as ha@okbank"));
    }
}
