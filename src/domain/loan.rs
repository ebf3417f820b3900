use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{percent_of, round_to_cents, BasisPoints, BranchId, Cents, CustomerId};

pub type LoanId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoanType {
    Personal,
    Home,
    Vehicle,
    Education,
    Business,
    Gold,
}

impl LoanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoanType::Personal => "personal",
            LoanType::Home => "home",
            LoanType::Vehicle => "vehicle",
            LoanType::Education => "education",
            LoanType::Business => "business",
            LoanType::Gold => "gold",
        }
    }
}

impl std::str::FromStr for LoanType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "personal" => Ok(LoanType::Personal),
            "home" => Ok(LoanType::Home),
            "vehicle" => Ok(LoanType::Vehicle),
            "education" => Ok(LoanType::Education),
            "business" => Ok(LoanType::Business),
            "gold" => Ok(LoanType::Gold),
            other => Err(format!("unknown loan type '{}'", other)),
        }
    }
}

impl std::fmt::Display for LoanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanStatus {
    Draft,
    Submitted,
    UnderReview,
    Approved,
    Rejected,
    Disbursed,
    Active,
    Overdue,
    Closed,
    WrittenOff,
}

impl LoanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoanStatus::Draft => "draft",
            LoanStatus::Submitted => "submitted",
            LoanStatus::UnderReview => "under_review",
            LoanStatus::Approved => "approved",
            LoanStatus::Rejected => "rejected",
            LoanStatus::Disbursed => "disbursed",
            LoanStatus::Active => "active",
            LoanStatus::Overdue => "overdue",
            LoanStatus::Closed => "closed",
            LoanStatus::WrittenOff => "written_off",
        }
    }

    /// Edges of the loan lifecycle graph.
    pub fn can_transition_to(&self, next: LoanStatus) -> bool {
        use LoanStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (*self, next),
            (Draft, Submitted)
                | (Submitted, UnderReview)
                | (Submitted | UnderReview, Approved)
                | (Submitted | UnderReview, Rejected)
                | (Approved, Disbursed)
                | (Disbursed, Active)
                | (Active, Overdue)
                | (Overdue, Active)
                | (Active | Overdue, Closed)
                | (Active | Overdue, WrittenOff)
        )
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LoanStatus::Rejected | LoanStatus::Closed | LoanStatus::WrittenOff
        )
    }
}

impl std::str::FromStr for LoanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "draft" => Ok(LoanStatus::Draft),
            "submitted" => Ok(LoanStatus::Submitted),
            "under_review" => Ok(LoanStatus::UnderReview),
            "approved" => Ok(LoanStatus::Approved),
            "rejected" => Ok(LoanStatus::Rejected),
            "disbursed" => Ok(LoanStatus::Disbursed),
            "active" => Ok(LoanStatus::Active),
            "overdue" => Ok(LoanStatus::Overdue),
            "closed" => Ok(LoanStatus::Closed),
            "written_off" => Ok(LoanStatus::WrittenOff),
            other => Err(format!("unknown loan status '{}'", other)),
        }
    }
}

impl std::fmt::Display for LoanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Equated monthly installment for a fully amortizing loan:
/// `P·r·(1+r)^n / ((1+r)^n − 1)` with `r = annual_rate / 1200`.
/// A zero rate degenerates to straight division.
pub fn calculate_emi(principal: Cents, annual_rate: f64, tenure_months: u32) -> Cents {
    if principal <= 0 || tenure_months == 0 {
        return 0;
    }
    let p = principal as f64 / 100.0;
    let n = tenure_months as i32;
    let r = annual_rate / 1200.0;
    if r == 0.0 {
        return round_to_cents(p / n as f64);
    }
    let growth = (1.0 + r).powi(n);
    round_to_cents(p * r * growth / (growth - 1.0))
}

/// One month's interest on `principal_outstanding` at `annual_rate` percent.
pub fn monthly_interest(principal_outstanding: Cents, annual_rate: f64) -> Cents {
    round_to_cents(principal_outstanding as f64 / 100.0 * annual_rate / 1200.0)
}

/// Same day next month(s), clamped to the month's last day (Jan 31 -> Feb 28/29).
pub fn add_months(date: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    date.checked_add_months(Months::new(months))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// How a single repayment splits between interest and principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepaymentSplit {
    pub interest: Cents,
    pub principal: Cents,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Loan {
    pub id: LoanId,
    pub loan_number: String,
    pub customer_id: CustomerId,
    pub account_number: String,
    pub branch_id: BranchId,
    pub loan_type: LoanType,
    pub principal: Cents,
    pub sanctioned_amount: Option<Cents>,
    pub disbursed_amount: Cents,
    /// Annual rate in percent, e.g. 10.5
    pub interest_rate: f64,
    pub tenure_months: u32,
    pub emi: Cents,
    pub status: LoanStatus,
    pub outstanding: Cents,
    pub principal_outstanding: Cents,
    pub interest_outstanding: Cents,
    pub emis_paid: u32,
    pub emis_remaining: u32,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub first_emi_date: Option<DateTime<Utc>>,
    pub next_emi_date: Option<DateTime<Utc>>,
    pub overdue_days: i64,
    pub overdue_amount: Cents,
    pub penalty_amount: Cents,
    pub rejection_reason: Option<String>,
    pub purpose: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Loan {
    /// A freshly applied loan, already `submitted`, with its EMI computed.
    pub fn new(
        customer_id: CustomerId,
        account_number: String,
        branch_id: BranchId,
        loan_type: LoanType,
        principal: Cents,
        interest_rate: f64,
        tenure_months: u32,
    ) -> Self {
        let id = Uuid::new_v4();
        let now = Utc::now();
        Self {
            id,
            loan_number: format!("LN{:010}", id.as_u128() % 10_000_000_000),
            customer_id,
            account_number,
            branch_id,
            loan_type,
            principal,
            sanctioned_amount: None,
            disbursed_amount: 0,
            interest_rate,
            tenure_months,
            emi: calculate_emi(principal, interest_rate, tenure_months),
            status: LoanStatus::Submitted,
            outstanding: 0,
            principal_outstanding: 0,
            interest_outstanding: 0,
            emis_paid: 0,
            emis_remaining: tenure_months,
            start_date: None,
            end_date: None,
            first_emi_date: None,
            next_emi_date: None,
            overdue_days: 0,
            overdue_amount: 0,
            penalty_amount: 0,
            rejection_reason: None,
            purpose: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purpose = Some(purpose.into());
        self
    }

    /// Amount paid out on disbursement: the sanctioned amount if one was set.
    pub fn amount_to_disburse(&self) -> Cents {
        self.sanctioned_amount.unwrap_or(self.principal)
    }

    /// Record a sanction. The EMI is only recomputed when the sanctioned
    /// amount differs from what was applied for.
    pub fn sanction(&mut self, sanctioned_amount: Option<Cents>) {
        if let Some(amount) = sanctioned_amount {
            if amount != self.principal {
                self.emi = calculate_emi(amount, self.interest_rate, self.tenure_months);
            }
            self.sanctioned_amount = Some(amount);
        }
        self.status = LoanStatus::Approved;
    }

    /// Set up the repayment schedule for a payout made at `start`.
    pub fn mark_disbursed(&mut self, start: DateTime<Utc>) {
        let amount = self.amount_to_disburse();
        self.disbursed_amount = amount;
        self.outstanding = amount;
        self.principal_outstanding = amount;
        self.interest_outstanding = 0;
        self.emis_paid = 0;
        self.emis_remaining = self.tenure_months;
        self.start_date = Some(start);
        self.end_date = Some(add_months(start, self.tenure_months));
        self.first_emi_date = Some(add_months(start, 1));
        self.next_emi_date = self.first_emi_date;
        self.status = LoanStatus::Disbursed;
    }

    pub fn interest_due(&self) -> Cents {
        monthly_interest(self.principal_outstanding, self.interest_rate)
    }

    /// Largest repayment accepted right now: everything owed plus this
    /// month's interest.
    pub fn max_repayment(&self) -> Cents {
        self.outstanding + self.interest_due()
    }

    /// Apply one repayment of `amount`. Returns the split that was booked.
    pub fn apply_repayment(&mut self, amount: Cents) -> RepaymentSplit {
        let interest = self.interest_due();
        let principal = amount - interest;

        self.outstanding = (self.outstanding - amount).max(0);
        self.principal_outstanding = (self.principal_outstanding - principal).max(0);
        self.interest_outstanding = (self.interest_outstanding - interest).max(0);
        self.emis_paid += 1;
        self.emis_remaining = self.emis_remaining.saturating_sub(1);
        self.next_emi_date = self.next_emi_date.map(|d| add_months(d, 1));

        self.overdue_days = 0;
        self.overdue_amount = 0;
        self.penalty_amount = 0;
        self.status = LoanStatus::Active;

        if self.outstanding <= 0 || self.emis_remaining == 0 {
            self.settle();
        }

        RepaymentSplit { interest, principal }
    }

    /// Foreclosure payoff: outstanding plus a penalty on principal outstanding.
    pub fn foreclosure_amount(&self, penalty_rate: BasisPoints) -> Cents {
        self.outstanding + percent_of(self.principal_outstanding, penalty_rate)
    }

    /// Zero every balance and close the loan.
    pub fn settle(&mut self) {
        self.outstanding = 0;
        self.principal_outstanding = 0;
        self.interest_outstanding = 0;
        self.emis_remaining = 0;
        self.next_emi_date = None;
        self.status = LoanStatus::Closed;
    }

    /// Whole days the next EMI is late at `now`, if it is late at all.
    pub fn days_past_due(&self, now: DateTime<Utc>) -> Option<i64> {
        let due = self.next_emi_date?;
        if due >= now {
            return None;
        }
        Some((now - due).num_days())
    }

    /// Flag the loan overdue with penalty `emi × rate × days`.
    pub fn mark_overdue(&mut self, days: i64, penalty_rate_per_day: BasisPoints) {
        self.status = LoanStatus::Overdue;
        self.overdue_days = days;
        self.overdue_amount = self.emi;
        self.penalty_amount = percent_of(self.emi * days, penalty_rate_per_day);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::rupees;

    fn date(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(&format!("{}T10:00:00Z", s))
            .unwrap()
            .with_timezone(&Utc)
    }

    fn personal_loan(principal: Cents, rate: f64, months: u32) -> Loan {
        Loan::new(
            Uuid::new_v4(),
            "1000000000000001".into(),
            Uuid::new_v4(),
            LoanType::Personal,
            principal,
            rate,
            months,
        )
    }

    #[test]
    fn test_emi_reference_value() {
        assert_eq!(calculate_emi(rupees(100_000), 12.0, 12), 888_488);
    }

    #[test]
    fn test_emi_zero_rate() {
        assert_eq!(calculate_emi(rupees(120_000), 0.0, 12), rupees(10_000));
    }

    #[test]
    fn test_emi_degenerate_inputs() {
        assert_eq!(calculate_emi(0, 10.0, 12), 0);
        assert_eq!(calculate_emi(rupees(1_000), 10.0, 0), 0);
    }

    #[test]
    fn test_new_loan_is_submitted() {
        let loan = personal_loan(rupees(120_000), 10.5, 12);
        assert_eq!(loan.status, LoanStatus::Submitted);
        assert_eq!(loan.emi, calculate_emi(rupees(120_000), 10.5, 12));
        assert!(loan.loan_number.starts_with("LN"));
        assert_eq!(loan.loan_number.len(), 12);
    }

    #[test]
    fn test_sanction_recomputes_emi_only_when_amount_differs() {
        let mut loan = personal_loan(rupees(100_000), 12.0, 12);
        let original = loan.emi;
        loan.sanction(Some(rupees(100_000)));
        assert_eq!(loan.emi, original);

        let mut loan = personal_loan(rupees(100_000), 12.0, 12);
        loan.sanction(Some(rupees(80_000)));
        assert_eq!(loan.emi, calculate_emi(rupees(80_000), 12.0, 12));
        assert_eq!(loan.amount_to_disburse(), rupees(80_000));
        assert_eq!(loan.status, LoanStatus::Approved);
    }

    #[test]
    fn test_transition_graph() {
        assert!(LoanStatus::Submitted.can_transition_to(LoanStatus::Approved));
        assert!(LoanStatus::UnderReview.can_transition_to(LoanStatus::Rejected));
        assert!(LoanStatus::Overdue.can_transition_to(LoanStatus::Active));
        assert!(!LoanStatus::Approved.can_transition_to(LoanStatus::Active));
        assert!(!LoanStatus::Closed.can_transition_to(LoanStatus::Active));
        assert!(LoanStatus::Closed.is_terminal());
        assert!(!LoanStatus::Overdue.is_terminal());
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        use LoanStatus::*;
        let all = [
            Draft,
            Submitted,
            UnderReview,
            Approved,
            Rejected,
            Disbursed,
            Active,
            Overdue,
            Closed,
            WrittenOff,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            assert!(all.iter().all(|to| !from.can_transition_to(*to)), "{from}");
        }
    }

    #[test]
    fn test_disbursement_schedule_clamps_month_end() {
        let mut loan = personal_loan(rupees(100_000), 12.0, 12);
        loan.mark_disbursed(date("2024-01-31"));

        assert_eq!(loan.outstanding, rupees(100_000));
        assert_eq!(loan.principal_outstanding, rupees(100_000));
        assert_eq!(loan.first_emi_date, Some(date("2024-02-29")));
        assert_eq!(loan.end_date, Some(date("2025-01-31")));
        assert_eq!(loan.status, LoanStatus::Disbursed);
    }

    #[test]
    fn test_repayment_split() {
        let mut loan = personal_loan(rupees(100_000), 12.0, 12);
        loan.mark_disbursed(date("2024-01-15"));
        loan.status = LoanStatus::Active;

        let split = loan.apply_repayment(888_488);
        assert_eq!(split.interest, rupees(1_000));
        assert_eq!(split.principal, 888_488 - rupees(1_000));
        assert_eq!(loan.outstanding, rupees(100_000) - 888_488);
        assert_eq!(loan.principal_outstanding, rupees(100_000) - split.principal);
        assert_eq!(loan.emis_paid, 1);
        assert_eq!(loan.emis_remaining, 11);
        assert_eq!(loan.next_emi_date, Some(date("2024-03-15")));
    }

    #[test]
    fn test_full_repayment_closes() {
        let mut loan = personal_loan(rupees(10_000), 12.0, 12);
        loan.mark_disbursed(date("2024-01-15"));
        loan.status = LoanStatus::Active;

        loan.apply_repayment(loan.max_repayment());
        assert_eq!(loan.status, LoanStatus::Closed);
        assert_eq!(loan.outstanding, 0);
        assert_eq!(loan.emis_remaining, 0);
    }

    #[test]
    fn test_overdue_penalty() {
        let mut loan = personal_loan(rupees(100_000), 12.0, 12);
        loan.mark_disbursed(date("2024-01-15"));
        loan.status = LoanStatus::Active;

        let days = loan.days_past_due(date("2024-02-20")).unwrap();
        assert_eq!(days, 5);
        loan.mark_overdue(days, 200);
        assert_eq!(loan.status, LoanStatus::Overdue);
        assert_eq!(loan.overdue_amount, loan.emi);
        assert_eq!(loan.penalty_amount, percent_of(loan.emi * 5, 200));
        assert_eq!(loan.days_past_due(date("2024-02-10")), None);
    }

    #[test]
    fn test_repayment_clears_overdue() {
        let mut loan = personal_loan(rupees(100_000), 12.0, 12);
        loan.mark_disbursed(date("2024-01-15"));
        loan.mark_overdue(3, 200);

        loan.apply_repayment(loan.emi);
        assert_eq!(loan.status, LoanStatus::Active);
        assert_eq!(loan.penalty_amount, 0);
        assert_eq!(loan.overdue_days, 0);
    }

    #[test]
    fn test_foreclosure_amount() {
        let mut loan = personal_loan(rupees(100_000), 12.0, 12);
        loan.mark_disbursed(date("2024-01-15"));
        assert_eq!(loan.foreclosure_amount(200), rupees(102_000));
    }
}
