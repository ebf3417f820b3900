use serde::{Deserialize, Serialize};

use super::{percent_of, rupees, BasisPoints, Cents};

/// GST levied on transfer charges.
pub const GST_RATE_BPS: BasisPoints = 1_800;

/// Transfer rails an account holder can send money over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferRail {
    /// Book transfer between two accounts of this bank
    Transfer,
    Neft,
    Rtgs,
    Imps,
    Upi,
}

impl TransferRail {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferRail::Transfer => "transfer",
            TransferRail::Neft => "neft",
            TransferRail::Rtgs => "rtgs",
            TransferRail::Imps => "imps",
            TransferRail::Upi => "upi",
        }
    }

    /// Interbank rails get an external reference number (UTR) on posting.
    pub fn issues_reference(&self) -> bool {
        matches!(
            self,
            TransferRail::Neft | TransferRail::Rtgs | TransferRail::Imps
        )
    }

    /// Flat charge before GST for a transfer of `amount`.
    pub fn charge(&self, amount: Cents) -> Cents {
        match self {
            TransferRail::Neft => match amount {
                a if a <= rupees(10_000) => 250,
                a if a <= rupees(100_000) => rupees(5),
                a if a <= rupees(200_000) => rupees(15),
                _ => rupees(25),
            },
            TransferRail::Rtgs => match amount {
                a if a <= rupees(200_000) => 0,
                a if a <= rupees(500_000) => rupees(30),
                _ => rupees(55),
            },
            TransferRail::Imps => match amount {
                a if a <= rupees(1_000) => rupees(5),
                a if a <= rupees(10_000) => rupees(5),
                a if a <= rupees(100_000) => rupees(15),
                _ => rupees(25),
            },
            TransferRail::Upi | TransferRail::Transfer => 0,
        }
    }

    /// Inclusive (min, max) amount accepted on this rail.
    pub fn bounds(&self) -> (Option<Cents>, Option<Cents>) {
        match self {
            TransferRail::Upi => (None, Some(rupees(100_000))),
            TransferRail::Imps => (None, Some(rupees(500_000))),
            TransferRail::Rtgs => (Some(rupees(200_000)), None),
            TransferRail::Neft | TransferRail::Transfer => (None, None),
        }
    }

    pub fn check_bounds(&self, amount: Cents) -> Result<(), RailLimit> {
        let (min, max) = self.bounds();
        if let Some(min) = min {
            if amount < min {
                return Err(RailLimit::BelowMinimum { minimum: min });
            }
        }
        if let Some(max) = max {
            if amount > max {
                return Err(RailLimit::AboveMaximum { maximum: max });
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for TransferRail {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "transfer" | "internal" => Ok(TransferRail::Transfer),
            "neft" => Ok(TransferRail::Neft),
            "rtgs" => Ok(TransferRail::Rtgs),
            "imps" => Ok(TransferRail::Imps),
            "upi" => Ok(TransferRail::Upi),
            other => Err(format!("unknown transfer type '{}'", other)),
        }
    }
}

impl std::fmt::Display for TransferRail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RailLimit {
    BelowMinimum { minimum: Cents },
    AboveMaximum { maximum: Cents },
}

/// Charges owed by the sender on top of the transferred amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeQuote {
    pub rail: TransferRail,
    pub amount: Cents,
    pub charges: Cents,
    pub gst: Cents,
    /// charges + gst
    pub fee_total: Cents,
    /// amount + charges + gst, the sum debited from the sender
    pub total_debit: Cents,
}

impl FeeQuote {
    /// Quote at the standard GST rate. `None` if the total debit does not
    /// fit in `Cents`.
    pub fn new(rail: TransferRail, amount: Cents) -> Option<Self> {
        Self::with_gst_rate(rail, amount, GST_RATE_BPS)
    }

    pub fn with_gst_rate(
        rail: TransferRail,
        amount: Cents,
        gst_rate: BasisPoints,
    ) -> Option<Self> {
        let charges = rail.charge(amount);
        let gst = percent_of(charges, gst_rate);
        let fee_total = charges.checked_add(gst)?;
        Some(Self {
            rail,
            amount,
            charges,
            gst,
            fee_total,
            total_debit: amount.checked_add(fee_total)?,
        })
    }
}
