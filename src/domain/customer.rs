use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type CustomerId = Uuid;
pub type BranchId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KycStatus {
    Pending,
    Verified,
    Rejected,
}

impl KycStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KycStatus::Pending => "pending",
            KycStatus::Verified => "verified",
            KycStatus::Rejected => "rejected",
        }
    }
}

impl std::str::FromStr for KycStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(KycStatus::Pending),
            "verified" => Ok(KycStatus::Verified),
            "rejected" => Ok(KycStatus::Rejected),
            other => Err(format!("unknown KYC status '{}'", other)),
        }
    }
}

impl std::fmt::Display for KycStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: CustomerId,
    pub full_name: String,
    pub email: Option<String>,
    pub kyc_status: KycStatus,
    pub created_at: DateTime<Utc>,
}

impl Customer {
    pub fn new(full_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            full_name: full_name.into(),
            email: None,
            kyc_status: KycStatus::Pending,
            created_at: Utc::now(),
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Accounts and loans may only be opened for KYC-verified customers.
    pub fn is_kyc_verified(&self) -> bool {
        self.kyc_status == KycStatus::Verified
    }
}

/// A bank branch, identified externally by its IFSC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    pub name: String,
    pub ifsc: String,
    pub created_at: DateTime<Utc>,
}

impl Branch {
    pub fn new(name: impl Into<String>, ifsc: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            ifsc: ifsc.into().to_uppercase(),
            created_at: Utc::now(),
        }
    }
}

/// IFSC layout: four letters (bank), a literal zero, six alphanumerics (branch).
pub fn is_valid_ifsc(ifsc: &str) -> bool {
    let bytes = ifsc.as_bytes();
    bytes.len() == 11
        && bytes[..4].iter().all(u8::is_ascii_alphabetic)
        && bytes[4] == b'0'
        && bytes[5..].iter().all(u8::is_ascii_alphanumeric)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_customer_is_pending() {
        let customer = Customer::new("Asha Rao").with_email("asha@example.com");
        assert_eq!(customer.kyc_status, KycStatus::Pending);
        assert!(!customer.is_kyc_verified());
        assert_eq!(customer.email.as_deref(), Some("asha@example.com"));
    }

    #[test]
    fn test_kyc_status_parse() {
        assert_eq!("Verified".parse::<KycStatus>(), Ok(KycStatus::Verified));
        assert!("unknown".parse::<KycStatus>().is_err());
    }

    #[test]
    fn test_ifsc_validation() {
        assert!(is_valid_ifsc("SBIN0001234"));
        assert!(is_valid_ifsc("HDFC0ABC123"));
        assert!(!is_valid_ifsc("SBIN1001234"));
        assert!(!is_valid_ifsc("SBIN000123"));
        assert!(!is_valid_ifsc("12340001234"));
    }

    #[test]
    fn test_branch_uppercases_ifsc() {
        let branch = Branch::new("Indiranagar", "sbin0001234");
        assert_eq!(branch.ifsc, "SBIN0001234");
    }
}
