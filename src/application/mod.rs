// Application layer: use cases over the repository, shared by the CLI and
// any other client.

mod access;
mod envelope;
pub mod error;
mod ledger;
mod loans;

pub use access::*;
pub use envelope::*;
pub use error::*;
pub use ledger::*;
pub use loans::*;

use crate::config::Policy;
use crate::storage::Repository;

/// One open database with the three services wired over it.
#[derive(Clone)]
pub struct Bank {
    pub ledger: LedgerService,
    pub loans: LoanService,
    pub access: AccessService,
}

impl Bank {
    pub fn new(repo: Repository, policy: Policy) -> Self {
        Self {
            ledger: LedgerService::new(repo.clone(), policy.clone()),
            loans: LoanService::new(repo.clone(), policy),
            access: AccessService::new(repo),
        }
    }

    /// Create (or upgrade) the database at the given path and seed the
    /// built-in roles.
    pub async fn init(database_path: &str, policy: Policy) -> Result<Self, AppError> {
        let db_url = format!("sqlite:{}?mode=rwc", database_path);
        let repo = Repository::init(&db_url).await?;
        let bank = Self::new(repo, policy);
        bank.access.seed_system_roles().await?;
        Ok(bank)
    }

    /// Connect to an existing database.
    pub async fn connect(database_path: &str, policy: Policy) -> Result<Self, AppError> {
        let db_url = format!("sqlite:{}", database_path);
        let repo = Repository::connect(&db_url).await?;
        Ok(Self::new(repo, policy))
    }
}
