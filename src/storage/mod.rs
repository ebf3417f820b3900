mod repository;

pub use repository::*;

/// SQL migration for branches, customers, accounts and transactions
pub const MIGRATION_001_INITIAL: &str = include_str!("migrations/001_initial.sql");

/// SQL migration for loans and scheduled jobs
pub const MIGRATION_002_LOANS: &str = include_str!("migrations/002_loans.sql");

/// SQL migration for roles, permissions and users
pub const MIGRATION_003_RBAC: &str = include_str!("migrations/003_rbac.sql");
