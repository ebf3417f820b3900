mod account;
mod customer;
mod fees;
mod job;
mod ledger;
mod loan;
mod money;
pub mod rbac;
mod transaction;

pub use account::*;
pub use customer::*;
pub use fees::*;
pub use job::*;
pub use ledger::*;
pub use loan::*;
pub use money::*;
pub use rbac::{Action, Permission, PermissionId, Role, RoleId, User, UserId};
pub use transaction::*;
