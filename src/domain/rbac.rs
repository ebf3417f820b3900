use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type PermissionId = Uuid;
pub type RoleId = Uuid;
pub type UserId = Uuid;

/// Resources the banking back-office guards.
pub const RESOURCES: &[&str] = &[
    "branches",
    "customers",
    "accounts",
    "transactions",
    "loans",
    "roles",
    "users",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Read,
    Update,
    Delete,
    Approve,
    Disburse,
    /// Wildcard: satisfies every action on the same resource
    Manage,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Read => "read",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Approve => "approve",
            Action::Disburse => "disburse",
            Action::Manage => "manage",
        }
    }
}

impl std::str::FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "create" => Ok(Action::Create),
            "read" => Ok(Action::Read),
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            "approve" => Ok(Action::Approve),
            "disburse" => Ok(Action::Disburse),
            "manage" => Ok(Action::Manage),
            other => Err(format!("unknown action '{}'", other)),
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A (resource, action) grant. Unique per pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub id: PermissionId,
    pub resource: String,
    pub action: Action,
    pub description: Option<String>,
}

impl Permission {
    pub fn new(resource: impl Into<String>, action: Action) -> Self {
        Self {
            id: Uuid::new_v4(),
            resource: resource.into().to_lowercase(),
            action,
            description: None,
        }
    }

    pub fn grants(&self, resource: &str, action: Action) -> bool {
        self.resource == resource && (self.action == action || self.action == Action::Manage)
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.resource, self.action)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub display_name: String,
    /// Display ordering only; never consulted by the permission check
    pub priority: i64,
    pub is_system: bool,
    pub is_active: bool,
    pub permissions: Vec<PermissionId>,
    pub created_at: DateTime<Utc>,
}

impl Role {
    pub fn new(name: impl Into<String>, display_name: impl Into<String>, priority: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            display_name: display_name.into(),
            priority,
            is_system: false,
            is_active: true,
            permissions: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn system(mut self) -> Self {
        self.is_system = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub role_id: Option<RoleId>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.into(),
            role_id: None,
            created_at: Utc::now(),
        }
    }
}

/// Allow-list evaluation: an active role whose permission set contains
/// (resource, action) or (resource, manage). There are no deny rules and no
/// role hierarchy.
pub fn is_allowed(role: &Role, permissions: &[Permission], resource: &str, action: Action) -> bool {
    role.is_active
        && permissions
            .iter()
            .filter(|p| role.permissions.contains(&p.id))
            .any(|p| p.grants(resource, action))
}
