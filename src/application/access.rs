use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::rbac::{is_allowed, RESOURCES};
use crate::domain::{Action, Permission, PermissionId, Role, User, UserId};
use crate::storage::Repository;

use super::AppError;

/// Permissions, roles, users and the permission check.
#[derive(Clone)]
pub struct AccessService {
    repo: Repository,
}

/// A role together with the permissions it grants
#[derive(Debug, Clone, Serialize)]
pub struct RoleDetails {
    pub role: Role,
    pub permissions: Vec<Permission>,
}

/// Built-in roles: (name, display name, priority, grants).
const SYSTEM_ROLES: &[(&str, &str, i64, &[(&str, Action)])] = &[
    (
        "super_admin",
        "Super Administrator",
        100,
        &[
            ("branches", Action::Manage),
            ("customers", Action::Manage),
            ("accounts", Action::Manage),
            ("transactions", Action::Manage),
            ("loans", Action::Manage),
            ("roles", Action::Manage),
            ("users", Action::Manage),
        ],
    ),
    (
        "branch_manager",
        "Branch Manager",
        50,
        &[
            ("branches", Action::Read),
            ("customers", Action::Manage),
            ("accounts", Action::Manage),
            ("transactions", Action::Manage),
            ("loans", Action::Manage),
            ("users", Action::Read),
        ],
    ),
    (
        "teller",
        "Teller",
        10,
        &[
            ("branches", Action::Read),
            ("customers", Action::Create),
            ("customers", Action::Read),
            ("accounts", Action::Create),
            ("accounts", Action::Read),
            ("transactions", Action::Create),
            ("transactions", Action::Read),
            ("loans", Action::Create),
            ("loans", Action::Read),
        ],
    ),
];

impl AccessService {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    // ========================
    // Permission check
    // ========================

    /// True iff the user's role is active and grants `action` (or `manage`)
    /// on `resource`. A user without a role is denied.
    pub async fn check_permission(
        &self,
        user_id: UserId,
        resource: &str,
        action: Action,
    ) -> Result<bool, AppError> {
        let user = self
            .repo
            .get_user(user_id)
            .await?
            .ok_or_else(|| AppError::UserNotFound(user_id.to_string()))?;
        self.evaluate(&user, resource, action).await
    }

    /// Fail with `PermissionDenied` unless `username` may perform the action.
    pub async fn authorize(
        &self,
        username: &str,
        resource: &str,
        action: Action,
    ) -> Result<User, AppError> {
        let user = self.get_user(username).await?;
        if self.evaluate(&user, resource, action).await? {
            Ok(user)
        } else {
            warn!(user = %username, resource, action = %action, "permission denied");
            Err(AppError::PermissionDenied)
        }
    }

    async fn evaluate(&self, user: &User, resource: &str, action: Action) -> Result<bool, AppError> {
        let Some(role_id) = user.role_id else {
            return Ok(false);
        };
        let Some(role) = self.repo.get_role(role_id).await? else {
            return Ok(false);
        };
        let permissions = self.repo.permissions_for_role(role.id).await?;
        let allowed = is_allowed(&role, &permissions, &resource.to_lowercase(), action);
        debug!(user = %user.username, role = %role.name, resource, action = %action, allowed, "permission check");
        Ok(allowed)
    }

    // ========================
    // Permissions
    // ========================

    pub async fn create_permission(
        &self,
        resource: &str,
        action: Action,
        description: Option<String>,
    ) -> Result<Permission, AppError> {
        if resource.trim().is_empty() {
            return Err(AppError::InvalidInput("Resource is required".to_string()));
        }
        if self.repo.find_permission(resource.trim(), action).await?.is_some() {
            return Err(AppError::AlreadyExists(format!(
                "Permission {}:{}",
                resource, action
            )));
        }

        let mut permission = Permission::new(resource.trim(), action);
        permission.description = description;
        self.repo.save_permission(&permission).await?;
        info!(permission = %permission, "permission created");
        Ok(permission)
    }

    pub async fn list_permissions(&self) -> Result<Vec<Permission>, AppError> {
        Ok(self.repo.list_permissions().await?)
    }

    async fn find_or_create_permission(
        &self,
        resource: &str,
        action: Action,
    ) -> Result<Permission, AppError> {
        match self.repo.find_permission(resource, action).await? {
            Some(permission) => Ok(permission),
            None => self.create_permission(resource, action, None).await,
        }
    }

    // ========================
    // Roles
    // ========================

    pub async fn create_role(
        &self,
        name: &str,
        display_name: &str,
        priority: i64,
        permissions: &[PermissionId],
    ) -> Result<Role, AppError> {
        if name.trim().is_empty() {
            return Err(AppError::InvalidInput("Role name is required".to_string()));
        }
        if self.repo.get_role_by_name(name).await?.is_some() {
            return Err(AppError::AlreadyExists(format!("Role {}", name)));
        }
        for id in permissions {
            if self.repo.get_permission(*id).await?.is_none() {
                return Err(AppError::PermissionNotFound(id.to_string()));
            }
        }

        let mut role = Role::new(name.trim(), display_name, priority);
        role.permissions = permissions.to_vec();
        self.repo.save_role(&role).await?;
        info!(role = %role.name, permissions = role.permissions.len(), "role created");
        Ok(role)
    }

    pub async fn get_role(&self, name: &str) -> Result<RoleDetails, AppError> {
        let role = self.load_role(name).await?;
        let permissions = self.repo.permissions_for_role(role.id).await?;
        Ok(RoleDetails { role, permissions })
    }

    pub async fn list_roles(&self) -> Result<Vec<Role>, AppError> {
        Ok(self.repo.list_roles().await?)
    }

    pub async fn grant_permission(
        &self,
        role_name: &str,
        permission_id: PermissionId,
    ) -> Result<Role, AppError> {
        let mut role = self.load_editable_role(role_name).await?;
        if self.repo.get_permission(permission_id).await?.is_none() {
            return Err(AppError::PermissionNotFound(permission_id.to_string()));
        }

        self.repo.add_role_permission(role.id, permission_id).await?;
        if !role.permissions.contains(&permission_id) {
            role.permissions.push(permission_id);
        }
        info!(role = %role_name, permission = %permission_id, "permission granted");
        Ok(role)
    }

    pub async fn revoke_permission(
        &self,
        role_name: &str,
        permission_id: PermissionId,
    ) -> Result<Role, AppError> {
        let mut role = self.load_editable_role(role_name).await?;
        self.repo.remove_role_permission(role.id, permission_id).await?;
        role.permissions.retain(|id| *id != permission_id);
        info!(role = %role_name, permission = %permission_id, "permission revoked");
        Ok(role)
    }

    pub async fn set_role_active(&self, role_name: &str, active: bool) -> Result<Role, AppError> {
        let mut role = self.load_editable_role(role_name).await?;
        self.repo.set_role_active(role.id, active).await?;
        role.is_active = active;
        info!(role = %role_name, active, "role updated");
        Ok(role)
    }

    /// Delete a custom role that no user still holds.
    pub async fn delete_role(&self, role_name: &str) -> Result<(), AppError> {
        let role = self.load_editable_role(role_name).await?;
        if self.repo.count_users_with_role(role.id).await? > 0 {
            return Err(AppError::RoleInUse(role.name));
        }
        self.repo.delete_role(role.id).await?;
        info!(role = %role_name, "role deleted");
        Ok(())
    }

    async fn load_role(&self, name: &str) -> Result<Role, AppError> {
        self.repo
            .get_role_by_name(name)
            .await?
            .ok_or_else(|| AppError::RoleNotFound(name.to_string()))
    }

    async fn load_editable_role(&self, name: &str) -> Result<Role, AppError> {
        let role = self.load_role(name).await?;
        if role.is_system {
            return Err(AppError::SystemRoleProtected(role.name));
        }
        Ok(role)
    }

    /// Create the built-in roles and the permissions they need. Existing
    /// roles are left untouched, so this is safe to run on every init.
    pub async fn seed_system_roles(&self) -> Result<Vec<Role>, AppError> {
        let mut created = Vec::new();
        for resource in RESOURCES {
            self.find_or_create_permission(resource, Action::Manage).await?;
        }

        for (name, display_name, priority, grants) in SYSTEM_ROLES {
            if self.repo.get_role_by_name(name).await?.is_some() {
                continue;
            }
            let mut role = Role::new(*name, *display_name, *priority).system();
            for (resource, action) in *grants {
                let permission = self.find_or_create_permission(resource, *action).await?;
                role.permissions.push(permission.id);
            }
            self.repo.save_role(&role).await?;
            created.push(role);
        }

        if !created.is_empty() {
            info!(roles = created.len(), "system roles seeded");
        }
        Ok(created)
    }

    // ========================
    // Users
    // ========================

    pub async fn create_user(
        &self,
        username: &str,
        role_name: Option<&str>,
    ) -> Result<User, AppError> {
        if username.trim().is_empty() {
            return Err(AppError::InvalidInput("Username is required".to_string()));
        }
        if self.repo.get_user_by_username(username).await?.is_some() {
            return Err(AppError::AlreadyExists(format!("User {}", username)));
        }

        let mut user = User::new(username.trim());
        if let Some(role_name) = role_name {
            user.role_id = Some(self.load_role(role_name).await?.id);
        }
        self.repo.save_user(&user).await?;
        info!(user = %user.username, "user created");
        Ok(user)
    }

    pub async fn get_user(&self, username: &str) -> Result<User, AppError> {
        self.repo
            .get_user_by_username(username)
            .await?
            .ok_or_else(|| AppError::UserNotFound(username.to_string()))
    }

    /// Give `username` a role, or strip it with `None`.
    pub async fn assign_role(
        &self,
        username: &str,
        role_name: Option<&str>,
    ) -> Result<User, AppError> {
        let mut user = self.get_user(username).await?;
        let role_id = match role_name {
            Some(name) => Some(self.load_role(name).await?.id),
            None => None,
        };
        self.repo.set_user_role(user.id, role_id).await?;
        user.role_id = role_id;
        info!(user = %username, role = role_name.unwrap_or("-"), "role assigned");
        Ok(user)
    }
}
