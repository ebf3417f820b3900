mod common;

use anyhow::Result;
use common::test_bank;
use khata::application::AppError;
use khata::domain::Action;

#[tokio::test]
async fn test_system_roles_are_seeded_once() -> Result<()> {
    let (bank, _temp) = test_bank().await?;

    let roles = bank.access.list_roles().await?;
    let names: Vec<&str> = roles.iter().map(|r| r.name.as_str()).collect();
    assert!(names.contains(&"super_admin"));
    assert!(names.contains(&"branch_manager"));
    assert!(names.contains(&"teller"));
    assert!(roles.iter().all(|r| r.is_system && r.is_active));

    // Seeding again creates nothing new
    assert!(bank.access.seed_system_roles().await?.is_empty());
    assert_eq!(bank.access.list_roles().await?.len(), roles.len());

    Ok(())
}

#[tokio::test]
async fn test_manage_grants_every_action() -> Result<()> {
    let (bank, _temp) = test_bank().await?;
    let admin = bank.access.create_user("admin", Some("super_admin")).await?;
    let teller = bank.access.create_user("teller1", Some("teller")).await?;

    for action in [Action::Create, Action::Read, Action::Delete, Action::Approve] {
        assert!(bank.access.check_permission(admin.id, "loans", action).await?);
    }

    assert!(bank.access.check_permission(teller.id, "loans", Action::Create).await?);
    assert!(!bank.access.check_permission(teller.id, "loans", Action::Approve).await?);
    assert!(!bank.access.check_permission(teller.id, "roles", Action::Read).await?);

    let err = bank
        .access
        .authorize("teller1", "loans", Action::Disburse)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PermissionDenied));
    assert_eq!(err.status_code(), 403);

    let user = bank.access.authorize("admin", "roles", Action::Delete).await?;
    assert_eq!(user.id, admin.id);

    Ok(())
}

#[tokio::test]
async fn test_user_without_role_is_denied() -> Result<()> {
    let (bank, _temp) = test_bank().await?;
    let user = bank.access.create_user("visitor", None).await?;

    assert!(!bank.access.check_permission(user.id, "accounts", Action::Read).await?);

    let err = bank
        .access
        .authorize("nobody", "accounts", Action::Read)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::UserNotFound(_)));

    Ok(())
}

#[tokio::test]
async fn test_custom_role_grant_revoke_and_deactivate() -> Result<()> {
    let (bank, _temp) = test_bank().await?;

    let approve = bank
        .access
        .create_permission("loans", Action::Approve, Some("Sanction loans".into()))
        .await?;
    let err = bank
        .access
        .create_permission("loans", Action::Approve, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::AlreadyExists(_)));

    bank.access
        .create_role("credit_officer", "Credit Officer", 30, &[])
        .await?;
    let officer = bank
        .access
        .create_user("priya", Some("credit_officer"))
        .await?;
    assert!(!bank.access.check_permission(officer.id, "loans", Action::Approve).await?);

    let role = bank.access.grant_permission("credit_officer", approve.id).await?;
    assert_eq!(role.permissions, vec![approve.id]);
    assert!(bank.access.check_permission(officer.id, "LOANS", Action::Approve).await?);

    let details = bank.access.get_role("credit_officer").await?;
    assert_eq!(details.permissions.len(), 1);
    assert_eq!(details.permissions[0].resource, "loans");

    bank.access.set_role_active("credit_officer", false).await?;
    assert!(!bank.access.check_permission(officer.id, "loans", Action::Approve).await?);

    bank.access.set_role_active("credit_officer", true).await?;
    bank.access.revoke_permission("credit_officer", approve.id).await?;
    assert!(!bank.access.check_permission(officer.id, "loans", Action::Approve).await?);

    Ok(())
}

#[tokio::test]
async fn test_system_roles_are_protected() -> Result<()> {
    let (bank, _temp) = test_bank().await?;
    let permission = bank
        .access
        .create_permission("reports", Action::Read, None)
        .await?;

    let err = bank
        .access
        .grant_permission("teller", permission.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::SystemRoleProtected(_)));

    let err = bank
        .access
        .set_role_active("super_admin", false)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::SystemRoleProtected(_)));

    let err = bank.access.delete_role("teller").await.unwrap_err();
    assert!(matches!(err, AppError::SystemRoleProtected(_)));

    Ok(())
}

#[tokio::test]
async fn test_role_in_use_cannot_be_deleted() -> Result<()> {
    let (bank, _temp) = test_bank().await?;
    bank.access.create_role("auditor", "Auditor", 5, &[]).await?;
    bank.access.create_user("auditor1", Some("auditor")).await?;

    let err = bank.access.delete_role("auditor").await.unwrap_err();
    assert!(matches!(err, AppError::RoleInUse(_)));

    bank.access.assign_role("auditor1", None).await?;
    bank.access.delete_role("auditor").await?;

    let err = bank.access.get_role("auditor").await.unwrap_err();
    assert!(matches!(err, AppError::RoleNotFound(_)));

    Ok(())
}
