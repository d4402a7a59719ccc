use tracing::info;

use crate::error::{AppError, DenyReason};
use crate::path;
use crate::permission;
use crate::policy::{AuthzContext, PathMode, PermissionMode, Policy};
use crate::principal::Principal;

/// Outcome of a policy evaluation, audit-logged regardless of result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

/// Evaluate a policy for a principal. Every call emits a structured audit
/// record; denials map onto the 401/403 failure taxonomy.
pub fn authorize(
    principal: &Principal,
    policy: &Policy,
    ctx: &AuthzContext,
) -> Result<(), AppError> {
    let decision = evaluate(principal, policy, ctx);
    audit(principal, policy, ctx, decision);

    match decision {
        Decision::Allow => Ok(()),
        Decision::Deny(DenyReason::Unauthenticated) => {
            Err(AppError::Unauthenticated(policy.message.to_string()))
        }
        Decision::Deny(reason) => Err(AppError::forbidden(reason, policy.message)),
    }
}

fn evaluate(principal: &Principal, policy: &Policy, ctx: &AuthzContext) -> Decision {
    if policy.require_auth && principal.is_guest() {
        return Decision::Deny(DenyReason::Unauthenticated);
    }

    if policy.admin_bypass && principal.is_admin() {
        return Decision::Allow;
    }

    let bits_ok = match policy.mode {
        PermissionMode::All => permission::has(principal.authorities, policy.permissions),
        PermissionMode::Any => {
            policy.permissions == 0 || permission::has_any(principal.authorities, policy.permissions)
        }
    };
    if !bits_ok {
        return Decision::Deny(DenyReason::MissingPermission);
    }

    if policy.path_check
        && !ctx
            .paths
            .iter()
            .all(|p| path_scope_satisfied(&principal.basic_path, p, policy.path_mode))
    {
        return Decision::Deny(DenyReason::PathScope);
    }

    if let Some(custom) = policy.custom
        && !custom(principal, ctx)
    {
        return Decision::Deny(DenyReason::CustomCheck);
    }

    Decision::Allow
}

/// `Operation`: target must be the scope itself or a strict descendant.
/// `Navigation`: ancestors of the scope are additionally admitted.
pub fn path_scope_satisfied(basic_path: &str, target: &str, mode: PathMode) -> bool {
    if path::is_ancestor_or_equal(basic_path, target) {
        return true;
    }
    match mode {
        PathMode::Operation => false,
        PathMode::Navigation => path::is_strict_ancestor(target, basic_path),
    }
}

fn audit(principal: &Principal, policy: &Policy, ctx: &AuthzContext, decision: Decision) {
    let (decision_str, reason) = match decision {
        Decision::Allow => ("allow", None),
        Decision::Deny(reason) => ("deny", Some(reason.as_str())),
    };
    let status: u16 = match decision {
        Decision::Allow => 200,
        Decision::Deny(DenyReason::Unauthenticated) => 401,
        Decision::Deny(_) => 403,
    };
    info!(
        target: "cloudpaste::audit",
        decision = decision_str,
        reason = reason.unwrap_or("-"),
        policy = policy.id,
        principal = principal.kind.as_str(),
        principal_id = principal.id.as_deref().unwrap_or("-"),
        method = %ctx.method,
        path = ctx.paths.first().map(String::as_str).unwrap_or("-"),
        status,
        timestamp = time::OffsetDateTime::now_utc().unix_timestamp(),
        "authorization decision"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::{MOUNT_UPLOAD, MOUNT_VIEW};
    use crate::policy;
    use crate::principal::Role;

    fn team_key() -> Principal {
        Principal::api_key(
            "key1",
            "team key",
            Role::General,
            MOUNT_VIEW | MOUNT_UPLOAD,
            "/team",
        )
    }

    fn ctx(path: &str) -> AuthzContext {
        AuthzContext::new("PUT", vec![path.to_string()])
    }

    #[test]
    fn upload_inside_scope_allowed() {
        let p = policy::lookup("fs.upload").unwrap();
        assert!(authorize(&team_key(), &p, &ctx("/team/docs")).is_ok());
    }

    #[test]
    fn upload_outside_scope_denied_with_path_scope() {
        let p = policy::lookup("fs.upload").unwrap();
        let err = authorize(&team_key(), &p, &ctx("/other")).unwrap_err();
        match err {
            AppError::Forbidden { reason, .. } => assert_eq!(reason, DenyReason::PathScope),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn navigation_mode_admits_scope_and_ancestors() {
        let read = policy::lookup("fs.read").unwrap();
        assert!(authorize(&team_key(), &read, &ctx("/team")).is_ok());
        // "/" is an ancestor of the scope: listable for navigation...
        assert!(authorize(&team_key(), &read, &ctx("/")).is_ok());
        // ...but not a valid operation target.
        let upload = policy::lookup("fs.upload").unwrap();
        assert!(authorize(&team_key(), &upload, &ctx("/")).is_err());
    }

    #[test]
    fn guest_rejected_when_auth_required() {
        let p = policy::lookup("auth.authenticated").unwrap();
        let err = authorize(&Principal::guest(), &p, &AuthzContext::default()).unwrap_err();
        assert!(matches!(err, AppError::Unauthenticated(_)));
    }

    #[test]
    fn admin_bypasses_path_and_bits() {
        let p = policy::lookup("fs.delete").unwrap();
        let admin = Principal::admin("a1", "root");
        assert!(authorize(&admin, &p, &ctx("/anywhere")).is_ok());
    }

    #[test]
    fn missing_permission_reported() {
        let p = policy::lookup("fs.delete").unwrap();
        let err = authorize(&team_key(), &p, &ctx("/team/docs")).unwrap_err();
        match err {
            AppError::Forbidden { reason, .. } => {
                assert_eq!(reason, DenyReason::MissingPermission)
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn admin_only_custom_check() {
        let p = policy::lookup("admin.all").unwrap();
        let key = team_key();
        let err = authorize(&key, &p, &AuthzContext::default()).unwrap_err();
        match err {
            AppError::Forbidden { reason, .. } => assert_eq!(reason, DenyReason::CustomCheck),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
