use crate::permission::{self, Permissions};
use crate::principal::Principal;

/// How the permission bits of a policy are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionMode {
    Any,
    All,
}

/// How path scoping treats the principal's `basic_path`.
///
/// `Operation` admits the scope itself and strict descendants. `Navigation`
/// additionally admits ancestors, so a scoped key can walk down from `/` to
/// its subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathMode {
    Operation,
    Navigation,
}

/// Request facts the policy engine evaluates against.
#[derive(Debug, Clone, Default)]
pub struct AuthzContext {
    pub method: String,
    /// Target virtual paths resolved from the request (`?path=` or a
    /// protocol-parsed path). Empty when the policy has no path check.
    pub paths: Vec<String>,
}

impl AuthzContext {
    pub fn new(method: impl Into<String>, paths: Vec<String>) -> Self {
        Self {
            method: method.into(),
            paths,
        }
    }
}

pub type CustomCheck = fn(&Principal, &AuthzContext) -> bool;

/// A named, reusable authorization rule.
#[derive(Clone)]
pub struct Policy {
    pub id: &'static str,
    pub permissions: Permissions,
    pub mode: PermissionMode,
    pub require_auth: bool,
    pub admin_bypass: bool,
    pub path_check: bool,
    pub path_mode: PathMode,
    pub custom: Option<CustomCheck>,
    pub message: &'static str,
}

impl std::fmt::Debug for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Policy")
            .field("id", &self.id)
            .field("permissions", &format_args!("{:#x}", self.permissions))
            .field("path_check", &self.path_check)
            .finish()
    }
}

const fn base(id: &'static str, permissions: Permissions, message: &'static str) -> Policy {
    Policy {
        id,
        permissions,
        mode: PermissionMode::All,
        require_auth: false,
        admin_bypass: true,
        path_check: false,
        path_mode: PathMode::Operation,
        custom: None,
        message,
    }
}

const fn path_scoped(
    id: &'static str,
    permissions: Permissions,
    path_mode: PathMode,
    message: &'static str,
) -> Policy {
    let mut p = base(id, permissions, message);
    p.path_check = true;
    p.path_mode = path_mode;
    p
}

fn admin_only(principal: &Principal, _ctx: &AuthzContext) -> bool {
    principal.is_admin()
}

/// The fixed policy table. Ids are referenced by route handlers.
pub fn lookup(id: &str) -> Option<Policy> {
    let policy = match id {
        "auth.authenticated" => {
            let mut p = base("auth.authenticated", 0, "Authentication required");
            p.require_auth = true;
            p
        }
        "admin.all" => {
            let mut p = base("admin.all", 0, "Administrator access required");
            p.require_auth = true;
            p.custom = Some(admin_only);
            p
        }
        "fs.read" => path_scoped(
            "fs.read",
            permission::MOUNT_VIEW,
            PathMode::Navigation,
            "Mount view permission required",
        ),
        "fs.upload" => path_scoped(
            "fs.upload",
            permission::MOUNT_UPLOAD,
            PathMode::Operation,
            "Mount upload permission required",
        ),
        "fs.copy" => path_scoped(
            "fs.copy",
            permission::MOUNT_COPY,
            PathMode::Operation,
            "Mount copy permission required",
        ),
        "fs.rename" => path_scoped(
            "fs.rename",
            permission::MOUNT_RENAME,
            PathMode::Operation,
            "Mount rename permission required",
        ),
        "fs.delete" => path_scoped(
            "fs.delete",
            permission::MOUNT_DELETE,
            PathMode::Operation,
            "Mount delete permission required",
        ),
        "text.share" => base(
            "text.share",
            permission::TEXT_SHARE,
            "Text share permission required",
        ),
        "text.manage" => base(
            "text.manage",
            permission::TEXT_MANAGE,
            "Text manage permission required",
        ),
        "file.share" => base(
            "file.share",
            permission::FILE_SHARE,
            "File share permission required",
        ),
        "file.manage" => base(
            "file.manage",
            permission::FILE_MANAGE,
            "File manage permission required",
        ),
        "webdav.read" => path_scoped(
            "webdav.read",
            permission::WEBDAV_READ,
            PathMode::Navigation,
            "WebDAV read permission required",
        ),
        "webdav.manage" => path_scoped(
            "webdav.manage",
            permission::WEBDAV_MANAGE,
            PathMode::Operation,
            "WebDAV manage permission required",
        ),
        _ => return None,
    };
    Some(policy)
}
