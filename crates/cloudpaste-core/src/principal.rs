use serde::{Deserialize, Serialize};

use crate::permission::{self, Permissions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    Admin,
    ApiKey,
    Guest,
}

impl PrincipalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalKind::Admin => "admin",
            PrincipalKind::ApiKey => "apikey",
            PrincipalKind::Guest => "guest",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Guest,
    General,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Guest => "GUEST",
            Role::General => "GENERAL",
            Role::Admin => "ADMIN",
        }
    }

    /// Permission preset granted to keys created with this role.
    pub fn preset(&self) -> Permissions {
        match self {
            Role::Guest => permission::MOUNT_VIEW,
            Role::General => {
                permission::TEXT_SHARE
                    | permission::FILE_SHARE
                    | permission::TEXT_MANAGE
                    | permission::FILE_MANAGE
                    | permission::MOUNT_VIEW
                    | permission::MOUNT_UPLOAD
                    | permission::WEBDAV_READ
            }
            Role::Admin => permission::ALL,
        }
    }
}

impl std::str::FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GUEST" => Ok(Role::Guest),
            "GENERAL" => Ok(Role::General),
            "ADMIN" => Ok(Role::Admin),
            other => Err(anyhow::anyhow!("unknown role: {other}")),
        }
    }
}

/// Resolved caller identity attached to every request.
#[derive(Debug, Clone)]
pub struct Principal {
    pub kind: PrincipalKind,
    /// Admin or api-key row id. None for guests.
    pub id: Option<String>,
    /// Display name (admin username or key name).
    pub name: Option<String>,
    pub role: Role,
    pub authorities: Permissions,
    /// Virtual path prefix this principal is scoped to. "/" means unscoped.
    pub basic_path: String,
}

impl Principal {
    pub fn admin(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: PrincipalKind::Admin,
            id: Some(id.into()),
            name: Some(name.into()),
            role: Role::Admin,
            authorities: permission::ALL,
            basic_path: "/".to_string(),
        }
    }

    pub fn api_key(
        id: impl Into<String>,
        name: impl Into<String>,
        role: Role,
        authorities: Permissions,
        basic_path: impl Into<String>,
    ) -> Self {
        Self {
            kind: PrincipalKind::ApiKey,
            id: Some(id.into()),
            name: Some(name.into()),
            role,
            authorities,
            basic_path: basic_path.into(),
        }
    }

    pub fn guest() -> Self {
        Self {
            kind: PrincipalKind::Guest,
            id: None,
            name: None,
            role: Role::Guest,
            authorities: Role::Guest.preset(),
            basic_path: "/".to_string(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.kind == PrincipalKind::Admin
    }

    pub fn is_guest(&self) -> bool {
        self.kind == PrincipalKind::Guest
    }

    /// `"<kind>:<id>"` owner tag stored on created artifacts.
    pub fn created_by(&self) -> Option<String> {
        let id = self.id.as_deref()?;
        Some(format!("{}:{}", self.kind.as_str(), id))
    }
}
