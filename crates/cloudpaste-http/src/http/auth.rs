//! Principal extraction from request credentials.
//!
//! Accepted forms: `Authorization: Bearer <adminToken>`,
//! `Authorization: ApiKey <key>`, `Authorization: Basic <user:pass>`
//! (admin credentials, or the api key doubled into both fields) and the
//! `X-Custom-Auth-Key: <key>` header. Requests without any credential
//! resolve to the guest principal; policies decide what guests may do.

use axum::http::HeaderMap;
use base64::Engine as _;
use sqlx::SqlitePool;

use cloudpaste_core::{AppError, Principal};
use cloudpaste_storage::{admins_repo, api_keys_repo, password};

#[derive(Debug)]
pub struct Authenticated {
    pub principal: Principal,
    /// Present for admin-token sessions; used by logout.
    pub admin_token: Option<String>,
}

impl Authenticated {
    fn guest() -> Self {
        Self {
            principal: Principal::guest(),
            admin_token: None,
        }
    }
}

async fn admin_from_token(db: &SqlitePool, token: &str) -> Result<Option<Principal>, AppError> {
    let admin = admins_repo::get_admin_by_token(db, token)
        .await
        .map_err(AppError::Internal)?;
    Ok(admin.map(|a| Principal::admin(a.id, a.username)))
}

async fn key_principal(db: &SqlitePool, secret: &str) -> Result<Option<Principal>, AppError> {
    let key = api_keys_repo::authenticate(db, secret)
        .await
        .map_err(AppError::Internal)?;
    Ok(key.map(|k| Principal::api_key(k.id, k.name, k.role, k.permissions, k.basic_path)))
}

async fn basic_principal(db: &SqlitePool, payload: &str) -> Result<Option<Principal>, AppError> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|_| AppError::Unauthenticated("malformed Basic credentials".to_string()))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| AppError::Unauthenticated("malformed Basic credentials".to_string()))?;
    let Some((user, pass)) = decoded.split_once(':') else {
        return Err(AppError::Unauthenticated(
            "malformed Basic credentials".to_string(),
        ));
    };

    // Admin username/password first.
    if let Some(admin) = admins_repo::get_admin_by_username(db, user)
        .await
        .map_err(AppError::Internal)?
        && password::verify_password(&admin.password_hash, pass).unwrap_or(false)
    {
        return Ok(Some(Principal::admin(admin.id, admin.username)));
    }

    // An api key may be supplied as both fields.
    if user == pass
        && let Some(principal) = key_principal(db, user).await?
    {
        return Ok(Some(principal));
    }

    Ok(None)
}

pub async fn authenticate(db: &SqlitePool, headers: &HeaderMap) -> Result<Authenticated, AppError> {
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
        let value = value
            .to_str()
            .map_err(|_| AppError::Unauthenticated("malformed Authorization header".to_string()))?;

        if let Some(token) = value.strip_prefix("Bearer ") {
            let token = token.trim();
            return match admin_from_token(db, token).await? {
                Some(principal) => Ok(Authenticated {
                    principal,
                    admin_token: Some(token.to_string()),
                }),
                None => Err(AppError::Unauthenticated(
                    "invalid or expired admin token".to_string(),
                )),
            };
        }

        if let Some(secret) = value.strip_prefix("ApiKey ") {
            return match key_principal(db, secret.trim()).await? {
                Some(principal) => Ok(Authenticated {
                    principal,
                    admin_token: None,
                }),
                None => Err(AppError::Unauthenticated("invalid api key".to_string())),
            };
        }

        if let Some(payload) = value.strip_prefix("Basic ") {
            return match basic_principal(db, payload.trim()).await? {
                Some(principal) => Ok(Authenticated {
                    principal,
                    admin_token: None,
                }),
                None => Err(AppError::Unauthenticated(
                    "invalid Basic credentials".to_string(),
                )),
            };
        }

        return Err(AppError::Unauthenticated(
            "unsupported Authorization scheme".to_string(),
        ));
    }

    if let Some(value) = headers.get("x-custom-auth-key") {
        let secret = value
            .to_str()
            .map_err(|_| AppError::Unauthenticated("malformed auth key header".to_string()))?;
        return match key_principal(db, secret.trim()).await? {
            Some(principal) => Ok(Authenticated {
                principal,
                admin_token: None,
            }),
            None => Err(AppError::Unauthenticated("invalid api key".to_string())),
        };
    }

    Ok(Authenticated::guest())
}
