//! Token verification shared by the HTTP layer and the WebSocket handshake.
//! Tokens are issued elsewhere; this only checks them.

use campus_db::tenant::Principal;
use campus_db::{Database, DomainError};
use campus_types::TenantId;
use campus_types::api::Claims;
use jsonwebtoken::{DecodingKey, Validation, decode};
use thiserror::Error;

use crate::dispatcher::Identity;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

pub fn decode_claims(secret: &str, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(data.claims)
}

pub fn principal(claims: &Claims) -> Principal {
    Principal {
        user_id: claims.sub,
        tenant_id: claims.tenant_id,
    }
}

/// Resolve the caller's tenant and public identity. Blocking; call from
/// `spawn_blocking` in async code.
pub fn identify(db: &Database, claims: &Claims, request_tenant: Option<TenantId>) -> Result<Identity, DomainError> {
    let tenant_id = db.resolve_tenant(&principal(claims), request_tenant)?;
    let user = db.user_summary(tenant_id, claims.sub)?;
    Ok(Identity { user, tenant_id })
}

pub fn authenticate(
    db: &Database,
    secret: &str,
    token: &str,
    request_tenant: Option<TenantId>,
) -> Result<Identity, AuthError> {
    let claims = decode_claims(secret, token)?;
    Ok(identify(db, &claims, request_tenant)?)
}
