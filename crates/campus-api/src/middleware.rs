//! Request authentication. Tokens are verified here; the tenant is resolved
//! per request from the principal, its parent record, or the `x-tenant-id`
//! header set by the upstream proxy, in that order.

use axum::{
    RequestPartsExt,
    extract::FromRequestParts,
    http::request::Parts,
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use tracing::debug;

use campus_db::DomainError;
use campus_db::tenant::Principal;
use campus_gateway::dispatcher::Identity;
use campus_gateway::identify::{decode_claims, identify, principal};
use campus_types::{TenantId, UserId};

use crate::error::ApiError;
use crate::state::AppState;

const TENANT_ID_HEADER: &str = "x-tenant-id";

/// An authenticated caller with a resolved tenant.
#[derive(Debug, Clone)]
pub struct Caller {
    pub identity: Identity,
    pub principal: Principal,
}

impl Caller {
    pub fn tenant(&self) -> TenantId {
        self.identity.tenant_id
    }

    pub fn user_id(&self) -> UserId {
        self.identity.user_id()
    }
}

/// For list endpoints: a caller without tenant context sees an empty list
/// instead of an error. Bad credentials are still rejected.
#[derive(Debug, Clone)]
pub struct ListCaller(pub Option<Caller>);

async fn authenticate(parts: &mut Parts, state: &AppState) -> Result<Caller, ApiError> {
    let TypedHeader(Authorization(bearer)) = parts
        .extract::<TypedHeader<Authorization<Bearer>>>()
        .await
        .map_err(|_| ApiError::Unauthorized)?;

    let claims = decode_claims(&state.jwt_secret, bearer.token()).map_err(|e| {
        debug!("Rejected bearer token: {}", e);
        ApiError::Unauthorized
    })?;

    let request_tenant = match parts.headers.get(TENANT_ID_HEADER) {
        Some(value) => Some(
            value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<TenantId>().ok())
                .ok_or_else(|| ApiError::BadRequest("Invalid x-tenant-id header.".into()))?,
        ),
        None => None,
    };

    let principal = principal(&claims);
    let db = state.db().clone();
    let identity = match tokio::task::spawn_blocking(move || identify(&db, &claims, request_tenant)).await? {
        Ok(identity) => identity,
        // The token names a user that no longer exists in its tenant.
        Err(DomainError::NotFound) => return Err(ApiError::Unauthorized),
        Err(e) => return Err(e.into()),
    };
    Ok(Caller { identity, principal })
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        authenticate(parts, state).await
    }
}

impl FromRequestParts<AppState> for ListCaller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        match authenticate(parts, state).await {
            Ok(caller) => Ok(ListCaller(Some(caller))),
            Err(ApiError::Domain(DomainError::MissingTenantContext)) => Ok(ListCaller(None)),
            Err(e) => Err(e),
        }
    }
}
