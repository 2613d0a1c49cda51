//! Tenant context resolution.
//!
//! Every store call takes an explicit `TenantId`; this module is the only
//! place that derives one from an authenticated principal. Failing to
//! resolve is a security event: the caller is denied, never served unscoped.

use campus_types::{TenantId, UserId};
use tracing::warn;

use crate::users::{effective_tenant, query_user};
use crate::{Database, DomainError};

/// The authenticated caller as presented by the auth layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub user_id: UserId,
    /// Tenant carried by the token, if any.
    pub tenant_id: Option<TenantId>,
}

/// Scope of a query. `Unscoped` only comes out of an explicit bypass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantScope {
    Tenant(TenantId),
    Unscoped,
}

impl Database {
    /// Resolve the active tenant: the principal's own tenant, then its
    /// linked parent record's, then the one attached upstream to the request.
    pub fn resolve_tenant(
        &self,
        principal: &Principal,
        request_tenant: Option<TenantId>,
    ) -> Result<TenantId, DomainError> {
        let resolved = self.with_conn(|conn| {
            let Some(user) = query_user(conn, principal.user_id)? else {
                return Ok(None);
            };
            if let Some(own) = user.tenant_id.map(TenantId).or(principal.tenant_id) {
                return Ok(Some(own));
            }
            Ok(effective_tenant(conn, &user)?.or(request_tenant))
        })?;

        resolved.ok_or_else(|| {
            warn!(
                user_id = %principal.user_id,
                "Denied: no tenant context could be resolved for principal"
            );
            DomainError::MissingTenantContext
        })
    }

    /// Explicit cross-tenant scope, granted to super-admins only.
    pub fn bypass_tenant_scope(&self, principal: &Principal) -> Result<TenantScope, DomainError> {
        let is_super_admin = self
            .with_conn(|conn| Ok(query_user(conn, principal.user_id)?.map(|u| u.is_super_admin)))?
            .unwrap_or(false);

        if !is_super_admin {
            warn!(user_id = %principal.user_id, "Denied tenant bypass for non super-admin");
            return Err(DomainError::Forbidden);
        }
        warn!(user_id = %principal.user_id, "Tenant scope bypassed by super-admin");
        Ok(TenantScope::Unscoped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use crate::users::NewUser;

    #[test]
    fn own_tenant_wins_over_request_header() {
        let db = testing::db();
        let user = testing::user(&db, TenantId(1), "Ana");
        let principal = Principal { user_id: user, tenant_id: None };

        assert_eq!(db.resolve_tenant(&principal, Some(TenantId(2))).unwrap(), TenantId(1));
    }

    #[test]
    fn request_tenant_is_last_resort() {
        let db = testing::db();
        let orphan = db
            .create_user(&NewUser { name: "Orphan".into(), handle: "orphan".into(), ..Default::default() })
            .unwrap();
        let principal = Principal { user_id: orphan, tenant_id: None };

        assert_eq!(db.resolve_tenant(&principal, Some(TenantId(9))).unwrap(), TenantId(9));
        assert!(matches!(
            db.resolve_tenant(&principal, None),
            Err(DomainError::MissingTenantContext)
        ));
    }

    #[test]
    fn unknown_principal_is_denied() {
        let db = testing::db();
        let principal = Principal { user_id: UserId(404), tenant_id: Some(TenantId(1)) };
        assert!(matches!(
            db.resolve_tenant(&principal, Some(TenantId(1))),
            Err(DomainError::MissingTenantContext)
        ));
    }

    #[test]
    fn bypass_requires_super_admin() {
        let db = testing::db();
        let user = testing::user(&db, TenantId(1), "Ana");
        let root = db
            .create_user(&NewUser {
                name: "Root".into(),
                handle: "root".into(),
                is_super_admin: true,
                ..Default::default()
            })
            .unwrap();

        assert!(matches!(
            db.bypass_tenant_scope(&Principal { user_id: user, tenant_id: None }),
            Err(DomainError::Forbidden)
        ));
        assert_eq!(
            db.bypass_tenant_scope(&Principal { user_id: root, tenant_id: None }).unwrap(),
            TenantScope::Unscoped
        );
    }
}
