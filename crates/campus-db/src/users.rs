use campus_types::models::UserSummary;
use campus_types::{TenantId, UserId};
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::UserRow;
use crate::{Database, DomainError};

/// A directory record mirrored from the ERP's user tables.
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub tenant_id: Option<TenantId>,
    pub parent_id: Option<UserId>,
    pub name: String,
    pub handle: String,
    pub avatar: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub whatsapp: Option<String>,
    pub is_super_admin: bool,
}

impl Database {
    pub fn create_user(&self, user: &NewUser) -> Result<UserId, DomainError> {
        self.with_conn(|conn| {
            let now = self.now_micros();
            conn.execute(
                "INSERT INTO users (tenant_id, parent_id, name, handle, avatar, email, phone, whatsapp, is_super_admin, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    user.tenant_id.map(|t| t.0),
                    user.parent_id.map(|p| p.0),
                    user.name,
                    user.handle,
                    user.avatar,
                    user.email,
                    user.phone,
                    user.whatsapp,
                    user.is_super_admin,
                    now,
                ],
            )?;
            Ok(UserId(conn.last_insert_rowid()))
        })
    }

    pub fn get_user(&self, id: UserId) -> Result<Option<UserRow>, DomainError> {
        self.with_conn(|conn| query_user(conn, id))
    }

    /// Public identity of a user inside `tenant`.
    pub fn user_summary(&self, tenant: TenantId, id: UserId) -> Result<UserSummary, DomainError> {
        self.with_conn(|conn| {
            let row = query_user(conn, id)?.ok_or(DomainError::NotFound)?;
            if effective_tenant(conn, &row)? != Some(tenant) {
                return Err(DomainError::NotFound);
            }
            Ok(row.summary())
        })
    }
}

pub(crate) fn query_user(conn: &Connection, id: UserId) -> Result<Option<UserRow>, DomainError> {
    let sql = format!("SELECT {} FROM users WHERE id = ?1", UserRow::COLUMNS);
    let row = conn.query_row(&sql, [id.0], UserRow::from_row).optional()?;
    Ok(row)
}

/// The tenant a user belongs to: their own, else their parent record's.
pub(crate) fn effective_tenant(conn: &Connection, user: &UserRow) -> Result<Option<TenantId>, DomainError> {
    if let Some(tenant) = user.tenant_id {
        return Ok(Some(TenantId(tenant)));
    }
    let Some(parent_id) = user.parent_id else {
        return Ok(None);
    };
    let parent_tenant: Option<Option<i64>> = conn
        .query_row("SELECT tenant_id FROM users WHERE id = ?1", [parent_id], |r| r.get(0))
        .optional()?;
    Ok(parent_tenant.flatten().map(TenantId))
}

pub(crate) fn summary(conn: &Connection, id: UserId) -> Result<UserSummary, DomainError> {
    query_user(conn, id)?
        .map(|row| row.summary())
        .ok_or(DomainError::NotFound)
}

/// Returns the ids in `ids` that are NOT users of `tenant`.
pub(crate) fn foreign_users(
    conn: &Connection,
    tenant: TenantId,
    ids: &[UserId],
) -> Result<Vec<UserId>, DomainError> {
    let mut invalid = Vec::new();
    for &id in ids {
        let belongs = match query_user(conn, id)? {
            Some(row) => effective_tenant(conn, &row)? == Some(tenant),
            None => false,
        };
        if !belongs {
            invalid.push(id);
        }
    }
    Ok(invalid)
}
