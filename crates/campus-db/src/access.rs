//! Membership gates and read cursors, uniform over both container kinds.

use campus_types::models::{Capability, Role, UserSummary};
use campus_types::{ContainerRef, TenantId, UserId};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::{Database, DomainError, from_micros, to_micros};

impl Database {
    /// What `user` may do in `container`. Containers of other tenants,
    /// deleted channels and unknown ids all yield `Capability::None`.
    pub fn capability(
        &self,
        tenant: TenantId,
        user: UserId,
        container: ContainerRef,
    ) -> Result<Capability, DomainError> {
        self.with_conn(|conn| capability(conn, tenant, user, container))
    }

    pub fn is_member(
        &self,
        tenant: TenantId,
        container: ContainerRef,
        user: UserId,
    ) -> Result<bool, DomainError> {
        Ok(self.capability(tenant, user, container)?.is_member())
    }

    /// Advance the read cursor. Older timestamps are ignored, so concurrent
    /// calls converge on the latest one. Returns the resulting cursor.
    pub fn mark_read(
        &self,
        tenant: TenantId,
        container: ContainerRef,
        user: UserId,
        at: Option<DateTime<Utc>>,
    ) -> Result<DateTime<Utc>, DomainError> {
        self.with_conn(|conn| {
            // Clock read under the lock, so a message committed after this
            // cursor always sorts after it. Future timestamps are clamped.
            let now = self.now_micros();
            let at = at.map(to_micros).map_or(now, |at| at.min(now));
            require_member(conn, tenant, user, container)?;
            let sql = match container {
                ContainerRef::Channel(_) => {
                    "UPDATE channel_members SET last_read_at = MAX(COALESCE(last_read_at, 0), ?3)
                     WHERE channel_id = ?1 AND user_id = ?2"
                }
                ContainerRef::Conversation(_) => {
                    "UPDATE conversation_participants SET last_read_at = MAX(COALESCE(last_read_at, 0), ?3)
                     WHERE conversation_id = ?1 AND user_id = ?2"
                }
            };
            conn.execute(sql, params![container.raw_id(), user.0, at])?;
            Ok(from_micros(read_cursor(conn, container, user)?.unwrap_or(at)))
        })
    }

    pub fn unread_count(
        &self,
        tenant: TenantId,
        container: ContainerRef,
        user: UserId,
    ) -> Result<i64, DomainError> {
        self.with_conn(|conn| {
            require_member(conn, tenant, user, container)?;
            unread_count(conn, container, user)
        })
    }

    /// Current members/participants of a container, scoped to `tenant`.
    pub fn member_ids(&self, tenant: TenantId, container: ContainerRef) -> Result<Vec<UserId>, DomainError> {
        self.with_conn(|conn| member_ids(conn, tenant, container))
    }

    /// Public identities of the container's members, for mention matching.
    pub fn member_summaries(&self, tenant: TenantId, container: ContainerRef) -> Result<Vec<UserSummary>, DomainError> {
        self.with_conn(|conn| {
            member_ids(conn, tenant, container)?
                .into_iter()
                .map(|id| crate::users::summary(conn, id))
                .collect()
        })
    }
}

pub(crate) fn capability(
    conn: &Connection,
    tenant: TenantId,
    user: UserId,
    container: ContainerRef,
) -> Result<Capability, DomainError> {
    match container {
        ContainerRef::Channel(channel) => {
            let role: Option<String> = conn
                .query_row(
                    "SELECT m.role FROM channel_members m
                     JOIN channels c ON c.id = m.channel_id
                     WHERE m.channel_id = ?1 AND m.user_id = ?2
                       AND c.tenant_id = ?3 AND c.deleted_at IS NULL",
                    params![channel.0, user.0, tenant.0],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(role
                .and_then(|r| Role::parse(&r))
                .map(Capability::from)
                .unwrap_or(Capability::None))
        }
        ContainerRef::Conversation(conversation) => {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM conversation_participants p
                     JOIN conversations d ON d.id = p.conversation_id
                     WHERE p.conversation_id = ?1 AND p.user_id = ?2 AND d.tenant_id = ?3",
                    params![conversation.0, user.0, tenant.0],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(if exists.is_some() { Capability::Member } else { Capability::None })
        }
    }
}

/// Gate used before every message operation.
pub(crate) fn require_member(
    conn: &Connection,
    tenant: TenantId,
    user: UserId,
    container: ContainerRef,
) -> Result<Capability, DomainError> {
    let cap = capability(conn, tenant, user, container)?;
    if !cap.is_member() {
        return Err(DomainError::Forbidden);
    }
    Ok(cap)
}

pub(crate) fn read_cursor(
    conn: &Connection,
    container: ContainerRef,
    user: UserId,
) -> Result<Option<i64>, DomainError> {
    let sql = match container {
        ContainerRef::Channel(_) => {
            "SELECT last_read_at FROM channel_members WHERE channel_id = ?1 AND user_id = ?2"
        }
        ContainerRef::Conversation(_) => {
            "SELECT last_read_at FROM conversation_participants WHERE conversation_id = ?1 AND user_id = ?2"
        }
    };
    let cursor: Option<Option<i64>> = conn
        .query_row(sql, params![container.raw_id(), user.0], |r| r.get(0))
        .optional()?;
    Ok(cursor.flatten())
}

/// Live messages by other authors created after the user's read cursor.
pub(crate) fn unread_count(conn: &Connection, container: ContainerRef, user: UserId) -> Result<i64, DomainError> {
    let since = read_cursor(conn, container, user)?.unwrap_or(0);
    let sql = match container {
        ContainerRef::Channel(_) => {
            "SELECT COUNT(*) FROM messages
             WHERE channel_id = ?1 AND author_id != ?2 AND deleted_at IS NULL AND created_at > ?3"
        }
        ContainerRef::Conversation(_) => {
            "SELECT COUNT(*) FROM messages
             WHERE conversation_id = ?1 AND author_id != ?2 AND deleted_at IS NULL AND created_at > ?3"
        }
    };
    let count = conn.query_row(sql, params![container.raw_id(), user.0, since], |r| r.get(0))?;
    Ok(count)
}

pub(crate) fn member_ids(
    conn: &Connection,
    tenant: TenantId,
    container: ContainerRef,
) -> Result<Vec<UserId>, DomainError> {
    let sql = match container {
        ContainerRef::Channel(_) => {
            "SELECT m.user_id FROM channel_members m JOIN channels c ON c.id = m.channel_id
             WHERE m.channel_id = ?1 AND c.tenant_id = ?2 AND c.deleted_at IS NULL
             ORDER BY m.joined_at"
        }
        ContainerRef::Conversation(_) => {
            "SELECT p.user_id FROM conversation_participants p JOIN conversations d ON d.id = p.conversation_id
             WHERE p.conversation_id = ?1 AND d.tenant_id = ?2
             ORDER BY p.joined_at"
        }
    };
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map(params![container.raw_id(), tenant.0], |r| r.get(0).map(UserId))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}
