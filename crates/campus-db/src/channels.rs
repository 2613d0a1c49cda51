use campus_types::models::{Capability, Channel, ChannelListing, Member, Role, UserSummary, Visibility};
use campus_types::{ChannelId, ContainerRef, TenantId, UserId};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::info;

use crate::access::{capability, require_member, unread_count};
use crate::error::is_unique_violation;
use crate::models::ChannelRow;
use crate::tenant::TenantScope;
use crate::users::foreign_users;
use crate::{Database, DomainError, from_micros};

#[derive(Debug, Clone)]
pub struct NewChannel {
    pub name: String,
    pub description: Option<String>,
    pub visibility: Visibility,
    pub icon: Option<String>,
    pub color: Option<String>,
    pub member_ids: Vec<UserId>,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub visibility: Option<Visibility>,
    pub icon: Option<String>,
    pub color: Option<String>,
    pub is_active: Option<bool>,
}

/// Result of a membership mutation, used to drive fan-out.
#[derive(Debug, Clone)]
pub struct MembershipChange {
    pub channel: Channel,
    pub user: UserSummary,
    pub role: Option<Role>,
}

impl Database {
    /// Create a channel; the creator joins as `admin`, listed users as `member`.
    pub fn create_channel(
        &self,
        tenant: TenantId,
        creator: UserId,
        spec: &NewChannel,
    ) -> Result<(Channel, Vec<UserId>), DomainError> {
        let name = spec.name.trim();
        if name.is_empty() {
            return Err(DomainError::validation("name", "name is required"));
        }

        self.with_tx(|tx| {
            let now = self.now_micros();
            let mut members: Vec<UserId> = vec![creator];
            for id in &spec.member_ids {
                if !members.contains(id) {
                    members.push(*id);
                }
            }
            let invalid = foreign_users(tx, tenant, &members)?;
            if !invalid.is_empty() {
                let ids: Vec<String> = invalid.iter().map(|i| i.to_string()).collect();
                return Err(DomainError::validation(
                    "member_ids",
                    format!("unknown users: {}", ids.join(", ")),
                ));
            }

            tx.execute(
                "INSERT INTO channels (tenant_id, name, description, visibility, icon, color, created_by, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    tenant.0,
                    name,
                    spec.description,
                    spec.visibility.as_str(),
                    spec.icon,
                    spec.color,
                    creator.0,
                    now,
                ],
            )?;
            let channel_id = ChannelId(tx.last_insert_rowid());

            for user in &members {
                let role = if *user == creator { Role::Admin } else { Role::Member };
                insert_member(tx, channel_id, *user, role, now)?;
            }

            info!("Channel {} created in tenant {} by {}", channel_id, tenant, creator);
            Ok((load_channel(tx, tenant, channel_id)?, members))
        })
    }

    /// A channel the user can see: one they belong to, or a public one.
    pub fn get_channel(&self, tenant: TenantId, user: UserId, id: ChannelId) -> Result<Channel, DomainError> {
        self.with_conn(|conn| {
            let channel = load_channel(conn, tenant, id)?;
            let cap = capability(conn, tenant, user, ContainerRef::Channel(id))?;
            if !cap.is_member() && channel.visibility != Visibility::Public {
                return Err(DomainError::NotFound);
            }
            Ok(channel)
        })
    }

    /// The user's channels with unread counts, for the sidebar.
    pub fn list_channels(&self, tenant: TenantId, user: UserId) -> Result<Vec<ChannelListing>, DomainError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {}, m.role, m.muted FROM channels c
                 JOIN channel_members m ON m.channel_id = c.id
                 WHERE c.tenant_id = ?1 AND m.user_id = ?2 AND c.deleted_at IS NULL
                 ORDER BY c.name",
                ChannelRow::COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![tenant.0, user.0], |r| {
                    Ok((ChannelRow::from_row(r)?, r.get::<_, String>(11)?, r.get::<_, bool>(12)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut listings = Vec::with_capacity(rows.len());
            for (row, role, muted) in rows {
                let channel = row.into_model();
                let unread = unread_count(conn, ContainerRef::Channel(channel.id), user)?;
                listings.push(ChannelListing {
                    channel,
                    role: Role::parse(&role).unwrap_or(Role::Member),
                    unread_count: unread,
                    muted,
                });
            }
            Ok(listings)
        })
    }

    /// Cross-tenant listing; only reachable through an explicit bypass scope.
    pub fn list_all_channels(&self, scope: TenantScope) -> Result<Vec<Channel>, DomainError> {
        self.with_conn(|conn| {
            let mut sql = format!("SELECT {} FROM channels c WHERE c.deleted_at IS NULL", ChannelRow::COLUMNS);
            let mut args: Vec<i64> = Vec::new();
            if let TenantScope::Tenant(tenant) = scope {
                sql.push_str(" AND c.tenant_id = ?1");
                args.push(tenant.0);
            }
            sql.push_str(" ORDER BY c.id");

            let mut stmt = conn.prepare(&sql)?;
            let channels = stmt
                .query_map(rusqlite::params_from_iter(args), ChannelRow::from_row)?
                .map(|r| r.map(ChannelRow::into_model))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(channels)
        })
    }

    pub fn update_channel(
        &self,
        tenant: TenantId,
        actor: UserId,
        id: ChannelId,
        update: &ChannelUpdate,
    ) -> Result<Channel, DomainError> {
        if let Some(name) = &update.name {
            if name.trim().is_empty() {
                return Err(DomainError::validation("name", "name is required"));
            }
        }

        self.with_tx(|tx| {
            let now = self.now_micros();
            require_admin(tx, tenant, actor, id)?;
            tx.execute(
                "UPDATE channels SET
                    name = COALESCE(?2, name),
                    description = COALESCE(?3, description),
                    visibility = COALESCE(?4, visibility),
                    icon = COALESCE(?5, icon),
                    color = COALESCE(?6, color),
                    is_active = COALESCE(?7, is_active),
                    updated_at = ?8
                 WHERE id = ?1",
                params![
                    id.0,
                    update.name.as_deref().map(str::trim),
                    update.description,
                    update.visibility.map(|v| v.as_str()),
                    update.icon,
                    update.color,
                    update.is_active,
                    now,
                ],
            )?;
            load_channel(tx, tenant, id)
        })
    }

    /// Soft delete; the channel disappears from every listing and gate.
    pub fn delete_channel(&self, tenant: TenantId, actor: UserId, id: ChannelId) -> Result<Channel, DomainError> {
        self.with_tx(|tx| {
            let now = self.now_micros();
            require_admin(tx, tenant, actor, id)?;
            let channel = load_channel(tx, tenant, id)?;
            tx.execute(
                "UPDATE channels SET deleted_at = ?2, updated_at = ?2, is_active = 0 WHERE id = ?1",
                params![id.0, now],
            )?;
            info!("Channel {} deleted by {}", id, actor);
            Ok(channel)
        })
    }

    /// Name of a live channel, regardless of who is asking.
    pub fn channel_name(&self, tenant: TenantId, id: ChannelId) -> Result<String, DomainError> {
        self.with_conn(|conn| Ok(load_channel(conn, tenant, id)?.name))
    }

    /// Tenant of a live channel, looked up WITHOUT tenant scoping. Only the
    /// subscription authorizer uses this, and it compares the result itself.
    pub fn channel_tenant_unscoped(&self, id: ChannelId) -> Result<Option<TenantId>, DomainError> {
        self.with_conn(|conn| {
            let tenant: Option<i64> = conn
                .query_row(
                    "SELECT tenant_id FROM channels WHERE id = ?1 AND deleted_at IS NULL",
                    [id.0],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(tenant.map(TenantId))
        })
    }

    pub fn channel_members(&self, tenant: TenantId, viewer: UserId, id: ChannelId) -> Result<Vec<Member>, DomainError> {
        self.with_conn(|conn| {
            require_member(conn, tenant, viewer, ContainerRef::Channel(id))?;
            members(conn, id)
        })
    }

    pub fn add_member(
        &self,
        tenant: TenantId,
        actor: UserId,
        id: ChannelId,
        user: UserId,
        role: Role,
    ) -> Result<MembershipChange, DomainError> {
        self.with_tx(|tx| {
            let now = self.now_micros();
            let cap = capability(tx, tenant, actor, ContainerRef::Channel(id))?;
            if !cap.can_moderate() {
                return Err(DomainError::Forbidden);
            }
            if role != Role::Member && cap != Capability::Admin {
                return Err(DomainError::Forbidden);
            }
            if !foreign_users(tx, tenant, &[user])?.is_empty() {
                return Err(DomainError::validation("user_id", "unknown user"));
            }
            insert_member(tx, id, user, role, now).map_err(|e| match e {
                DomainError::Database(ref err) if is_unique_violation(err) => {
                    DomainError::validation("user_id", "user is already a member")
                }
                other => other,
            })?;

            Ok(MembershipChange {
                channel: load_channel(tx, tenant, id)?,
                user: crate::users::summary(tx, user)?,
                role: Some(role),
            })
        })
    }

    /// Remove another member. Removing yourself goes through `leave_channel`.
    pub fn remove_member(
        &self,
        tenant: TenantId,
        actor: UserId,
        id: ChannelId,
        target: UserId,
    ) -> Result<MembershipChange, DomainError> {
        if actor == target {
            return self.leave_channel(tenant, actor, id);
        }
        self.with_tx(|tx| {
            let cap = capability(tx, tenant, actor, ContainerRef::Channel(id))?;
            if !cap.can_moderate() {
                return Err(DomainError::Forbidden);
            }
            let target_role = member_role(tx, id, target)?.ok_or(DomainError::NotFound)?;
            if target_role == Role::Admin && cap != Capability::Admin {
                return Err(DomainError::Forbidden);
            }
            delete_member(tx, id, target)?;
            ensure_admin_remains(tx, id)?;

            Ok(MembershipChange {
                channel: load_channel(tx, tenant, id)?,
                user: crate::users::summary(tx, target)?,
                role: None,
            })
        })
    }

    /// Voluntary leave. A sole admin must hand over or delete the channel.
    pub fn leave_channel(&self, tenant: TenantId, user: UserId, id: ChannelId) -> Result<MembershipChange, DomainError> {
        self.with_tx(|tx| {
            require_member(tx, tenant, user, ContainerRef::Channel(id))?;
            delete_member(tx, id, user)?;
            ensure_admin_remains(tx, id)?;

            Ok(MembershipChange {
                channel: load_channel(tx, tenant, id)?,
                user: crate::users::summary(tx, user)?,
                role: None,
            })
        })
    }

    pub fn set_member_role(
        &self,
        tenant: TenantId,
        actor: UserId,
        id: ChannelId,
        target: UserId,
        role: Role,
    ) -> Result<MembershipChange, DomainError> {
        self.with_tx(|tx| {
            require_admin(tx, tenant, actor, id)?;
            member_role(tx, id, target)?.ok_or(DomainError::NotFound)?;
            tx.execute(
                "UPDATE channel_members SET role = ?3 WHERE channel_id = ?1 AND user_id = ?2",
                params![id.0, target.0, role.as_str()],
            )?;
            ensure_admin_remains(tx, id)?;

            Ok(MembershipChange {
                channel: load_channel(tx, tenant, id)?,
                user: crate::users::summary(tx, target)?,
                role: Some(role),
            })
        })
    }

    /// Returns whether the flag actually changed.
    pub fn set_channel_muted(
        &self,
        tenant: TenantId,
        user: UserId,
        id: ChannelId,
        muted: bool,
    ) -> Result<bool, DomainError> {
        self.with_conn(|conn| {
            require_member(conn, tenant, user, ContainerRef::Channel(id))?;
            let changed = conn.execute(
                "UPDATE channel_members SET muted = ?3 WHERE channel_id = ?1 AND user_id = ?2 AND muted != ?3",
                params![id.0, user.0, muted],
            )?;
            Ok(changed > 0)
        })
    }

    /// Members who muted the channel; they get no per-message notifications.
    pub fn muted_members(&self, tenant: TenantId, id: ChannelId) -> Result<Vec<UserId>, DomainError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.user_id FROM channel_members m JOIN channels c ON c.id = m.channel_id
                 WHERE m.channel_id = ?1 AND c.tenant_id = ?2 AND m.muted = 1",
            )?;
            let ids = stmt
                .query_map(params![id.0, tenant.0], |r| r.get(0).map(UserId))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }
}

pub(crate) fn load_channel(conn: &Connection, tenant: TenantId, id: ChannelId) -> Result<Channel, DomainError> {
    let sql = format!(
        "SELECT {} FROM channels c WHERE c.id = ?1 AND c.tenant_id = ?2 AND c.deleted_at IS NULL",
        ChannelRow::COLUMNS
    );
    conn.query_row(&sql, params![id.0, tenant.0], ChannelRow::from_row)
        .optional()?
        .map(ChannelRow::into_model)
        .ok_or(DomainError::NotFound)
}

fn members(conn: &Connection, id: ChannelId) -> Result<Vec<Member>, DomainError> {
    let mut stmt = conn.prepare(
        "SELECT u.id, u.name, u.handle, u.avatar, m.role, m.joined_at, m.last_read_at, m.muted
         FROM channel_members m JOIN users u ON u.id = m.user_id
         WHERE m.channel_id = ?1
         ORDER BY m.joined_at",
    )?;
    let members = stmt
        .query_map([id.0], |r| {
            Ok(Member {
                user: UserSummary {
                    id: UserId(r.get(0)?),
                    name: r.get(1)?,
                    handle: r.get(2)?,
                    avatar: r.get(3)?,
                },
                role: Role::parse(&r.get::<_, String>(4)?).unwrap_or(Role::Member),
                joined_at: from_micros(r.get(5)?),
                last_read_at: r.get::<_, Option<i64>>(6)?.map(from_micros),
                muted: r.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(members)
}

fn insert_member(conn: &Connection, id: ChannelId, user: UserId, role: Role, now: i64) -> Result<(), DomainError> {
    conn.execute(
        "INSERT INTO channel_members (channel_id, user_id, role, joined_at) VALUES (?1, ?2, ?3, ?4)",
        params![id.0, user.0, role.as_str(), now],
    )?;
    Ok(())
}

fn delete_member(conn: &Connection, id: ChannelId, user: UserId) -> Result<(), DomainError> {
    let removed = conn.execute(
        "DELETE FROM channel_members WHERE channel_id = ?1 AND user_id = ?2",
        params![id.0, user.0],
    )?;
    if removed == 0 {
        return Err(DomainError::NotFound);
    }
    Ok(())
}

fn member_role(conn: &Connection, id: ChannelId, user: UserId) -> Result<Option<Role>, DomainError> {
    let role: Option<String> = conn
        .query_row(
            "SELECT role FROM channel_members WHERE channel_id = ?1 AND user_id = ?2",
            params![id.0, user.0],
            |r| r.get(0),
        )
        .optional()?;
    Ok(role.and_then(|r| Role::parse(&r)))
}

fn require_admin(conn: &Connection, tenant: TenantId, actor: UserId, id: ChannelId) -> Result<(), DomainError> {
    match capability(conn, tenant, actor, ContainerRef::Channel(id))? {
        Capability::Admin => Ok(()),
        Capability::None => {
            // Distinguish only between "not yours" and "not allowed" inside the tenant.
            load_channel(conn, tenant, id)?;
            Err(DomainError::Forbidden)
        }
        _ => Err(DomainError::Forbidden),
    }
}

/// Checked inside the same transaction as the mutation; a violation rolls it back.
fn ensure_admin_remains(conn: &Connection, id: ChannelId) -> Result<(), DomainError> {
    let admins: i64 = conn.query_row(
        "SELECT COUNT(*) FROM channel_members WHERE channel_id = ?1 AND role = 'admin'",
        [id.0],
        |r| r.get(0),
    )?;
    if admins == 0 {
        return Err(DomainError::invariant("a channel must keep at least one admin"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn channel_spec(name: &str, members: Vec<UserId>) -> NewChannel {
        NewChannel {
            name: name.to_string(),
            description: None,
            visibility: Visibility::Private,
            icon: None,
            color: None,
            member_ids: members,
        }
    }

    #[test]
    fn creator_becomes_admin() {
        let db = testing::db();
        let t = TenantId(1);
        let ana = testing::user(&db, t, "Ana");
        let bob = testing::user(&db, t, "Bob");

        let (channel, members) = db.create_channel(t, ana, &channel_spec("staff", vec![bob])).unwrap();
        assert_eq!(members, vec![ana, bob]);
        assert_eq!(db.capability(t, ana, ContainerRef::Channel(channel.id)).unwrap(), Capability::Admin);
        assert_eq!(db.capability(t, bob, ContainerRef::Channel(channel.id)).unwrap(), Capability::Member);
    }

    #[test]
    fn create_rejects_blank_name_and_foreign_members() {
        let db = testing::db();
        let ana = testing::user(&db, TenantId(1), "Ana");
        let outsider = testing::user(&db, TenantId(2), "Eve");

        assert!(matches!(
            db.create_channel(TenantId(1), ana, &channel_spec("   ", vec![])),
            Err(DomainError::Validation(_))
        ));
        match db.create_channel(TenantId(1), ana, &channel_spec("staff", vec![outsider])) {
            Err(DomainError::Validation(errors)) => assert!(errors.contains_key("member_ids")),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn removing_the_last_admin_is_an_invariant_violation() {
        let db = testing::db();
        let t = TenantId(1);
        let ana = testing::user(&db, t, "Ana");
        let bob = testing::user(&db, t, "Bob");
        let (channel, _) = db.create_channel(t, ana, &channel_spec("staff", vec![bob])).unwrap();

        assert!(matches!(db.remove_member(t, ana, channel.id, ana), Err(DomainError::InvariantViolation(_))));
        assert!(matches!(db.leave_channel(t, ana, channel.id), Err(DomainError::InvariantViolation(_))));
        assert!(matches!(
            db.set_member_role(t, ana, channel.id, ana, Role::Member),
            Err(DomainError::InvariantViolation(_))
        ));
        // Rolled back: Ana is still the admin.
        assert_eq!(db.capability(t, ana, ContainerRef::Channel(channel.id)).unwrap(), Capability::Admin);
    }

    #[test]
    fn admin_can_leave_after_handing_over() {
        let db = testing::db();
        let t = TenantId(1);
        let ana = testing::user(&db, t, "Ana");
        let bob = testing::user(&db, t, "Bob");
        let (channel, _) = db.create_channel(t, ana, &channel_spec("staff", vec![bob])).unwrap();

        db.set_member_role(t, ana, channel.id, bob, Role::Admin).unwrap();
        db.leave_channel(t, ana, channel.id).unwrap();
        assert!(!db.is_member(t, ContainerRef::Channel(channel.id), ana).unwrap());
    }

    #[test]
    fn only_moderators_manage_members() {
        let db = testing::db();
        let t = TenantId(1);
        let ana = testing::user(&db, t, "Ana");
        let bob = testing::user(&db, t, "Bob");
        let cid = testing::user(&db, t, "Cid");
        let (channel, _) = db.create_channel(t, ana, &channel_spec("staff", vec![bob])).unwrap();

        assert!(matches!(db.add_member(t, bob, channel.id, cid, Role::Member), Err(DomainError::Forbidden)));
        db.set_member_role(t, ana, channel.id, bob, Role::Moderator).unwrap();
        db.add_member(t, bob, channel.id, cid, Role::Member).unwrap();
        assert!(matches!(db.add_member(t, bob, channel.id, cid, Role::Member), Err(DomainError::Validation(_))));
        assert!(matches!(db.remove_member(t, bob, channel.id, ana), Err(DomainError::Forbidden)));
        db.remove_member(t, bob, channel.id, cid).unwrap();
    }

    #[test]
    fn update_and_delete_require_admin() {
        let db = testing::db();
        let t = TenantId(1);
        let ana = testing::user(&db, t, "Ana");
        let bob = testing::user(&db, t, "Bob");
        let (channel, _) = db.create_channel(t, ana, &channel_spec("staff", vec![bob])).unwrap();

        let update = ChannelUpdate { name: Some("teachers".into()), ..Default::default() };
        assert!(matches!(db.update_channel(t, bob, channel.id, &update), Err(DomainError::Forbidden)));
        assert_eq!(db.update_channel(t, ana, channel.id, &update).unwrap().name, "teachers");

        assert!(matches!(db.delete_channel(t, bob, channel.id), Err(DomainError::Forbidden)));
        db.delete_channel(t, ana, channel.id).unwrap();
        assert!(db.list_channels(t, ana).unwrap().is_empty());
        assert_eq!(db.channel_tenant_unscoped(channel.id).unwrap(), None);
    }

    #[test]
    fn channels_are_invisible_across_tenants() {
        let db = testing::db();
        let ana = testing::user(&db, TenantId(1), "Ana");
        let eve = testing::user(&db, TenantId(2), "Eve");
        let (channel, _) = db.create_channel(TenantId(1), ana, &channel_spec("staff", vec![])).unwrap();

        assert!(matches!(db.get_channel(TenantId(2), eve, channel.id), Err(DomainError::NotFound)));
        assert!(matches!(
            db.update_channel(TenantId(2), eve, channel.id, &ChannelUpdate::default()),
            Err(DomainError::NotFound)
        ));
        assert_eq!(db.channel_tenant_unscoped(channel.id).unwrap(), Some(TenantId(1)));
        assert_eq!(db.list_all_channels(TenantScope::Tenant(TenantId(2))).unwrap().len(), 0);
        assert_eq!(db.list_all_channels(TenantScope::Unscoped).unwrap().len(), 1);
    }

    #[test]
    fn read_cursor_never_moves_backwards() {
        let db = testing::db();
        let t = TenantId(1);
        let ana = testing::user(&db, t, "Ana");
        let (channel, _) = db.create_channel(t, ana, &channel_spec("staff", vec![])).unwrap();
        let container = ContainerRef::Channel(channel.id);

        let t1 = db.now();
        let t0 = t1 - chrono::Duration::seconds(30);
        assert_eq!(db.mark_read(t, container, ana, Some(t1)).unwrap(), t1);
        assert_eq!(db.mark_read(t, container, ana, Some(t0)).unwrap(), t1);
    }

    #[test]
    fn muting_is_idempotent() {
        let db = testing::db();
        let t = TenantId(1);
        let ana = testing::user(&db, t, "Ana");
        let (channel, _) = db.create_channel(t, ana, &channel_spec("staff", vec![])).unwrap();

        assert!(db.set_channel_muted(t, ana, channel.id, true).unwrap());
        assert!(!db.set_channel_muted(t, ana, channel.id, true).unwrap());
        assert_eq!(db.muted_members(t, channel.id).unwrap(), vec![ana]);
        assert!(db.set_channel_muted(t, ana, channel.id, false).unwrap());
    }
}
