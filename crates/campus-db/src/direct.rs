use campus_types::models::{Conversation, ConversationSnapshot, UserSummary};
use campus_types::{ContainerRef, ConversationId, TenantId, UserId};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::info;

use crate::access::{require_member, unread_count};
use crate::messages::latest_message;
use crate::models::ConversationRow;
use crate::users::foreign_users;
use crate::{Database, DomainError};

/// Outcome of `create_conversation`. `created` is false when an existing
/// one-to-one conversation was returned instead.
#[derive(Debug, Clone)]
pub struct OpenedConversation {
    pub conversation: Conversation,
    pub participants: Vec<UserId>,
    pub created: bool,
}

impl Database {
    /// Open a conversation between `creator` and `others`. Two people and no
    /// name reuses their existing one-to-one thread.
    pub fn create_conversation(
        &self,
        tenant: TenantId,
        creator: UserId,
        others: &[UserId],
        name: Option<&str>,
    ) -> Result<OpenedConversation, DomainError> {
        let name = name.map(str::trim).filter(|n| !n.is_empty());

        self.with_tx(|tx| {
            let now = self.now_micros();
            let mut participants = vec![creator];
            for id in others {
                if !participants.contains(id) {
                    participants.push(*id);
                }
            }
            if participants.len() < 2 {
                return Err(DomainError::validation(
                    "participant_ids",
                    "at least one other participant is required",
                ));
            }
            let invalid = foreign_users(tx, tenant, &participants)?;
            if !invalid.is_empty() {
                let ids: Vec<String> = invalid.iter().map(|i| i.to_string()).collect();
                return Err(DomainError::validation(
                    "participant_ids",
                    format!("unknown users: {}", ids.join(", ")),
                ));
            }

            let is_group = participants.len() > 2 || name.is_some();
            if !is_group {
                if let Some(existing) = find_pair(tx, tenant, participants[0], participants[1])? {
                    return Ok(OpenedConversation {
                        conversation: load_conversation(tx, tenant, existing)?,
                        participants,
                        created: false,
                    });
                }
            }

            tx.execute(
                "INSERT INTO conversations (tenant_id, name, is_group, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![tenant.0, name, is_group, now],
            )?;
            let id = ConversationId(tx.last_insert_rowid());
            for user in &participants {
                tx.execute(
                    "INSERT INTO conversation_participants (conversation_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
                    params![id.0, user.0, now],
                )?;
            }

            info!("Conversation {} opened in tenant {} ({} participants)", id, tenant, participants.len());
            Ok(OpenedConversation {
                conversation: load_conversation(tx, tenant, id)?,
                participants,
                created: true,
            })
        })
    }

    pub fn get_conversation(
        &self,
        tenant: TenantId,
        viewer: UserId,
        id: ConversationId,
    ) -> Result<Conversation, DomainError> {
        self.with_conn(|conn| {
            let conversation = load_conversation(conn, tenant, id)?;
            require_member(conn, tenant, viewer, ContainerRef::Conversation(id))?;
            Ok(conversation)
        })
    }

    pub fn conversation_participants(
        &self,
        tenant: TenantId,
        id: ConversationId,
    ) -> Result<Vec<UserSummary>, DomainError> {
        self.with_conn(|conn| {
            load_conversation(conn, tenant, id)?;
            participants(conn, id)
        })
    }

    /// The viewer's conversations, most recently active first.
    pub fn list_conversations(&self, tenant: TenantId, viewer: UserId) -> Result<Vec<ConversationSnapshot>, DomainError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM conversations d
                 JOIN conversation_participants p ON p.conversation_id = d.id
                 WHERE d.tenant_id = ?1 AND p.user_id = ?2
                 ORDER BY d.updated_at DESC, d.id DESC",
                ConversationRow::COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let conversations = stmt
                .query_map(params![tenant.0, viewer.0], ConversationRow::from_row)?
                .map(|r| r.map(ConversationRow::into_model))
                .collect::<Result<Vec<_>, _>>()?;

            conversations
                .into_iter()
                .map(|conversation| snapshot(conn, conversation, viewer))
                .collect()
        })
    }

    /// Everything `viewer` needs to render the conversation without a refetch.
    pub fn conversation_snapshot(
        &self,
        tenant: TenantId,
        id: ConversationId,
        viewer: UserId,
    ) -> Result<ConversationSnapshot, DomainError> {
        self.with_conn(|conn| {
            let conversation = load_conversation(conn, tenant, id)?;
            require_member(conn, tenant, viewer, ContainerRef::Conversation(id))?;
            snapshot(conn, conversation, viewer)
        })
    }

    /// Unscoped tenant lookup for the subscription authorizer.
    pub fn conversation_tenant_unscoped(&self, id: ConversationId) -> Result<Option<TenantId>, DomainError> {
        self.with_conn(|conn| {
            let tenant: Option<i64> = conn
                .query_row("SELECT tenant_id FROM conversations WHERE id = ?1", [id.0], |r| r.get(0))
                .optional()?;
            Ok(tenant.map(TenantId))
        })
    }
}

pub(crate) fn load_conversation(
    conn: &Connection,
    tenant: TenantId,
    id: ConversationId,
) -> Result<Conversation, DomainError> {
    let sql = format!(
        "SELECT {} FROM conversations d WHERE d.id = ?1 AND d.tenant_id = ?2",
        ConversationRow::COLUMNS
    );
    conn.query_row(&sql, params![id.0, tenant.0], ConversationRow::from_row)
        .optional()?
        .map(ConversationRow::into_model)
        .ok_or(DomainError::NotFound)
}

fn participants(conn: &Connection, id: ConversationId) -> Result<Vec<UserSummary>, DomainError> {
    let mut stmt = conn.prepare(
        "SELECT u.id, u.name, u.handle, u.avatar FROM conversation_participants p
         JOIN users u ON u.id = p.user_id
         WHERE p.conversation_id = ?1
         ORDER BY p.joined_at, u.id",
    )?;
    let users = stmt
        .query_map([id.0], |r| {
            Ok(UserSummary {
                id: UserId(r.get(0)?),
                name: r.get(1)?,
                handle: r.get(2)?,
                avatar: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(users)
}

fn snapshot(conn: &Connection, conversation: Conversation, viewer: UserId) -> Result<ConversationSnapshot, DomainError> {
    let container = ContainerRef::Conversation(conversation.id);
    Ok(ConversationSnapshot {
        participants: participants(conn, conversation.id)?,
        latest_message: latest_message(conn, container)?,
        unread_count: unread_count(conn, container, viewer)?,
        conversation,
    })
}

fn find_pair(conn: &Connection, tenant: TenantId, a: UserId, b: UserId) -> Result<Option<ConversationId>, DomainError> {
    let id: Option<i64> = conn
        .query_row(
            "SELECT d.id FROM conversations d
             WHERE d.tenant_id = ?1 AND d.is_group = 0
               AND EXISTS (SELECT 1 FROM conversation_participants p WHERE p.conversation_id = d.id AND p.user_id = ?2)
               AND EXISTS (SELECT 1 FROM conversation_participants p WHERE p.conversation_id = d.id AND p.user_id = ?3)
               AND (SELECT COUNT(*) FROM conversation_participants p WHERE p.conversation_id = d.id) = 2
             ORDER BY d.id LIMIT 1",
            params![tenant.0, a.0, b.0],
            |r| r.get(0),
        )
        .optional()?;
    Ok(id.map(ConversationId))
}

/// Bumps the conversation to the top of everyone's list.
pub(crate) fn touch(conn: &Connection, id: ConversationId, now: i64) -> Result<(), DomainError> {
    conn.execute("UPDATE conversations SET updated_at = ?2 WHERE id = ?1", params![id.0, now])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn one_to_one_is_find_or_create() {
        let db = testing::db();
        let t = TenantId(1);
        let ana = testing::user(&db, t, "Ana");
        let bob = testing::user(&db, t, "Bob");

        let first = db.create_conversation(t, ana, &[bob], None).unwrap();
        assert!(first.created);
        assert!(!first.conversation.is_group);

        let again = db.create_conversation(t, bob, &[ana], None).unwrap();
        assert!(!again.created);
        assert_eq!(again.conversation.id, first.conversation.id);
    }

    #[test]
    fn named_or_larger_conversations_are_groups() {
        let db = testing::db();
        let t = TenantId(1);
        let ana = testing::user(&db, t, "Ana");
        let bob = testing::user(&db, t, "Bob");
        let cid = testing::user(&db, t, "Cid");

        let trio = db.create_conversation(t, ana, &[bob, cid], None).unwrap();
        assert!(trio.conversation.is_group);
        let named = db.create_conversation(t, ana, &[bob], Some("Projects")).unwrap();
        assert!(named.created && named.conversation.is_group);
    }

    #[test]
    fn rejects_self_only_and_foreign_participants() {
        let db = testing::db();
        let ana = testing::user(&db, TenantId(1), "Ana");
        let eve = testing::user(&db, TenantId(2), "Eve");

        assert!(matches!(db.create_conversation(TenantId(1), ana, &[ana], None), Err(DomainError::Validation(_))));
        assert!(matches!(db.create_conversation(TenantId(1), ana, &[eve], None), Err(DomainError::Validation(_))));
    }

    #[test]
    fn snapshot_is_scoped_to_participants_and_tenant() {
        let db = testing::db();
        let t = TenantId(1);
        let ana = testing::user(&db, t, "Ana");
        let bob = testing::user(&db, t, "Bob");
        let cid = testing::user(&db, t, "Cid");
        let eve = testing::user(&db, TenantId(2), "Eve");
        let dm = db.create_conversation(t, ana, &[bob], None).unwrap().conversation;

        let snap = db.conversation_snapshot(t, dm.id, bob).unwrap();
        assert_eq!(snap.participants.len(), 2);
        assert!(snap.latest_message.is_none());
        assert_eq!(snap.unread_count, 0);

        assert!(matches!(db.conversation_snapshot(t, dm.id, cid), Err(DomainError::Forbidden)));
        assert!(matches!(db.conversation_snapshot(TenantId(2), dm.id, eve), Err(DomainError::NotFound)));
        assert_eq!(db.list_conversations(t, ana).unwrap().len(), 1);
        assert!(db.list_conversations(TenantId(2), eve).unwrap().is_empty());
    }
}
