use std::collections::HashMap;

use campus_types::api::{AttachmentFailure, AttachmentInput, MAX_MESSAGE_CHARS};
use campus_types::models::{Attachment, Capability, Message, MessageType, ReactionGroup};
use campus_types::{ContainerRef, MessageId, TenantId, UserId};
use rusqlite::types::ToSql;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, warn};

use crate::access::require_member;
use crate::direct::touch;
use crate::error::is_unique_violation;
use crate::models::{AttachmentRow, MessageRow, ReactionRow};
use crate::{Database, DomainError};

/// Hard cap on a single page of history.
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub content: String,
    pub message_type: MessageType,
    pub parent_id: Option<MessageId>,
    pub attachments: Vec<AttachmentInput>,
}

/// A persisted message plus the attachments that could not be stored.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub message: Message,
    pub attachment_failures: Vec<AttachmentFailure>,
}

#[derive(Debug, Clone)]
pub struct DeletedMessage {
    pub container: ContainerRef,
    pub message_id: MessageId,
    pub parent_id: Option<MessageId>,
}

#[derive(Debug, Clone)]
pub struct ReactionChange {
    pub container: ContainerRef,
    pub message_id: MessageId,
    pub user_id: UserId,
    pub emoji: String,
    /// Reactions on the message after the change.
    pub reactions: Vec<ReactionGroup>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Page {
    pub limit: u32,
    pub before_id: Option<MessageId>,
    pub after_id: Option<MessageId>,
}

impl Database {
    pub fn send_message(
        &self,
        tenant: TenantId,
        container: ContainerRef,
        author: UserId,
        new: &NewMessage,
    ) -> Result<SentMessage, DomainError> {
        let content = validate_content(&new.content)?;

        self.with_tx(|tx| {
            // Read the clock under the write lock so created_at follows commit order.
            let now = self.now_micros();
            require_member(tx, tenant, author, container)?;
            if let Some(parent) = new.parent_id {
                check_parent(tx, tenant, container, parent)?;
            }

            let (channel_id, conversation_id) = split(container);
            tx.execute(
                "INSERT INTO messages (tenant_id, channel_id, conversation_id, author_id, content, message_type, parent_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    tenant.0,
                    channel_id,
                    conversation_id,
                    author.0,
                    content,
                    new.message_type.as_str(),
                    new.parent_id.map(|p| p.0),
                    now,
                ],
            )?;
            let id = MessageId(tx.last_insert_rowid());

            // Each attachment stands alone: a bad one is reported, the message stays.
            let mut failures = Vec::new();
            for attachment in &new.attachments {
                if let Err(reason) = insert_attachment(tx, id, attachment, now) {
                    warn!("Attachment '{}' on message {} not stored: {}", attachment.filename, id, reason);
                    failures.push(AttachmentFailure {
                        filename: attachment.filename.clone(),
                        reason,
                    });
                }
            }

            if let ContainerRef::Conversation(conversation) = container {
                touch(tx, conversation, now)?;
            }

            debug!("Message {} stored in {}", id, container);
            Ok(SentMessage {
                message: load_message(tx, tenant, container, id)?,
                attachment_failures: failures,
            })
        })
    }

    /// Author only, and only while still a member.
    pub fn edit_message(
        &self,
        tenant: TenantId,
        container: ContainerRef,
        actor: UserId,
        id: MessageId,
        content: &str,
    ) -> Result<Message, DomainError> {
        let content = validate_content(content)?;

        self.with_tx(|tx| {
            let now = self.now_micros();
            require_member(tx, tenant, actor, container)?;
            let row = find_row(tx, tenant, container, id)?;
            if row.author.id != actor {
                return Err(DomainError::Forbidden);
            }
            tx.execute(
                "UPDATE messages SET content = ?2, is_edited = 1, edited_at = ?3, updated_at = ?3 WHERE id = ?1",
                params![id.0, content, now],
            )?;
            load_message(tx, tenant, container, id)
        })
    }

    /// Soft delete by the author, or by a channel moderator/admin.
    pub fn delete_message(
        &self,
        tenant: TenantId,
        container: ContainerRef,
        actor: UserId,
        id: MessageId,
    ) -> Result<DeletedMessage, DomainError> {
        self.with_tx(|tx| {
            let now = self.now_micros();
            let cap = require_member(tx, tenant, actor, container)?;
            let row = find_row(tx, tenant, container, id)?;
            let moderates = matches!(container, ContainerRef::Channel(_)) && cap.can_moderate();
            if row.author.id != actor && !moderates {
                return Err(DomainError::Forbidden);
            }
            tx.execute(
                "UPDATE messages SET deleted_at = ?2, updated_at = ?2 WHERE id = ?1",
                params![id.0, now],
            )?;
            Ok(DeletedMessage {
                container,
                message_id: id,
                parent_id: row.parent_id.map(MessageId),
            })
        })
    }

    /// Fails with `DuplicateReaction` when the same user already reacted
    /// with the same emoji, including under concurrent adds.
    pub fn add_reaction(
        &self,
        tenant: TenantId,
        container: ContainerRef,
        actor: UserId,
        id: MessageId,
        emoji: &str,
    ) -> Result<ReactionChange, DomainError> {
        let emoji = validate_emoji(emoji)?;

        self.with_tx(|tx| {
            let now = self.now_micros();
            require_member(tx, tenant, actor, container)?;
            find_row(tx, tenant, container, id)?;
            tx.execute(
                "INSERT INTO reactions (message_id, user_id, emoji, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id.0, actor.0, emoji, now],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DomainError::DuplicateReaction
                } else {
                    DomainError::from(e)
                }
            })?;
            reaction_change(tx, container, id, actor, emoji)
        })
    }

    pub fn remove_reaction(
        &self,
        tenant: TenantId,
        container: ContainerRef,
        actor: UserId,
        id: MessageId,
        emoji: &str,
    ) -> Result<ReactionChange, DomainError> {
        let emoji = validate_emoji(emoji)?;

        self.with_tx(|tx| {
            require_member(tx, tenant, actor, container)?;
            find_row(tx, tenant, container, id)?;
            let removed = tx.execute(
                "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                params![id.0, actor.0, emoji],
            )?;
            if removed == 0 {
                return Err(DomainError::NotFound);
            }
            reaction_change(tx, container, id, actor, emoji)
        })
    }

    /// Moderators and admins pin in channels; any participant in a conversation.
    pub fn toggle_pin(
        &self,
        tenant: TenantId,
        container: ContainerRef,
        actor: UserId,
        id: MessageId,
    ) -> Result<Message, DomainError> {
        self.with_tx(|tx| {
            let now = self.now_micros();
            let cap = require_member(tx, tenant, actor, container)?;
            if matches!(container, ContainerRef::Channel(_)) && cap < Capability::Moderator {
                return Err(DomainError::Forbidden);
            }
            find_row(tx, tenant, container, id)?;
            tx.execute(
                "UPDATE messages SET
                    is_pinned = NOT is_pinned,
                    pinned_at = CASE WHEN is_pinned THEN NULL ELSE ?2 END,
                    updated_at = ?2
                 WHERE id = ?1",
                params![id.0, now],
            )?;
            load_message(tx, tenant, container, id)
        })
    }

    pub fn get_message(
        &self,
        tenant: TenantId,
        container: ContainerRef,
        viewer: UserId,
        id: MessageId,
    ) -> Result<Message, DomainError> {
        self.with_conn(|conn| {
            require_member(conn, tenant, viewer, container)?;
            load_message(conn, tenant, container, id)
        })
    }

    /// Top-level history, newest first. `before_id`/`after_id` are exclusive
    /// id cursors; the limit is clamped to `1..=MAX_PAGE_SIZE`.
    pub fn list_messages(
        &self,
        tenant: TenantId,
        container: ContainerRef,
        viewer: UserId,
        page: Page,
    ) -> Result<Vec<Message>, DomainError> {
        let limit = page.limit.clamp(1, MAX_PAGE_SIZE);

        self.with_conn(|conn| {
            require_member(conn, tenant, viewer, container)?;

            let mut filter = format!(
                "m.{} = ?1 AND m.tenant_id = ?2 AND m.parent_id IS NULL AND m.deleted_at IS NULL",
                column(container)
            );
            let mut args: Vec<i64> = vec![container.raw_id(), tenant.0];
            if let Some(before) = page.before_id {
                args.push(before.0);
                filter.push_str(&format!(" AND m.id < ?{}", args.len()));
            }
            if let Some(after) = page.after_id {
                args.push(after.0);
                filter.push_str(&format!(" AND m.id > ?{}", args.len()));
            }
            // Paging forward reads the oldest rows past the cursor, then flips.
            let order = if page.after_id.is_some() && page.before_id.is_none() { "ASC" } else { "DESC" };
            filter.push_str(&format!(" ORDER BY m.id {} LIMIT {}", order, limit));

            let params: Vec<&dyn ToSql> = args.iter().map(|a| a as &dyn ToSql).collect();
            let mut rows = query_rows(conn, &filter, &params)?;
            if order == "ASC" {
                rows.reverse();
            }
            hydrate(conn, rows)
        })
    }

    /// Replies to a top-level message, oldest first.
    pub fn list_replies(
        &self,
        tenant: TenantId,
        container: ContainerRef,
        viewer: UserId,
        parent: MessageId,
    ) -> Result<Vec<Message>, DomainError> {
        self.with_conn(|conn| {
            require_member(conn, tenant, viewer, container)?;
            find_row(conn, tenant, container, parent)?;
            let rows = query_rows(
                conn,
                "m.parent_id = ?1 AND m.tenant_id = ?2 AND m.deleted_at IS NULL ORDER BY m.id ASC",
                &[&parent.0, &tenant.0],
            )?;
            hydrate(conn, rows)
        })
    }
}

fn validate_content(content: &str) -> Result<&str, DomainError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(DomainError::validation("content", "content is required"));
    }
    if trimmed.chars().count() > MAX_MESSAGE_CHARS {
        return Err(DomainError::validation(
            "content",
            format!("content must be at most {} characters", MAX_MESSAGE_CHARS),
        ));
    }
    Ok(trimmed)
}

fn validate_emoji(emoji: &str) -> Result<&str, DomainError> {
    let trimmed = emoji.trim();
    if trimmed.is_empty() || trimmed.chars().count() > 32 {
        return Err(DomainError::validation("emoji", "emoji must be 1-32 characters"));
    }
    Ok(trimmed)
}

fn split(container: ContainerRef) -> (Option<i64>, Option<i64>) {
    match container {
        ContainerRef::Channel(id) => (Some(id.0), None),
        ContainerRef::Conversation(id) => (None, Some(id.0)),
    }
}

fn column(container: ContainerRef) -> &'static str {
    match container {
        ContainerRef::Channel(_) => "channel_id",
        ContainerRef::Conversation(_) => "conversation_id",
    }
}

/// A reply must target a live, top-level message of the same container.
fn check_parent(conn: &Connection, tenant: TenantId, container: ContainerRef, parent: MessageId) -> Result<(), DomainError> {
    let sql = format!(
        "SELECT parent_id FROM messages
         WHERE id = ?1 AND tenant_id = ?2 AND {} = ?3 AND deleted_at IS NULL",
        column(container)
    );
    let found: Option<Option<i64>> = conn
        .query_row(&sql, params![parent.0, tenant.0, container.raw_id()], |r| r.get(0))
        .optional()?;
    match found {
        Some(None) => Ok(()),
        Some(Some(_)) => Err(DomainError::validation("parent_id", "replies cannot be nested")),
        None => Err(DomainError::validation("parent_id", "parent message does not exist")),
    }
}

fn insert_attachment(conn: &Connection, message: MessageId, input: &AttachmentInput, now: i64) -> Result<(), String> {
    if input.filename.trim().is_empty() {
        return Err("filename is required".to_string());
    }
    if input.storage_path.trim().is_empty() {
        return Err("storage path is required".to_string());
    }
    if input.size < 0 {
        return Err("size must not be negative".to_string());
    }
    let metadata = input.metadata.as_ref().map(|m| m.to_string());
    conn.execute(
        "INSERT INTO attachments (message_id, filename, mime_type, size, storage_path, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![message.0, input.filename, input.mime_type, input.size, input.storage_path, metadata, now],
    )
    .map_err(|e| e.to_string())?;
    Ok(())
}

fn query_rows(conn: &Connection, filter: &str, params: &[&dyn ToSql]) -> Result<Vec<MessageRow>, DomainError> {
    let sql = format!(
        "SELECT {} FROM messages m LEFT JOIN users u ON u.id = m.author_id WHERE {}",
        MessageRow::COLUMNS,
        filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params, MessageRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// A live message of `container` in `tenant`; anything else is `NotFound`.
fn find_row(conn: &Connection, tenant: TenantId, container: ContainerRef, id: MessageId) -> Result<MessageRow, DomainError> {
    let filter = format!(
        "m.id = ?1 AND m.tenant_id = ?2 AND m.{} = ?3 AND m.deleted_at IS NULL",
        column(container)
    );
    query_rows(conn, &filter, &[&id.0, &tenant.0, &container.raw_id()])?
        .pop()
        .ok_or(DomainError::NotFound)
}

fn load_message(conn: &Connection, tenant: TenantId, container: ContainerRef, id: MessageId) -> Result<Message, DomainError> {
    let row = find_row(conn, tenant, container, id)?;
    hydrate(conn, vec![row])?.pop().ok_or(DomainError::NotFound)
}

/// Newest live message of a container, replies included.
pub(crate) fn latest_message(conn: &Connection, container: ContainerRef) -> Result<Option<Message>, DomainError> {
    let filter = format!("m.{} = ?1 AND m.deleted_at IS NULL ORDER BY m.id DESC LIMIT 1", column(container));
    let rows = query_rows(conn, &filter, &[&container.raw_id()])?;
    Ok(hydrate(conn, rows)?.pop())
}

fn placeholders(n: usize) -> String {
    (1..=n).map(|i| format!("?{}", i)).collect::<Vec<_>>().join(", ")
}

/// Attach attachments and grouped reactions to a batch of rows, two queries total.
fn hydrate(conn: &Connection, rows: Vec<MessageRow>) -> Result<Vec<Message>, DomainError> {
    if rows.is_empty() {
        return Ok(vec![]);
    }
    let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
    let params: Vec<&dyn ToSql> = ids.iter().map(|id| id as &dyn ToSql).collect();

    let mut attachments: HashMap<i64, Vec<Attachment>> = HashMap::new();
    {
        let sql = format!(
            "SELECT id, message_id, filename, mime_type, size, storage_path, metadata
             FROM attachments WHERE message_id IN ({}) ORDER BY id",
            placeholders(ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let found = stmt
            .query_map(params.as_slice(), |row| {
                Ok(AttachmentRow {
                    id: row.get(0)?,
                    message_id: row.get(1)?,
                    filename: row.get(2)?,
                    mime_type: row.get(3)?,
                    size: row.get(4)?,
                    storage_path: row.get(5)?,
                    metadata: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for row in found {
            attachments.entry(row.message_id).or_default().push(row.into_model());
        }
    }

    let mut reactions = {
        let sql = format!(
            "SELECT message_id, user_id, emoji FROM reactions WHERE message_id IN ({}) ORDER BY id",
            placeholders(ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let found = stmt
            .query_map(params.as_slice(), |row| {
                Ok(ReactionRow {
                    message_id: row.get(0)?,
                    user_id: row.get(1)?,
                    emoji: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        group_reactions(found)
    };

    rows.into_iter()
        .map(|row| {
            let container = row
                .container()
                .ok_or_else(|| DomainError::invariant(format!("message {} has no container", row.id)))?;
            let id = row.id;
            Ok(row.into_model(
                container,
                attachments.remove(&id).unwrap_or_default(),
                reactions.remove(&id).unwrap_or_default(),
            ))
        })
        .collect()
}

/// Aggregate reaction rows into per-emoji groups, in first-reaction order.
fn group_reactions(rows: Vec<ReactionRow>) -> HashMap<i64, Vec<ReactionGroup>> {
    let mut grouped: HashMap<i64, Vec<ReactionGroup>> = HashMap::new();
    for row in rows {
        let groups = grouped.entry(row.message_id).or_default();
        let user = UserId(row.user_id);
        match groups.iter_mut().find(|g| g.emoji == row.emoji) {
            Some(group) => {
                group.count += 1;
                group.user_ids.push(user);
            }
            None => groups.push(ReactionGroup {
                emoji: row.emoji,
                count: 1,
                user_ids: vec![user],
            }),
        }
    }
    grouped
}

fn reaction_change(
    conn: &Connection,
    container: ContainerRef,
    id: MessageId,
    user: UserId,
    emoji: &str,
) -> Result<ReactionChange, DomainError> {
    let mut stmt = conn.prepare("SELECT message_id, user_id, emoji FROM reactions WHERE message_id = ?1 ORDER BY id")?;
    let rows = stmt
        .query_map([id.0], |row| {
            Ok(ReactionRow {
                message_id: row.get(0)?,
                user_id: row.get(1)?,
                emoji: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ReactionChange {
        container,
        message_id: id,
        user_id: user,
        emoji: emoji.to_string(),
        reactions: group_reactions(rows).remove(&id.0).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use campus_types::ChannelId;
    use campus_types::models::{Role, Visibility};

    use super::*;
    use crate::channels::NewChannel;
    use crate::testing;

    fn text(content: &str) -> NewMessage {
        NewMessage { content: content.to_string(), ..Default::default() }
    }

    fn setup(db: &Database, tenant: TenantId) -> (UserId, UserId, ChannelId) {
        let ana = testing::user(db, tenant, "Ana");
        let bob = testing::user(db, tenant, "Bob");
        let (channel, _) = db
            .create_channel(
                tenant,
                ana,
                &NewChannel {
                    name: "general".into(),
                    description: None,
                    visibility: Visibility::Private,
                    icon: None,
                    color: None,
                    member_ids: vec![bob],
                },
            )
            .unwrap();
        (ana, bob, channel.id)
    }

    #[test]
    fn send_validates_content() {
        let db = testing::db();
        let t = TenantId(1);
        let (ana, _, channel) = setup(&db, t);
        let c = ContainerRef::Channel(channel);

        assert!(matches!(db.send_message(t, c, ana, &text("   ")), Err(DomainError::Validation(_))));
        let long = "x".repeat(MAX_MESSAGE_CHARS + 1);
        assert!(matches!(db.send_message(t, c, ana, &text(&long)), Err(DomainError::Validation(_))));

        let sent = db.send_message(t, c, ana, &text("  hi there ")).unwrap();
        assert_eq!(sent.message.content, "hi there");
        assert_eq!(sent.message.author.id, ana);
        assert_eq!(sent.message.channel_id(), Some(channel));
    }

    #[test]
    fn replies_must_target_live_top_level_messages() {
        let db = testing::db();
        let t = TenantId(1);
        let (ana, bob, channel) = setup(&db, t);
        let c = ContainerRef::Channel(channel);

        let root = db.send_message(t, c, ana, &text("root")).unwrap().message;
        let reply = NewMessage { parent_id: Some(root.id), ..text("reply") };
        let child = db.send_message(t, c, bob, &reply).unwrap().message;

        let nested = NewMessage { parent_id: Some(child.id), ..text("nested") };
        assert!(matches!(db.send_message(t, c, ana, &nested), Err(DomainError::Validation(_))));

        let replies = db.list_replies(t, c, ana, root.id).unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(db.get_message(t, c, ana, root.id).unwrap().reply_count, 1);
        // Replies stay out of the main history.
        assert_eq!(db.list_messages(t, c, ana, Page { limit: 50, ..Default::default() }).unwrap().len(), 1);
    }

    #[test]
    fn bad_attachments_do_not_roll_back_the_message() {
        let db = testing::db();
        let t = TenantId(1);
        let (ana, _, channel) = setup(&db, t);
        let c = ContainerRef::Channel(channel);

        let good = AttachmentInput {
            filename: "plan.pdf".into(),
            mime_type: "application/pdf".into(),
            size: 1024,
            storage_path: "1/abc".into(),
            metadata: None,
        };
        let bad = AttachmentInput { storage_path: String::new(), filename: "broken.png".into(), ..good.clone() };
        let new = NewMessage { attachments: vec![good, bad], ..text("files") };

        let sent = db.send_message(t, c, ana, &new).unwrap();
        assert_eq!(sent.message.attachments.len(), 1);
        assert_eq!(sent.attachment_failures.len(), 1);
        assert_eq!(sent.attachment_failures[0].filename, "broken.png");
    }

    #[test]
    fn non_members_are_gated_everywhere() {
        let db = testing::db();
        let t = TenantId(1);
        let (ana, _, channel) = setup(&db, t);
        let outsider = testing::user(&db, t, "Cid");
        let c = ContainerRef::Channel(channel);
        let msg = db.send_message(t, c, ana, &text("hello")).unwrap().message;

        assert!(matches!(db.send_message(t, c, outsider, &text("hi")), Err(DomainError::Forbidden)));
        assert!(matches!(db.edit_message(t, c, outsider, msg.id, "x"), Err(DomainError::Forbidden)));
        assert!(matches!(db.delete_message(t, c, outsider, msg.id), Err(DomainError::Forbidden)));
        assert!(matches!(db.add_reaction(t, c, outsider, msg.id, "👍"), Err(DomainError::Forbidden)));
    }

    #[test]
    fn same_numeric_id_in_another_tenant_is_gated() {
        let db = testing::db();
        let (ana, _, channel) = setup(&db, TenantId(1));
        let eve = testing::user(&db, TenantId(2), "Eve");
        let c = ContainerRef::Channel(channel);
        let msg = db.send_message(TenantId(1), c, ana, &text("secret")).unwrap().message;

        assert!(matches!(db.send_message(TenantId(2), c, eve, &text("hi")), Err(DomainError::Forbidden)));
        assert!(matches!(
            db.list_messages(TenantId(2), c, eve, Page::default()),
            Err(DomainError::Forbidden)
        ));
        // Even a member id cannot read a message through the wrong tenant.
        assert!(matches!(db.get_message(TenantId(2), c, ana, msg.id), Err(DomainError::Forbidden)));
    }

    #[test]
    fn edit_is_author_only_and_delete_allows_moderators() {
        let db = testing::db();
        let t = TenantId(1);
        let (ana, bob, channel) = setup(&db, t);
        let c = ContainerRef::Channel(channel);
        let msg = db.send_message(t, c, bob, &text("draft")).unwrap().message;

        assert!(matches!(db.edit_message(t, c, ana, msg.id, "nope"), Err(DomainError::Forbidden)));
        let edited = db.edit_message(t, c, bob, msg.id, "final").unwrap();
        assert!(edited.is_edited && edited.edited_at.is_some());

        let own = db.send_message(t, c, ana, &text("admin note")).unwrap().message;
        assert!(matches!(db.delete_message(t, c, bob, own.id), Err(DomainError::Forbidden)));
        db.delete_message(t, c, ana, msg.id).unwrap();
        assert!(matches!(db.get_message(t, c, ana, msg.id), Err(DomainError::NotFound)));
    }

    #[test]
    fn direct_delete_is_author_only_and_pin_is_open() {
        let db = testing::db();
        let t = TenantId(1);
        let ana = testing::user(&db, t, "Ana");
        let bob = testing::user(&db, t, "Bob");
        let dm = db.create_conversation(t, ana, &[bob], None).unwrap().conversation;
        let c = ContainerRef::Conversation(dm.id);
        let msg = db.send_message(t, c, ana, &text("hey")).unwrap().message;

        assert!(matches!(db.delete_message(t, c, bob, msg.id), Err(DomainError::Forbidden)));
        let pinned = db.toggle_pin(t, c, bob, msg.id).unwrap();
        assert!(pinned.is_pinned && pinned.pinned_at.is_some());
        let unpinned = db.toggle_pin(t, c, ana, msg.id).unwrap();
        assert!(!unpinned.is_pinned && unpinned.pinned_at.is_none());
    }

    #[test]
    fn channel_pin_needs_moderator() {
        let db = testing::db();
        let t = TenantId(1);
        let (ana, bob, channel) = setup(&db, t);
        let c = ContainerRef::Channel(channel);
        let msg = db.send_message(t, c, bob, &text("pin me")).unwrap().message;

        assert!(matches!(db.toggle_pin(t, c, bob, msg.id), Err(DomainError::Forbidden)));
        db.set_member_role(t, ana, channel, bob, Role::Moderator).unwrap();
        assert!(db.toggle_pin(t, c, bob, msg.id).unwrap().is_pinned);
    }

    #[test]
    fn reactions_are_unique_and_grouped() {
        let db = testing::db();
        let t = TenantId(1);
        let (ana, bob, channel) = setup(&db, t);
        let c = ContainerRef::Channel(channel);
        let msg = db.send_message(t, c, ana, &text("vote")).unwrap().message;

        db.add_reaction(t, c, ana, msg.id, "👍").unwrap();
        let change = db.add_reaction(t, c, bob, msg.id, "👍").unwrap();
        assert_eq!(change.reactions.len(), 1);
        assert_eq!(change.reactions[0].count, 2);
        assert!(matches!(db.add_reaction(t, c, bob, msg.id, "👍"), Err(DomainError::DuplicateReaction)));

        db.remove_reaction(t, c, bob, msg.id, "👍").unwrap();
        assert!(matches!(db.remove_reaction(t, c, bob, msg.id, "👍"), Err(DomainError::NotFound)));
        assert_eq!(db.get_message(t, c, bob, msg.id).unwrap().reactions[0].user_ids, vec![ana]);
    }

    #[test]
    fn concurrent_duplicate_reactions_store_one_row() {
        let db = Arc::new(testing::db());
        let t = TenantId(1);
        let (ana, _, channel) = setup(&db, t);
        let c = ContainerRef::Channel(channel);
        let msg = db.send_message(t, c, ana, &text("race")).unwrap().message;

        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let db = Arc::clone(&db);
                    s.spawn(move || db.add_reaction(t, c, ana, msg.id, "🎉"))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(results.iter().filter(|r| matches!(r, Err(DomainError::DuplicateReaction))).count(), 1);
        assert_eq!(db.get_message(t, c, ana, msg.id).unwrap().reactions[0].count, 1);
    }

    #[test]
    fn history_pages_newest_first() {
        let db = testing::db();
        let t = TenantId(1);
        let (ana, _, channel) = setup(&db, t);
        let c = ContainerRef::Channel(channel);
        let ids: Vec<MessageId> = (0..5)
            .map(|i| db.send_message(t, c, ana, &text(&format!("m{}", i))).unwrap().message.id)
            .collect();

        let first = db.list_messages(t, c, ana, Page { limit: 2, ..Default::default() }).unwrap();
        assert_eq!(first.iter().map(|m| m.id).collect::<Vec<_>>(), vec![ids[4], ids[3]]);

        let older = db
            .list_messages(t, c, ana, Page { limit: 2, before_id: Some(ids[3]), after_id: None })
            .unwrap();
        assert_eq!(older.iter().map(|m| m.id).collect::<Vec<_>>(), vec![ids[2], ids[1]]);

        let newer = db
            .list_messages(t, c, ana, Page { limit: 2, before_id: None, after_id: Some(ids[1]) })
            .unwrap();
        assert_eq!(newer.iter().map(|m| m.id).collect::<Vec<_>>(), vec![ids[3], ids[2]]);

        // Zero is clamped up to one.
        assert_eq!(db.list_messages(t, c, ana, Page { limit: 0, ..Default::default() }).unwrap().len(), 1);
    }

    #[test]
    fn unread_count_follows_the_read_cursor() {
        let db = testing::db();
        let t = TenantId(1);
        let (ana, bob, channel) = setup(&db, t);
        let c = ContainerRef::Channel(channel);

        for i in 0..3 {
            db.send_message(t, c, ana, &text(&format!("n{}", i))).unwrap();
        }
        db.send_message(t, c, bob, &text("own messages never count")).unwrap();
        assert_eq!(db.unread_count(t, c, bob).unwrap(), 3);

        db.mark_read(t, c, bob, None).unwrap();
        assert_eq!(db.unread_count(t, c, bob).unwrap(), 0);

        db.send_message(t, c, ana, &text("one more")).unwrap();
        assert_eq!(db.unread_count(t, c, bob).unwrap(), 1);
    }

    #[test]
    fn future_read_positions_are_clamped() {
        let db = testing::db();
        let t = TenantId(1);
        let (ana, bob, channel) = setup(&db, t);
        let c = ContainerRef::Channel(channel);

        let tomorrow = db.now() + chrono::Duration::days(1);
        let cursor = db.mark_read(t, c, bob, Some(tomorrow)).unwrap();
        assert!(cursor < tomorrow);

        db.send_message(t, c, ana, &text("still unread")).unwrap();
        assert_eq!(db.unread_count(t, c, bob).unwrap(), 1);
    }

    fn max_message_id(db: &Database) -> i64 {
        db.with_conn(|conn| Ok(conn.query_row("SELECT COALESCE(MAX(id), 0) FROM messages", [], |r| r.get(0))?))
            .unwrap()
    }

    #[test]
    fn concurrent_sends_and_reads_agree_on_order() {
        let db = testing::db();
        let t = TenantId(1);
        let (ana, bob, channel) = setup(&db, t);
        let c = ContainerRef::Channel(channel);

        // (highest id before, cursor, highest id after) for every mark_read.
        let db = &db;
        let cursors: Vec<(i64, i64, i64)> = std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(move || {
                    for i in 0..100 {
                        db.send_message(t, c, ana, &text(&format!("m{}", i))).unwrap();
                    }
                });
            }
            let readers: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(move || {
                        (0..100)
                            .map(|_| {
                                let before = max_message_id(db);
                                let cursor = crate::to_micros(db.mark_read(t, c, bob, None).unwrap());
                                (before, cursor, max_message_id(db))
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            readers.into_iter().flat_map(|r| r.join().unwrap()).collect()
        });

        let messages: Vec<(i64, i64)> = db
            .with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT id, created_at FROM messages ORDER BY id")?;
                let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .unwrap();
        assert_eq!(messages.len(), 400);
        assert!(messages.windows(2).all(|w| w[0].1 < w[1].1), "created_at must follow id order");

        for (before, cursor, after) in cursors {
            for &(id, created_at) in &messages {
                if id <= before {
                    assert!(created_at < cursor, "message {} committed before the cursor sorts after it", id);
                }
                if id > after {
                    assert!(created_at > cursor, "message {} committed after the cursor counts as read", id);
                }
            }
        }
    }
}
