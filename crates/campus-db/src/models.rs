//! Database row types: these map directly to SQLite rows.
//! Distinct from campus-types API models to keep the DB layer independent.

use campus_types::models::{
    Attachment, Channel, Conversation, Message, MessageType, ReactionGroup, UserSummary, Visibility,
};
use campus_types::{AttachmentId, ChannelId, ContainerRef, ConversationId, MessageId, TenantId, UserId};
use rusqlite::Row;

use crate::from_micros;

pub struct UserRow {
    pub id: i64,
    pub tenant_id: Option<i64>,
    pub parent_id: Option<i64>,
    pub name: String,
    pub handle: String,
    pub avatar: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub whatsapp: Option<String>,
    pub is_super_admin: bool,
}

impl UserRow {
    pub const COLUMNS: &'static str =
        "id, tenant_id, parent_id, name, handle, avatar, email, phone, whatsapp, is_super_admin";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            parent_id: row.get(2)?,
            name: row.get(3)?,
            handle: row.get(4)?,
            avatar: row.get(5)?,
            email: row.get(6)?,
            phone: row.get(7)?,
            whatsapp: row.get(8)?,
            is_super_admin: row.get(9)?,
        })
    }

    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: UserId(self.id),
            name: self.name.clone(),
            handle: self.handle.clone(),
            avatar: self.avatar.clone(),
        }
    }
}

pub struct ChannelRow {
    pub id: i64,
    pub tenant_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub visibility: String,
    pub icon: Option<String>,
    pub color: Option<String>,
    pub is_active: bool,
    pub created_by: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ChannelRow {
    pub const COLUMNS: &'static str = "c.id, c.tenant_id, c.name, c.description, c.visibility, c.icon, \
         c.color, c.is_active, c.created_by, c.created_at, c.updated_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            visibility: row.get(4)?,
            icon: row.get(5)?,
            color: row.get(6)?,
            is_active: row.get(7)?,
            created_by: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    pub fn into_model(self) -> Channel {
        Channel {
            id: ChannelId(self.id),
            tenant_id: TenantId(self.tenant_id),
            name: self.name,
            description: self.description,
            visibility: Visibility::parse(&self.visibility).unwrap_or(Visibility::Private),
            icon: self.icon,
            color: self.color,
            is_active: self.is_active,
            created_by: UserId(self.created_by),
            created_at: from_micros(self.created_at),
            updated_at: from_micros(self.updated_at),
        }
    }
}

pub struct ConversationRow {
    pub id: i64,
    pub tenant_id: i64,
    pub name: Option<String>,
    pub is_group: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ConversationRow {
    pub const COLUMNS: &'static str = "d.id, d.tenant_id, d.name, d.is_group, d.created_at, d.updated_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            name: row.get(2)?,
            is_group: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    pub fn into_model(self) -> Conversation {
        Conversation {
            id: ConversationId(self.id),
            tenant_id: TenantId(self.tenant_id),
            name: self.name,
            is_group: self.is_group,
            created_at: from_micros(self.created_at),
            updated_at: from_micros(self.updated_at),
        }
    }
}

/// A message row joined with its author.
pub struct MessageRow {
    pub id: i64,
    pub channel_id: Option<i64>,
    pub conversation_id: Option<i64>,
    pub author: UserSummary,
    pub content: String,
    pub message_type: String,
    pub parent_id: Option<i64>,
    pub is_edited: bool,
    pub is_pinned: bool,
    pub edited_at: Option<i64>,
    pub pinned_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub reply_count: i64,
}

impl MessageRow {
    /// Select list for `messages m LEFT JOIN users u ON u.id = m.author_id`.
    pub const COLUMNS: &'static str = "m.id, m.channel_id, m.conversation_id, m.author_id, u.name, u.handle, \
         u.avatar, m.content, m.message_type, m.parent_id, m.is_edited, m.is_pinned, m.edited_at, \
         m.pinned_at, m.created_at, m.updated_at, \
         (SELECT COUNT(*) FROM messages r WHERE r.parent_id = m.id AND r.deleted_at IS NULL)";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            channel_id: row.get(1)?,
            conversation_id: row.get(2)?,
            author: UserSummary {
                id: UserId(row.get(3)?),
                name: row.get::<_, Option<String>>(4)?.unwrap_or_else(|| "unknown".to_string()),
                handle: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                avatar: row.get(6)?,
            },
            content: row.get(7)?,
            message_type: row.get(8)?,
            parent_id: row.get(9)?,
            is_edited: row.get(10)?,
            is_pinned: row.get(11)?,
            edited_at: row.get(12)?,
            pinned_at: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
            reply_count: row.get(16)?,
        })
    }

    pub fn container(&self) -> Option<ContainerRef> {
        match (self.channel_id, self.conversation_id) {
            (Some(id), None) => Some(ContainerRef::Channel(ChannelId(id))),
            (None, Some(id)) => Some(ContainerRef::Conversation(ConversationId(id))),
            _ => None,
        }
    }

    pub fn into_model(
        self,
        container: ContainerRef,
        attachments: Vec<Attachment>,
        reactions: Vec<ReactionGroup>,
    ) -> Message {
        Message {
            id: MessageId(self.id),
            container,
            author: self.author,
            content: self.content,
            message_type: MessageType::parse(&self.message_type).unwrap_or_default(),
            parent_id: self.parent_id.map(MessageId),
            is_edited: self.is_edited,
            is_pinned: self.is_pinned,
            edited_at: self.edited_at.map(from_micros),
            pinned_at: self.pinned_at.map(from_micros),
            created_at: from_micros(self.created_at),
            updated_at: from_micros(self.updated_at),
            reply_count: self.reply_count,
            attachments,
            reactions,
        }
    }
}

pub struct ReactionRow {
    pub message_id: i64,
    pub user_id: i64,
    pub emoji: String,
}

pub struct AttachmentRow {
    pub id: i64,
    pub message_id: i64,
    pub filename: String,
    pub mime_type: String,
    pub size: i64,
    pub storage_path: String,
    pub metadata: Option<String>,
}

impl AttachmentRow {
    pub fn into_model(self) -> Attachment {
        Attachment {
            id: AttachmentId(self.id),
            filename: self.filename,
            mime_type: self.mime_type,
            size: self.size,
            storage_path: self.storage_path,
            metadata: self.metadata.and_then(|m| serde_json::from_str(&m).ok()),
        }
    }
}
