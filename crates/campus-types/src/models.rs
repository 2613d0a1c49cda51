use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AttachmentId, ChannelId, ContainerRef, ConversationId, MessageId, TenantId, UserId};

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
    Direct,
}

string_enum!(Visibility { Public => "public", Private => "private", Direct => "direct" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Moderator,
    Member,
}

string_enum!(Role { Admin => "admin", Moderator => "moderator", Member => "member" });

/// What a user may do in a container, evaluated fresh on every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    None,
    Member,
    Moderator,
    Admin,
}

impl Capability {
    pub fn is_member(self) -> bool {
        self >= Capability::Member
    }

    pub fn can_moderate(self) -> bool {
        self >= Capability::Moderator
    }
}

impl From<Role> for Capability {
    fn from(role: Role) -> Self {
        match role {
            Role::Admin => Capability::Admin,
            Role::Moderator => Capability::Moderator,
            Role::Member => Capability::Member,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
    System,
}

string_enum!(MessageType { Text => "text", Image => "image", File => "file", System => "system" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

string_enum!(PresenceStatus { Online => "online", Away => "away", Offline => "offline" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationChannel {
    Whatsapp,
    Sms,
    Email,
}

string_enum!(NotificationChannel { Whatsapp => "whatsapp", Sms => "sms", Email => "email" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

string_enum!(DeliveryStatus { Pending => "pending", Sent => "sent", Failed => "failed" });

/// Public identity of a user, safe to embed in any payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    pub name: String,
    pub handle: String,
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub tenant_id: TenantId,
    pub name: String,
    pub description: Option<String>,
    pub visibility: Visibility,
    pub icon: Option<String>,
    pub color: Option<String>,
    pub is_active: bool,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub user: UserSummary,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    pub last_read_at: Option<DateTime<Utc>>,
    pub muted: bool,
}

/// A channel as seen from one member's sidebar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelListing {
    #[serde(flatten)]
    pub channel: Channel,
    pub role: Role,
    pub unread_count: i64,
    pub muted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub tenant_id: TenantId,
    pub name: Option<String>,
    pub is_group: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything a client needs to render a conversation in its sidebar
/// without a follow-up fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub conversation: Conversation,
    pub participants: Vec<UserSummary>,
    pub latest_message: Option<Message>,
    pub unread_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: AttachmentId,
    pub filename: String,
    pub mime_type: String,
    pub size: i64,
    pub storage_path: String,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: usize,
    pub user_ids: Vec<UserId>,
}

/// A message with author, attachments and reactions loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub container: ContainerRef,
    pub author: UserSummary,
    pub content: String,
    pub message_type: MessageType,
    pub parent_id: Option<MessageId>,
    pub is_edited: bool,
    pub is_pinned: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub pinned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub reply_count: i64,
    pub attachments: Vec<Attachment>,
    pub reactions: Vec<ReactionGroup>,
}

impl Message {
    pub fn channel_id(&self) -> Option<ChannelId> {
        match self.container {
            ContainerRef::Channel(id) => Some(id),
            ContainerRef::Conversation(_) => None,
        }
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        match self.container {
            ContainerRef::Conversation(id) => Some(id),
            ContainerRef::Channel(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
}
