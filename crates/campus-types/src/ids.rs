use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse().map($name)
            }
        }

        impl From<i64> for $name {
            fn from(v: i64) -> Self {
                $name(v)
            }
        }
    };
}

id_type!(
    /// The merchant (school) that owns a record.
    TenantId
);
id_type!(UserId);
id_type!(ChannelId);
id_type!(ConversationId);
id_type!(MessageId);
id_type!(AttachmentId);
id_type!(NotificationId);

/// The container a message lives in. Exactly one variant, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum ContainerRef {
    Channel(ChannelId),
    Conversation(ConversationId),
}

impl ContainerRef {
    /// Value used in payloads so clients can route a notification click.
    pub fn conversation_type(&self) -> &'static str {
        match self {
            Self::Channel(_) => "channel",
            Self::Conversation(_) => "direct",
        }
    }

    pub fn raw_id(&self) -> i64 {
        match self {
            Self::Channel(id) => id.0,
            Self::Conversation(id) => id.0,
        }
    }
}

impl fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(id) => write!(f, "channel:{}", id),
            Self::Conversation(id) => write!(f, "conversation:{}", id),
        }
    }
}
