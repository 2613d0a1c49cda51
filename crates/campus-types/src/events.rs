use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ids::{ChannelId, ContainerRef, ConversationId, TenantId, UserId};
use crate::models::{PresenceStatus, UserSummary};

/// A realtime publish/subscribe address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Channel(ChannelId),
    Direct(ConversationId),
    User(UserId),
    PresenceChannel(ChannelId),
    PresenceDirect(ConversationId),
    /// Tenant-wide; delivery is filtered by the event's tenant.
    Global,
}

impl Topic {
    pub fn for_container(container: ContainerRef) -> Self {
        match container {
            ContainerRef::Channel(id) => Topic::Channel(id),
            ContainerRef::Conversation(id) => Topic::Direct(id),
        }
    }

    pub fn presence_for(container: ContainerRef) -> Self {
        match container {
            ContainerRef::Channel(id) => Topic::PresenceChannel(id),
            ContainerRef::Conversation(id) => Topic::PresenceDirect(id),
        }
    }

    /// The container a channel/dm/presence topic refers to.
    pub fn container(&self) -> Option<ContainerRef> {
        match *self {
            Topic::Channel(id) | Topic::PresenceChannel(id) => Some(ContainerRef::Channel(id)),
            Topic::Direct(id) | Topic::PresenceDirect(id) => Some(ContainerRef::Conversation(id)),
            Topic::User(_) | Topic::Global => None,
        }
    }

    pub fn is_presence(&self) -> bool {
        matches!(self, Topic::PresenceChannel(_) | Topic::PresenceDirect(_))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Channel(id) => write!(f, "channel.{}", id),
            Topic::Direct(id) => write!(f, "dm.{}", id),
            Topic::User(id) => write!(f, "user.{}", id),
            Topic::PresenceChannel(id) => write!(f, "presence-channel.{}", id),
            Topic::PresenceDirect(id) => write!(f, "presence-dm.{}", id),
            Topic::Global => f.write_str("global"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTopic(pub String);

impl fmt::Display for InvalidTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid topic '{}'", self.0)
    }
}

impl std::error::Error for InvalidTopic {}

impl FromStr for Topic {
    type Err = InvalidTopic;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "global" {
            return Ok(Topic::Global);
        }
        let (prefix, id) = s.split_once('.').ok_or_else(|| InvalidTopic(s.to_string()))?;
        let id: i64 = id.parse().map_err(|_| InvalidTopic(s.to_string()))?;
        match prefix {
            "channel" => Ok(Topic::Channel(ChannelId(id))),
            "dm" => Ok(Topic::Direct(ConversationId(id))),
            "user" => Ok(Topic::User(UserId(id))),
            "presence-channel" => Ok(Topic::PresenceChannel(ChannelId(id))),
            "presence-dm" => Ok(Topic::PresenceDirect(ConversationId(id))),
            _ => Err(InvalidTopic(s.to_string())),
        }
    }
}

impl Serialize for Topic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

macro_rules! event_names {
    ($($variant:ident => $text:literal),+ $(,)?) => {
        /// Name tag carried by every realtime event.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum EventName {
            $(#[serde(rename = $text)] $variant,)+
        }

        impl EventName {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }
    };
}

event_names! {
    ChannelCreated => "channel.created",
    ChannelUpdated => "channel.updated",
    ChannelNotification => "channel.notification",
    ChannelUnmuted => "channel.unmuted",
    MessageSent => "message.sent",
    MessageEdited => "message.edited",
    MessageDeleted => "message.deleted",
    MessagePinned => "message.pinned",
    MessageReactionAdded => "message.reaction.added",
    MessageReactionRemoved => "message.reaction.removed",
    UserJoined => "user.joined",
    UserLeft => "user.left",
    MemberRoleUpdated => "member.role_updated",
    UserMentioned => "user.mentioned",
    UserTyping => "user.typing",
    UserStoppedTyping => "user.stopped_typing",
    PresenceUpdated => "presence.updated",
    DmConversationCreated => "dm.conversation.created",
    DmMessageSent => "dm.message.sent",
    DmMessageEdited => "dm.message.edited",
    DmMessageDeleted => "dm.message.deleted",
    DmReactionAdded => "dm.reaction.added",
    DmReactionRemoved => "dm.reaction.removed",
    DmNotification => "dm.notification",
    UnreadUpdated => "unread.updated",
    CallInitiated => "call.initiated",
    CallAnswered => "call.answered",
    WebrtcOffer => "webrtc.offer",
    WebrtcAnswer => "webrtc.answer",
    WebrtcIceCandidate => "webrtc.ice-candidate",
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One addressed delivery: topic, event name and JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    pub tenant_id: TenantId,
    pub topic: Topic,
    pub event: EventName,
    pub payload: serde_json::Value,
}

impl RealtimeEvent {
    pub fn new(tenant_id: TenantId, topic: Topic, event: EventName, payload: serde_json::Value) -> Self {
        Self {
            tenant_id,
            topic,
            event,
            payload,
        }
    }
}

/// Frames sent FROM server TO client over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerFrame {
    /// Server confirms successful authentication
    Ready {
        user_id: UserId,
        name: String,
        tenant_id: TenantId,
    },

    /// Subscription accepted; presence topics carry the current roster.
    Subscribed {
        topic: Topic,
        members: Option<Vec<UserSummary>>,
    },

    /// Generic rejection, identical for every denial reason.
    SubscriptionRejected { topic: Topic },

    /// The server dropped a subscription because membership ended.
    SubscriptionRevoked { topic: Topic },

    Event(RealtimeEvent),
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    Subscribe { topic: Topic },

    Unsubscribe { topic: Topic },

    StartTyping { container: ContainerRef },

    StopTyping { container: ContainerRef },

    /// Refresh last_seen without changing status
    Heartbeat,

    SetStatus {
        status: PresenceStatus,
        sent_at: Option<DateTime<Utc>>,
    },

    /// Call signaling relayed on `dm.{conversation_id}`
    Signal {
        conversation_id: ConversationId,
        target_user_id: Option<UserId>,
        signal: SignalPayload,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Audio,
    Video,
}

/// WebRTC negotiation and call lifecycle payload relayed between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal_type")]
pub enum SignalPayload {
    CallInitiated { call_kind: CallKind },
    CallAnswered { accepted: bool },
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_m_line_index: Option<u16>,
    },
}

impl SignalPayload {
    pub fn event_name(&self) -> EventName {
        match self {
            SignalPayload::CallInitiated { .. } => EventName::CallInitiated,
            SignalPayload::CallAnswered { .. } => EventName::CallAnswered,
            SignalPayload::Offer { .. } => EventName::WebrtcOffer,
            SignalPayload::Answer { .. } => EventName::WebrtcAnswer,
            SignalPayload::IceCandidate { .. } => EventName::WebrtcIceCandidate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names_match_wire_format() {
        assert_eq!(Topic::Channel(ChannelId(7)).to_string(), "channel.7");
        assert_eq!(Topic::Direct(ConversationId(42)).to_string(), "dm.42");
        assert_eq!(Topic::PresenceDirect(ConversationId(3)).to_string(), "presence-dm.3");
        assert_eq!("presence-channel.9".parse::<Topic>(), Ok(Topic::PresenceChannel(ChannelId(9))));
        assert_eq!("global".parse::<Topic>(), Ok(Topic::Global));
    }

    #[test]
    fn malformed_topics_are_rejected() {
        assert!("channel".parse::<Topic>().is_err());
        assert!("channel.abc".parse::<Topic>().is_err());
        assert!("room.1".parse::<Topic>().is_err());
    }

    #[test]
    fn event_serializes_with_string_topic_and_name() {
        let event = RealtimeEvent::new(
            TenantId(1),
            Topic::User(UserId(5)),
            EventName::WebrtcIceCandidate,
            serde_json::json!({ "x": 1 }),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["topic"], "user.5");
        assert_eq!(json["event"], "webrtc.ice-candidate");
        assert_eq!(EventName::WebrtcIceCandidate.as_str(), "webrtc.ice-candidate");
    }

    #[test]
    fn commands_parse_from_client_json() {
        let cmd: GatewayCommand =
            serde_json::from_str(r#"{"type":"Subscribe","data":{"topic":"dm.4"}}"#).unwrap();
        assert!(matches!(cmd, GatewayCommand::Subscribe { topic: Topic::Direct(ConversationId(4)) }));

        let cmd: GatewayCommand = serde_json::from_str(
            r#"{"type":"Signal","data":{"conversation_id":4,"target_user_id":null,"signal":{"signal_type":"Offer","sdp":"v=0"}}}"#,
        )
        .unwrap();
        match cmd {
            GatewayCommand::Signal { signal, .. } => assert_eq!(signal.event_name(), EventName::WebrtcOffer),
            other => panic!("unexpected command {:?}", other),
        }
    }
}
