//! Pure fan-out planning: a committed mutation plus the audience loaded for
//! it becomes the list of realtime events to publish. No I/O happens here.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use campus_db::channels::MembershipChange;
use campus_db::messages::{DeletedMessage, ReactionChange};
use campus_types::events::{EventName, RealtimeEvent, Topic};
use campus_types::models::{Channel, Conversation, ConversationSnapshot, Message, PresenceRecord, UserSummary};
use campus_types::{ChannelId, ContainerRef, TenantId, UserId};

/// Characters of message content carried in notification previews.
pub const PREVIEW_CHARS: usize = 200;

/// A state change that has already been committed.
#[derive(Debug, Clone)]
pub enum Mutation {
    MessageSent(Message),
    MessageEdited(Message),
    MessageDeleted(DeletedMessage),
    ReactionAdded(ReactionChange),
    ReactionRemoved(ReactionChange),
    PinToggled(Message),
    ChannelCreated { channel: Channel, members: Vec<UserId> },
    ChannelUpdated(Channel),
    ChannelDeleted(Channel),
    MemberAdded(MembershipChange),
    MemberRemoved(MembershipChange),
    RoleChanged(MembershipChange),
    ConversationCreated { conversation: Conversation, participants: Vec<UserId> },
    ReadAdvanced {
        container: ContainerRef,
        user: UserId,
        read_at: DateTime<Utc>,
        unread_count: i64,
    },
    ChannelUnmuted { channel_id: ChannelId, user: UserId },
    Typing { container: ContainerRef, user: UserSummary, started: bool },
    PresenceChanged(PresenceRecord),
}

/// Data the planner needs beyond the mutation itself.
#[derive(Debug, Clone, Default)]
pub struct Audience {
    /// Current members/participants of the container.
    pub members: Vec<UserId>,
    /// Users subscribed to the container's presence topic.
    pub present: HashSet<UserId>,
    pub muted: HashSet<UserId>,
    /// Unread count per recipient, after the mutation.
    pub unread: HashMap<UserId, i64>,
    /// Per-recipient conversation snapshot, for direct messages.
    pub snapshots: HashMap<UserId, ConversationSnapshot>,
    pub mentioned: Vec<UserId>,
    pub channel_name: Option<String>,
}

pub fn preview(content: &str) -> String {
    content.chars().take(PREVIEW_CHARS).collect()
}

pub fn plan(tenant: TenantId, mutation: &Mutation, audience: &Audience) -> Vec<RealtimeEvent> {
    let mut out = Vec::new();
    let mut emit = |topic: Topic, event: EventName, payload: Value| {
        out.push(RealtimeEvent::new(tenant, topic, event, payload));
    };

    match mutation {
        Mutation::MessageSent(message) => {
            let topic = Topic::for_container(message.container);
            let author = message.author.id;
            let text = preview(&message.content);

            match message.container {
                ContainerRef::Channel(channel_id) => {
                    emit(topic, EventName::MessageSent, to_value(message));
                    for &user in &audience.members {
                        if user == author || audience.present.contains(&user) || audience.muted.contains(&user) {
                            continue;
                        }
                        emit(
                            Topic::User(user),
                            EventName::ChannelNotification,
                            json!({
                                "channel_id": channel_id,
                                "channel_name": audience.channel_name,
                                "message_id": message.id,
                                "preview": text,
                                "sender": message.author,
                                "unread_count": audience.unread.get(&user).copied().unwrap_or(0),
                            }),
                        );
                    }
                }
                ContainerRef::Conversation(_) => {
                    emit(topic, EventName::DmMessageSent, to_value(message));
                    for &user in &audience.members {
                        if user == author {
                            continue;
                        }
                        emit(
                            Topic::User(user),
                            EventName::DmNotification,
                            json!({
                                "conversation": audience.snapshots.get(&user),
                                "message_id": message.id,
                                "preview": text,
                                "sender": message.author,
                            }),
                        );
                    }
                }
            }

            for &user in &audience.mentioned {
                if user == author || !audience.members.contains(&user) {
                    continue;
                }
                emit(Topic::User(user), EventName::UserMentioned, mention_payload(message));
            }
        }

        Mutation::MessageEdited(message) => {
            let event = match message.container {
                ContainerRef::Channel(_) => EventName::MessageEdited,
                ContainerRef::Conversation(_) => EventName::DmMessageEdited,
            };
            emit(Topic::for_container(message.container), event, to_value(message));
        }

        Mutation::MessageDeleted(deleted) => {
            let event = match deleted.container {
                ContainerRef::Channel(_) => EventName::MessageDeleted,
                ContainerRef::Conversation(_) => EventName::DmMessageDeleted,
            };
            emit(
                Topic::for_container(deleted.container),
                event,
                json!({
                    "message_id": deleted.message_id,
                    "container": deleted.container,
                    "parent_id": deleted.parent_id,
                }),
            );
        }

        Mutation::ReactionAdded(change) | Mutation::ReactionRemoved(change) => {
            let added = matches!(mutation, Mutation::ReactionAdded(_));
            let event = match (change.container, added) {
                (ContainerRef::Channel(_), true) => EventName::MessageReactionAdded,
                (ContainerRef::Channel(_), false) => EventName::MessageReactionRemoved,
                (ContainerRef::Conversation(_), true) => EventName::DmReactionAdded,
                (ContainerRef::Conversation(_), false) => EventName::DmReactionRemoved,
            };
            emit(
                Topic::for_container(change.container),
                event,
                json!({
                    "message_id": change.message_id,
                    "user_id": change.user_id,
                    "emoji": change.emoji,
                    "reactions": change.reactions,
                }),
            );
        }

        Mutation::PinToggled(message) => {
            emit(Topic::for_container(message.container), EventName::MessagePinned, to_value(message));
        }

        Mutation::ChannelCreated { channel, members } => {
            for &user in members {
                emit(Topic::User(user), EventName::ChannelCreated, to_value(channel));
            }
        }

        Mutation::ChannelUpdated(channel) => {
            emit(Topic::Channel(channel.id), EventName::ChannelUpdated, to_value(channel));
        }

        Mutation::ChannelDeleted(channel) => {
            let mut payload = to_value(channel);
            payload["deleted"] = Value::Bool(true);
            emit(Topic::Channel(channel.id), EventName::ChannelUpdated, payload);
        }

        Mutation::MemberAdded(change) => {
            emit(
                Topic::Channel(change.channel.id),
                EventName::UserJoined,
                json!({ "channel_id": change.channel.id, "user": change.user, "role": change.role }),
            );
            // Materialises the sidebar entry for the new member only.
            emit(Topic::User(change.user.id), EventName::ChannelCreated, to_value(&change.channel));
        }

        Mutation::MemberRemoved(change) => {
            emit(
                Topic::Channel(change.channel.id),
                EventName::UserLeft,
                json!({ "channel_id": change.channel.id, "user": change.user }),
            );
        }

        Mutation::RoleChanged(change) => {
            emit(
                Topic::Channel(change.channel.id),
                EventName::MemberRoleUpdated,
                json!({ "channel_id": change.channel.id, "user": change.user, "role": change.role }),
            );
        }

        Mutation::ConversationCreated { conversation, participants } => {
            for &user in participants {
                let payload = match audience.snapshots.get(&user) {
                    Some(snapshot) => to_value(snapshot),
                    None => json!({ "conversation": conversation, "participants": participants }),
                };
                emit(Topic::User(user), EventName::DmConversationCreated, payload);
            }
        }

        Mutation::ReadAdvanced { container, user, read_at, unread_count } => {
            emit(
                Topic::User(*user),
                EventName::UnreadUpdated,
                json!({
                    "container": container,
                    "conversation_type": container.conversation_type(),
                    "read_at": read_at,
                    "unread_count": unread_count,
                }),
            );
        }

        Mutation::ChannelUnmuted { channel_id, user } => {
            emit(Topic::User(*user), EventName::ChannelUnmuted, json!({ "channel_id": channel_id }));
        }

        Mutation::Typing { container, user, started } => {
            let event = if *started { EventName::UserTyping } else { EventName::UserStoppedTyping };
            emit(
                Topic::for_container(*container),
                event,
                json!({ "container": container, "user": user }),
            );
        }

        Mutation::PresenceChanged(record) => {
            emit(Topic::Global, EventName::PresenceUpdated, to_value(record));
        }
    }

    out
}

/// Payload of `user.mentioned`, also stored for offline delivery.
pub fn mention_payload(message: &Message) -> Value {
    json!({
        "message_id": message.id,
        "conversation_type": message.container.conversation_type(),
        "conversation_id": message.container.raw_id(),
        "sender": message.author,
        "preview": preview(&message.content),
    })
}

fn to_value<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use campus_types::models::MessageType;
    use campus_types::{ConversationId, MessageId};

    fn user(id: i64, name: &str) -> UserSummary {
        UserSummary { id: UserId(id), name: name.to_string(), handle: name.to_lowercase(), avatar: None }
    }

    fn message(container: ContainerRef, author: UserSummary, content: &str) -> Message {
        Message {
            id: MessageId(100),
            container,
            author,
            content: content.to_string(),
            message_type: MessageType::Text,
            parent_id: None,
            is_edited: false,
            is_pinned: false,
            edited_at: None,
            pinned_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            reply_count: 0,
            attachments: vec![],
            reactions: vec![],
        }
    }

    fn names(events: &[RealtimeEvent]) -> Vec<(String, &'static str)> {
        events.iter().map(|e| (e.topic.to_string(), e.event.as_str())).collect()
    }

    #[test]
    fn channel_message_notifies_absent_members() {
        let channel = ContainerRef::Channel(ChannelId(7));
        let msg = message(channel, user(1, "Ana"), &"x".repeat(300));
        let audience = Audience {
            members: vec![UserId(1), UserId(2), UserId(3), UserId(4)],
            present: HashSet::from([UserId(3)]),
            muted: HashSet::from([UserId(4)]),
            unread: HashMap::from([(UserId(2), 5)]),
            ..Default::default()
        };

        let events = plan(TenantId(1), &Mutation::MessageSent(msg), &audience);
        assert_eq!(
            names(&events),
            vec![
                ("channel.7".to_string(), "message.sent"),
                ("user.2".to_string(), "channel.notification"),
            ]
        );
        let payload = &events[1].payload;
        assert_eq!(payload["preview"].as_str().unwrap().chars().count(), PREVIEW_CHARS);
        assert_eq!(payload["unread_count"], 5);
        assert_eq!(payload["sender"]["id"], 1);
    }

    #[test]
    fn mentions_go_to_members_only() {
        let channel = ContainerRef::Channel(ChannelId(7));
        let msg = message(channel, user(1, "Ana"), "hello @bob");
        let audience = Audience {
            members: vec![UserId(1), UserId(2)],
            mentioned: vec![UserId(2), UserId(9), UserId(1)],
            ..Default::default()
        };

        let events = plan(TenantId(1), &Mutation::MessageSent(msg), &audience);
        let mention: Vec<_> = events.iter().filter(|e| e.event == EventName::UserMentioned).collect();
        assert_eq!(mention.len(), 1);
        assert_eq!(mention[0].topic, Topic::User(UserId(2)));
        assert_eq!(mention[0].payload["message_id"], 100);
        assert_eq!(mention[0].payload["conversation_type"], "channel");
    }

    #[test]
    fn direct_message_carries_recipient_snapshot() {
        let dm = ContainerRef::Conversation(ConversationId(4));
        let msg = message(dm, user(1, "Ana"), "hi");
        let snapshot = ConversationSnapshot {
            conversation: Conversation {
                id: ConversationId(4),
                tenant_id: TenantId(1),
                name: None,
                is_group: false,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            participants: vec![user(1, "Ana"), user(2, "Bob")],
            latest_message: Some(msg.clone()),
            unread_count: 1,
        };
        let audience = Audience {
            members: vec![UserId(1), UserId(2)],
            snapshots: HashMap::from([(UserId(2), snapshot)]),
            ..Default::default()
        };

        let events = plan(TenantId(1), &Mutation::MessageSent(msg), &audience);
        assert_eq!(
            names(&events),
            vec![("dm.4".to_string(), "dm.message.sent"), ("user.2".to_string(), "dm.notification")]
        );
        let conversation = &events[1].payload["conversation"];
        assert_eq!(conversation["participants"].as_array().unwrap().len(), 2);
        assert_eq!(conversation["latest_message"]["id"], 100);
        assert_eq!(conversation["unread_count"], 1);
    }

    #[test]
    fn every_event_is_stamped_with_the_tenant() {
        let events = plan(
            TenantId(9),
            &Mutation::PresenceChanged(PresenceRecord {
                user_id: UserId(1),
                status: campus_types::models::PresenceStatus::Online,
                last_seen: Utc::now(),
            }),
            &Audience::default(),
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tenant_id, TenantId(9));
        assert_eq!(events[0].topic, Topic::Global);
    }

    #[test]
    fn read_cursor_goes_to_the_reader_only() {
        let events = plan(
            TenantId(1),
            &Mutation::ReadAdvanced {
                container: ContainerRef::Conversation(ConversationId(3)),
                user: UserId(2),
                read_at: Utc::now(),
                unread_count: 0,
            },
            &Audience::default(),
        );
        assert_eq!(names(&events), vec![("user.2".to_string(), "unread.updated")]);
        assert_eq!(events[0].payload["conversation_type"], "direct");
    }
}
