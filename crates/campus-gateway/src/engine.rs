//! Loads the audience for a committed mutation, plans the events and
//! publishes them. Runs after the write; failures are logged and counted,
//! never rolled back or returned to the caller.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use campus_db::notifications::NewNotification;
use campus_db::{Database, DomainError};
use campus_types::events::Topic;
use campus_types::models::Message;
use campus_types::{ChannelId, ContainerRef, TenantId, UserId};

use crate::dispatcher::Dispatcher;
use crate::fanout::{Audience, Mutation, mention_payload, plan};
use crate::mentions::resolve_mentions;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub planned: usize,
    pub delivered: usize,
    /// Deliveries to connections that had already gone away.
    pub dropped: usize,
    /// Audience lookups or notification schedules that failed.
    pub failures: usize,
    /// Durable notifications queued for offline mentioned users.
    pub scheduled: usize,
}

#[derive(Clone)]
pub struct FanoutEngine {
    db: Arc<Database>,
    dispatcher: Dispatcher,
}

impl FanoutEngine {
    pub fn new(db: Arc<Database>, dispatcher: Dispatcher) -> Self {
        Self { db, dispatcher }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub async fn dispatch(&self, tenant: TenantId, mutation: Mutation) -> FanoutReport {
        let mut report = FanoutReport::default();

        let audience = match self.load_audience(tenant, &mutation).await {
            Ok(audience) => audience,
            Err(e) => {
                // Container-topic events still go out; per-user ones need the audience.
                warn!("Fan-out audience for tenant {} could not be loaded: {}", tenant, e);
                report.failures += 1;
                Audience::default()
            }
        };

        let events = plan(tenant, &mutation, &audience);
        report.planned = events.len();
        for event in &events {
            let delivery = self.dispatcher.publish(event).await;
            report.delivered += delivery.delivered;
            report.dropped += delivery.dropped;
        }

        match &mutation {
            Mutation::MessageSent(message) => {
                self.schedule_offline_mentions(tenant, message, &audience, &mut report).await;
            }
            // Former members stop hearing the channel once their removal is out.
            Mutation::MemberRemoved(change) => {
                let topics = channel_topics(change.channel.id);
                self.dispatcher.revoke(tenant, Some(change.user.id), &topics).await;
            }
            Mutation::ChannelDeleted(channel) => {
                self.dispatcher.revoke(tenant, None, &channel_topics(channel.id)).await;
            }
            _ => {}
        }

        if report.dropped > 0 || report.failures > 0 {
            warn!(
                "Fan-out in tenant {}: {} planned, {} delivered, {} dropped, {} failures",
                tenant, report.planned, report.delivered, report.dropped, report.failures
            );
        } else {
            debug!(
                "Fan-out in tenant {}: {} planned, {} delivered",
                tenant, report.planned, report.delivered
            );
        }
        report
    }

    async fn load_audience(&self, tenant: TenantId, mutation: &Mutation) -> Result<Audience, DomainError> {
        match mutation {
            Mutation::MessageSent(message) => {
                let container = message.container;
                let present = self
                    .dispatcher
                    .subscribed_users(tenant, Topic::presence_for(container))
                    .await;
                let message = message.clone();
                let mut audience = blocking(&self.db, move |db| message_audience(db, tenant, &message)).await?;
                audience.present = present;
                Ok(audience)
            }
            Mutation::ConversationCreated { conversation, participants } => {
                let id = conversation.id;
                let participants = participants.clone();
                blocking(&self.db, move |db| {
                    let mut snapshots = HashMap::new();
                    for user in &participants {
                        snapshots.insert(*user, db.conversation_snapshot(tenant, id, *user)?);
                    }
                    Ok(Audience {
                        members: participants,
                        snapshots,
                        ..Default::default()
                    })
                })
                .await
            }
            _ => Ok(Audience::default()),
        }
    }

    async fn schedule_offline_mentions(
        &self,
        tenant: TenantId,
        message: &Message,
        audience: &Audience,
        report: &mut FanoutReport,
    ) {
        let mut offline = Vec::new();
        for &user in &audience.mentioned {
            if user != message.author.id
                && audience.members.contains(&user)
                && !self.dispatcher.is_connected(tenant, user).await
            {
                offline.push(user);
            }
        }
        if offline.is_empty() {
            return;
        }

        let payload = mention_payload(message);
        let reference = format!("message:{}", message.id);
        let result = blocking(&self.db, move |db| {
            let mut scheduled = 0;
            for user in offline {
                let channels = db.contact(tenant, user)?.channels();
                if channels.is_empty() {
                    continue;
                }
                db.schedule_notification(
                    tenant,
                    &NewNotification {
                        recipient: user,
                        kind: "user.mentioned".to_string(),
                        reference: reference.clone(),
                        payload: payload.clone(),
                        channels,
                        scheduled_at: None,
                    },
                )?;
                scheduled += 1;
            }
            Ok(scheduled)
        })
        .await;

        match result {
            Ok(n) => report.scheduled += n,
            Err(e) => {
                warn!("Scheduling offline mention notifications failed: {}", e);
                report.failures += 1;
            }
        }
    }
}

fn channel_topics(id: ChannelId) -> [Topic; 2] {
    [Topic::Channel(id), Topic::PresenceChannel(id)]
}

fn message_audience(db: &Database, tenant: TenantId, message: &Message) -> Result<Audience, DomainError> {
    let container = message.container;
    let author = message.author.id;
    let members = db.member_summaries(tenant, container)?;
    let member_ids: Vec<UserId> = members.iter().map(|m| m.id).collect();
    let mentioned = resolve_mentions(&message.content, &members, author);

    let mut audience = Audience {
        members: member_ids,
        mentioned,
        ..Default::default()
    };

    match container {
        ContainerRef::Channel(channel_id) => {
            audience.channel_name = Some(db.channel_name(tenant, channel_id)?);
            audience.muted = db.muted_members(tenant, channel_id)?.into_iter().collect::<HashSet<_>>();
            for &user in &audience.members {
                if user != author {
                    audience.unread.insert(user, db.unread_count(tenant, container, user)?);
                }
            }
        }
        ContainerRef::Conversation(conversation_id) => {
            for &user in &audience.members {
                if user != author {
                    audience
                        .snapshots
                        .insert(user, db.conversation_snapshot(tenant, conversation_id, user)?);
                }
            }
        }
    }
    Ok(audience)
}

/// Run a store call off the async runtime.
async fn blocking<T, F>(db: &Arc<Database>, f: F) -> Result<T, DomainError>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> Result<T, DomainError> + Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| DomainError::Internal(anyhow::anyhow!("fan-out task failed: {}", e)))?
}
