use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, trace};
use uuid::Uuid;

use campus_types::events::{RealtimeEvent, ServerFrame, Topic};
use campus_types::models::UserSummary;
use campus_types::{TenantId, UserId};

/// Who owns a connection. Fixed for the connection's lifetime.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user: UserSummary,
    pub tenant_id: TenantId,
}

impl Identity {
    pub fn user_id(&self) -> UserId {
        self.user.id
    }
}

/// Outcome of one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    /// Subscribed connections whose send queue was already closed.
    pub dropped: usize,
}

struct ConnectionEntry {
    identity: Identity,
    topics: HashSet<Topic>,
    tx: mpsc::UnboundedSender<ServerFrame>,
}

/// Registry of live connections and their authorized topics.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// conn_id -> connection
    connections: RwLock<HashMap<Uuid, ConnectionEntry>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                connections: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a connection. It starts subscribed to its own `user.{id}` topic.
    pub async fn register(&self, identity: Identity) -> (Uuid, mpsc::UnboundedReceiver<ServerFrame>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = HashSet::new();
        topics.insert(Topic::User(identity.user_id()));

        self.inner
            .connections
            .write()
            .await
            .insert(conn_id, ConnectionEntry { identity, topics, tx });
        (conn_id, rx)
    }

    /// Drop a connection. Returns its identity and how many connections
    /// the same user still has open.
    pub async fn unregister(&self, conn_id: Uuid) -> Option<(Identity, usize)> {
        let mut connections = self.inner.connections.write().await;
        let entry = connections.remove(&conn_id)?;
        let remaining = connections
            .values()
            .filter(|c| {
                c.identity.user_id() == entry.identity.user_id() && c.identity.tenant_id == entry.identity.tenant_id
            })
            .count();
        Some((entry.identity, remaining))
    }

    /// Record an already-authorized subscription. Returns false for unknown connections.
    pub async fn add_subscription(&self, conn_id: Uuid, topic: Topic) -> bool {
        match self.inner.connections.write().await.get_mut(&conn_id) {
            Some(entry) => {
                entry.topics.insert(topic);
                true
            }
            None => false,
        }
    }

    pub async fn remove_subscription(&self, conn_id: Uuid, topic: Topic) -> bool {
        self.inner
            .connections
            .write()
            .await
            .get_mut(&conn_id)
            .is_some_and(|entry| entry.topics.remove(&topic))
    }

    /// Drop `topics` from every connection in `tenant` that `user` matches
    /// (all users when `None`), telling each affected connection. Returns
    /// how many subscriptions were removed.
    pub async fn revoke(&self, tenant: TenantId, user: Option<UserId>, topics: &[Topic]) -> usize {
        let mut connections = self.inner.connections.write().await;
        let mut revoked = 0;
        for entry in connections.values_mut() {
            if entry.identity.tenant_id != tenant || user.is_some_and(|u| u != entry.identity.user_id()) {
                continue;
            }
            for topic in topics {
                if entry.topics.remove(topic) {
                    revoked += 1;
                    let _ = entry.tx.send(ServerFrame::SubscriptionRevoked { topic: *topic });
                }
            }
        }
        if revoked > 0 {
            debug!("Revoked {} subscription(s) in tenant {}", revoked, tenant);
        }
        revoked
    }

    pub async fn is_subscribed(&self, conn_id: Uuid, topic: Topic) -> bool {
        self.inner
            .connections
            .read()
            .await
            .get(&conn_id)
            .is_some_and(|entry| entry.topics.contains(&topic))
    }

    /// Deliver to every connection subscribed to the event's topic inside
    /// the event's tenant. Other tenants never see it, whatever they hold.
    pub async fn publish(&self, event: &RealtimeEvent) -> Delivery {
        let connections = self.inner.connections.read().await;
        let mut delivery = Delivery::default();

        for entry in connections.values() {
            if entry.identity.tenant_id != event.tenant_id || !entry.topics.contains(&event.topic) {
                continue;
            }
            if entry.tx.send(ServerFrame::Event(event.clone())).is_ok() {
                delivery.delivered += 1;
            } else {
                delivery.dropped += 1;
            }
        }

        trace!(
            "Published {} on {} to {} connection(s)",
            event.event, event.topic, delivery.delivered
        );
        delivery
    }

    /// Send a frame to one connection only.
    pub async fn send_to_connection(&self, conn_id: Uuid, frame: ServerFrame) -> bool {
        match self.inner.connections.read().await.get(&conn_id) {
            Some(entry) => entry.tx.send(frame).is_ok(),
            None => {
                debug!("Frame for unknown connection {} dropped", conn_id);
                false
            }
        }
    }

    /// Users of `tenant` holding a subscription to `topic`.
    pub async fn subscribed_users(&self, tenant: TenantId, topic: Topic) -> HashSet<UserId> {
        self.inner
            .connections
            .read()
            .await
            .values()
            .filter(|c| c.identity.tenant_id == tenant && c.topics.contains(&topic))
            .map(|c| c.identity.user_id())
            .collect()
    }

    /// Identities currently joined to a presence topic, one per user.
    pub async fn roster(&self, tenant: TenantId, topic: Topic) -> Vec<UserSummary> {
        let connections = self.inner.connections.read().await;
        let mut seen = HashSet::new();
        let mut members: Vec<UserSummary> = connections
            .values()
            .filter(|c| c.identity.tenant_id == tenant && c.topics.contains(&topic))
            .filter(|c| seen.insert(c.identity.user_id()))
            .map(|c| c.identity.user.clone())
            .collect();
        members.sort_by_key(|u| u.id);
        members
    }

    pub async fn is_connected(&self, tenant: TenantId, user: UserId) -> bool {
        self.inner
            .connections
            .read()
            .await
            .values()
            .any(|c| c.identity.tenant_id == tenant && c.identity.user_id() == user)
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }
}
