pub mod authorize;
pub mod connection;
pub mod dispatcher;
pub mod engine;
pub mod fanout;
pub mod identify;
pub mod mentions;
pub mod presence;
pub mod signaling;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use campus_db::{Database, DomainError};
use campus_types::models::{PresenceRecord, PresenceStatus, UserSummary};
use campus_types::{ContainerRef, TenantId, UserId};

use crate::dispatcher::{Dispatcher, Identity};
use crate::engine::{FanoutEngine, FanoutReport};
use crate::fanout::Mutation;
use crate::presence::{PresenceTracker, TypingMarker};

/// Everything the realtime side shares between connections and the HTTP layer.
#[derive(Clone)]
pub struct Gateway {
    pub db: Arc<Database>,
    pub dispatcher: Dispatcher,
    pub engine: FanoutEngine,
    pub presence: Arc<PresenceTracker>,
}

impl Gateway {
    pub fn new(db: Arc<Database>) -> Self {
        let dispatcher = Dispatcher::new();
        Self {
            engine: FanoutEngine::new(db.clone(), dispatcher.clone()),
            db,
            dispatcher,
            presence: Arc::new(PresenceTracker::new()),
        }
    }

    /// Fan out a committed mutation.
    pub async fn publish(&self, tenant: TenantId, mutation: Mutation) -> FanoutReport {
        self.engine.dispatch(tenant, mutation).await
    }

    async fn publish_presence(&self, tenant: TenantId, record: Option<PresenceRecord>) {
        if let Some(record) = record {
            self.publish(tenant, Mutation::PresenceChanged(record)).await;
        }
    }

    pub async fn user_connected(&self, identity: &Identity) {
        let record = self.presence.connected(identity.tenant_id, identity.user_id(), Utc::now());
        self.publish_presence(identity.tenant_id, record).await;
    }

    /// Drop a connection; the user goes offline when it was their last one.
    pub async fn connection_closed(&self, conn_id: Uuid) {
        let Some((identity, remaining)) = self.dispatcher.unregister(conn_id).await else {
            return;
        };
        if remaining > 0 {
            return;
        }
        let (record, cleared) = self
            .presence
            .disconnected(identity.tenant_id, identity.user_id(), Utc::now());
        self.publish_presence(identity.tenant_id, record).await;
        for marker in cleared {
            self.publish_typing(marker, Some(identity.user.clone()), false).await;
        }
    }

    pub async fn set_status(
        &self,
        tenant: TenantId,
        user: UserId,
        status: PresenceStatus,
        sent_at: Option<DateTime<Utc>>,
    ) -> PresenceRecord {
        let record = self.presence.set_status(tenant, user, status, sent_at, Utc::now());
        self.publish_presence(tenant, record).await;
        self.presence.get(tenant, user)
    }

    pub async fn heartbeat(&self, tenant: TenantId, user: UserId) -> PresenceRecord {
        let record = self.presence.heartbeat(tenant, user, Utc::now());
        self.publish_presence(tenant, record).await;
        self.presence.get(tenant, user)
    }

    /// Typing requires current membership of the container.
    pub async fn start_typing(
        &self,
        tenant: TenantId,
        user: &UserSummary,
        container: ContainerRef,
    ) -> Result<(), DomainError> {
        let db = self.db.clone();
        let user_id = user.id;
        let member = tokio::task::spawn_blocking(move || db.is_member(tenant, container, user_id))
            .await
            .map_err(|e| DomainError::Internal(anyhow::anyhow!("typing check failed: {}", e)))??;
        if !member {
            return Err(DomainError::Forbidden);
        }

        if self.presence.start_typing(tenant, user.id, container, Utc::now()) {
            let marker = TypingMarker { tenant_id: tenant, user_id: user.id, container };
            self.publish_typing(marker, Some(user.clone()), true).await;
        }
        Ok(())
    }

    pub async fn stop_typing(&self, tenant: TenantId, user: &UserSummary, container: ContainerRef) {
        if self.presence.stop_typing(tenant, user.id, container) {
            let marker = TypingMarker { tenant_id: tenant, user_id: user.id, container };
            self.publish_typing(marker, Some(user.clone()), false).await;
        }
    }

    async fn publish_typing(&self, marker: TypingMarker, user: Option<UserSummary>, started: bool) {
        let user = match user {
            Some(user) => user,
            None => {
                let db = self.db.clone();
                let lookup = tokio::task::spawn_blocking(move || db.user_summary(marker.tenant_id, marker.user_id)).await;
                match lookup {
                    Ok(Ok(user)) => user,
                    _ => UserSummary {
                        id: marker.user_id,
                        name: String::new(),
                        handle: String::new(),
                        avatar: None,
                    },
                }
            }
        };
        self.publish(
            marker.tenant_id,
            Mutation::Typing { container: marker.container, user, started },
        )
        .await;
    }

    /// Expire typing markers and idle users, publishing the changes.
    pub async fn sweep(&self) {
        let sweep = self.presence.sweep(Utc::now());
        if !sweep.expired_typing.is_empty() || !sweep.went_idle.is_empty() {
            debug!(
                "Presence sweep: {} typing expired, {} idle",
                sweep.expired_typing.len(),
                sweep.went_idle.len()
            );
        }
        for marker in sweep.expired_typing {
            self.publish_typing(marker, None, false).await;
        }
        for (tenant, record) in sweep.went_idle {
            self.publish(tenant, Mutation::PresenceChanged(record)).await;
        }
    }

    /// Background sweep loop, ticking every `period`.
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let gateway = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            info!("Presence sweeper running every {:?}", period);
            loop {
                interval.tick().await;
                gateway.sweep().await;
            }
        })
    }
}
