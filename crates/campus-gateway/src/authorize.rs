//! Subscription authorization. Runs against the database on every
//! subscribe; nothing is cached between attempts.

use std::sync::Arc;

use campus_db::{Database, DomainError};
use campus_types::ContainerRef;
use campus_types::events::Topic;
use thiserror::Error;
use tracing::debug;

use crate::dispatcher::Identity;

/// Why a subscription was refused. Only ever logged; the client sees the
/// same generic rejection for all of them.
#[derive(Debug, Error)]
pub enum Denial {
    #[error("topic belongs to another user")]
    OtherUser,
    #[error("container does not exist")]
    UnknownContainer,
    #[error("container belongs to another tenant")]
    TenantMismatch,
    #[error("not a member")]
    NotMember,
    #[error("lookup failed: {0}")]
    Lookup(#[from] DomainError),
}

pub async fn authorize(db: &Arc<Database>, identity: &Identity, topic: Topic) -> Result<(), Denial> {
    let result = match topic {
        Topic::Global => Ok(()),
        Topic::User(id) if id == identity.user_id() => Ok(()),
        Topic::User(_) => Err(Denial::OtherUser),
        _ => match topic.container() {
            Some(container) => check_container(db, identity, container).await,
            None => Err(Denial::UnknownContainer),
        },
    };

    if let Err(ref denial) = result {
        debug!(
            user_id = %identity.user_id(),
            tenant_id = %identity.tenant_id,
            "Subscription to {} denied: {}",
            topic,
            denial
        );
    }
    result
}

/// Two steps: find the container's tenant without scoping, compare it to
/// the subscriber's, then check membership inside that tenant.
async fn check_container(db: &Arc<Database>, identity: &Identity, container: ContainerRef) -> Result<(), Denial> {
    let db = db.clone();
    let identity = identity.clone();

    tokio::task::spawn_blocking(move || {
        let owner = match container {
            ContainerRef::Channel(id) => db.channel_tenant_unscoped(id)?,
            ContainerRef::Conversation(id) => db.conversation_tenant_unscoped(id)?,
        };
        match owner {
            None => Err(Denial::UnknownContainer),
            Some(tenant) if tenant != identity.tenant_id => Err(Denial::TenantMismatch),
            Some(tenant) => {
                if db.is_member(tenant, container, identity.user_id())? {
                    Ok(())
                } else {
                    Err(Denial::NotMember)
                }
            }
        }
    })
    .await
    .map_err(|e| Denial::Lookup(DomainError::Internal(anyhow::anyhow!("authorization task failed: {}", e))))?
}
