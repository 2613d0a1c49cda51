use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use campus_db::notifications::NotificationRecord;
use campus_db::{Database, DomainError};
use campus_types::models::{DeliveryStatus, NotificationChannel};

use crate::error::ProviderError;
use crate::provider::{DeliveryRequest, Providers};

/// Events picked up per poll.
const BATCH_SIZE: u32 = 100;

/// Counters for one pass over the due events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerPass {
    pub events: usize,
    pub attempts: usize,
    pub delivered: usize,
    pub failed: usize,
}

pub struct DeliveryWorker {
    db: Arc<Database>,
    providers: Providers,
}

impl DeliveryWorker {
    pub fn new(db: Arc<Database>, providers: Providers) -> Self {
        Self { db, providers }
    }

    /// Attempt every retryable channel of every due event once.
    pub async fn run_once(&self) -> Result<WorkerPass, DomainError> {
        let db = self.db.clone();
        let due = tokio::task::spawn_blocking(move || db.due_notifications(Utc::now(), BATCH_SIZE))
            .await
            .map_err(|e| DomainError::Internal(anyhow::anyhow!("notification poll failed: {}", e)))??;

        let mut pass = WorkerPass { events: due.len(), ..Default::default() };
        for record in &due {
            for delivery in record.deliveries.iter().filter(|d| d.retryable()) {
                let outcome = self.attempt(record, delivery.channel).await;
                pass.attempts += 1;

                let (delivered, response) = match outcome {
                    Ok(body) => {
                        pass.delivered += 1;
                        (true, body)
                    }
                    Err(e) => {
                        pass.failed += 1;
                        warn!(
                            "Notification {} via {} to user {} failed: {}",
                            record.id, delivery.channel, record.recipient.user_id, e
                        );
                        (false, e.to_string())
                    }
                };

                let db = self.db.clone();
                let (id, channel) = (record.id, delivery.channel);
                let status = tokio::task::spawn_blocking(move || {
                    db.record_delivery_attempt(id, channel, delivered, &response)
                })
                .await
                .map_err(|e| DomainError::Internal(anyhow::anyhow!("delivery bookkeeping failed: {}", e)))??;

                if status != DeliveryStatus::Pending {
                    debug!("Notification {} settled as {}", id, status);
                }
            }
        }

        if pass.attempts > 0 {
            info!(
                "Notification pass: {} events, {} attempts, {} delivered, {} failed",
                pass.events, pass.attempts, pass.delivered, pass.failed
            );
        }
        Ok(pass)
    }

    async fn attempt(&self, record: &NotificationRecord, channel: NotificationChannel) -> Result<String, ProviderError> {
        let to = record
            .recipient
            .address(channel)
            .ok_or_else(|| ProviderError::NoAddress(channel.to_string()))?;
        let provider = self
            .providers
            .get(channel)
            .ok_or_else(|| ProviderError::NotConfigured(channel.to_string()))?;

        let request = DeliveryRequest {
            to: to.to_string(),
            channel,
            kind: record.kind.clone(),
            payload: record.payload.clone(),
        };
        provider.deliver(&request).await
    }

    /// Poll forever, every `period`.
    pub fn spawn(self, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            info!("Notification worker polling every {:?}", period);
            loop {
                interval.tick().await;
                if let Err(e) = self.run_once().await {
                    warn!("Notification pass failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use campus_db::notifications::NewNotification;
    use campus_db::users::NewUser;
    use campus_types::{TenantId, UserId};

    use crate::provider::DeliveryProvider;

    /// Records requests; fails while `failing` is set.
    #[derive(Default)]
    struct MockProvider {
        sent: Mutex<Vec<DeliveryRequest>>,
        failing: bool,
    }

    #[async_trait]
    impl DeliveryProvider for MockProvider {
        async fn deliver(&self, request: &DeliveryRequest) -> Result<String, ProviderError> {
            if self.failing {
                return Err(ProviderError::Rejected { status: 503, body: "unavailable".into() });
            }
            self.sent.lock().unwrap().push(request.clone());
            Ok("queued".into())
        }
    }

    fn setup(email: bool, phone: bool) -> (Arc<Database>, UserId) {
        let db = Database::open_in_memory().unwrap();
        let user = db
            .create_user(&NewUser {
                tenant_id: Some(TenantId(1)),
                name: "Bea".into(),
                handle: "bea".into(),
                email: email.then(|| "bea@example.com".to_string()),
                phone: phone.then(|| "+15550100".to_string()),
                ..Default::default()
            })
            .unwrap();
        (Arc::new(db), user)
    }

    fn schedule(db: &Database, user: UserId, channels: Vec<NotificationChannel>) -> campus_types::NotificationId {
        db.schedule_notification(
            TenantId(1),
            &NewNotification {
                recipient: user,
                kind: "user.mentioned".into(),
                reference: "message:1".into(),
                payload: serde_json::json!({ "message_id": 1 }),
                channels,
                scheduled_at: None,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn one_successful_channel_marks_event_sent() {
        let (db, user) = setup(true, true);
        let id = schedule(&db, user, vec![NotificationChannel::Sms, NotificationChannel::Email]);

        let email = Arc::new(MockProvider::default());
        let sms = Arc::new(MockProvider { failing: true, ..Default::default() });
        let providers = Providers::new()
            .with(NotificationChannel::Email, email.clone())
            .with(NotificationChannel::Sms, sms);
        let worker = DeliveryWorker::new(db.clone(), providers);

        let pass = worker.run_once().await.unwrap();
        assert_eq!(pass.attempts, 2);
        assert_eq!(pass.delivered, 1);

        let record = db.get_notification(id).unwrap();
        assert_eq!(record.status, DeliveryStatus::Sent);
        let sent = email.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "bea@example.com");

        // Sent events are no longer due.
        assert_eq!(worker.run_once().await.unwrap().events, 0);
    }

    #[tokio::test]
    async fn failing_channels_give_up_after_three_attempts() {
        let (db, user) = setup(true, false);
        let id = schedule(&db, user, vec![NotificationChannel::Email]);

        let providers = Providers::new().with(
            NotificationChannel::Email,
            Arc::new(MockProvider { failing: true, ..Default::default() }),
        );
        let worker = DeliveryWorker::new(db.clone(), providers);

        for _ in 0..3 {
            worker.run_once().await.unwrap();
        }
        let record = db.get_notification(id).unwrap();
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.deliveries[0].attempts, 3);
        assert_eq!(worker.run_once().await.unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn unconfigured_channel_counts_as_failed_attempt() {
        let (db, user) = setup(false, true);
        let id = schedule(&db, user, vec![NotificationChannel::Sms]);
        let worker = DeliveryWorker::new(db.clone(), Providers::new());

        let pass = worker.run_once().await.unwrap();
        assert_eq!(pass.failed, 1);
        let record = db.get_notification(id).unwrap();
        assert_eq!(record.deliveries[0].attempts, 1);
        assert_eq!(record.status, DeliveryStatus::Pending);
        assert!(record.deliveries[0].provider_response.as_deref().unwrap().contains("no provider"));
    }
}
