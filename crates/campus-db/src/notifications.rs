//! Durable notifications for recipients who were not connected when the
//! event happened. Each event fans out to one delivery row per channel;
//! the event status is derived from those rows.

use campus_types::models::{DeliveryStatus, NotificationChannel};
use campus_types::{NotificationId, TenantId, UserId};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use crate::users::{effective_tenant, query_user};
use crate::{Database, DomainError, from_micros, to_micros};

/// Attempts per channel before it is given up on.
pub const MAX_DELIVERY_ATTEMPTS: i64 = 3;

#[derive(Debug, Clone)]
pub struct NewNotification {
    pub recipient: UserId,
    pub kind: String,
    pub reference: String,
    pub payload: serde_json::Value,
    pub channels: Vec<NotificationChannel>,
    /// Defaults to now.
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Where a user can be reached outside the app.
#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    pub user_id: UserId,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub whatsapp: Option<String>,
}

impl Contact {
    /// Channels this contact has an address for.
    pub fn channels(&self) -> Vec<NotificationChannel> {
        let mut out = Vec::new();
        if self.whatsapp.is_some() {
            out.push(NotificationChannel::Whatsapp);
        }
        if self.phone.is_some() {
            out.push(NotificationChannel::Sms);
        }
        if self.email.is_some() {
            out.push(NotificationChannel::Email);
        }
        out
    }

    pub fn address(&self, channel: NotificationChannel) -> Option<&str> {
        match channel {
            NotificationChannel::Whatsapp => self.whatsapp.as_deref(),
            NotificationChannel::Sms => self.phone.as_deref(),
            NotificationChannel::Email => self.email.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryState {
    pub channel: NotificationChannel,
    pub status: DeliveryStatus,
    pub attempts: i64,
    pub provider_response: Option<String>,
}

impl DeliveryState {
    /// Still worth another attempt.
    pub fn retryable(&self) -> bool {
        self.status == DeliveryStatus::Pending && self.attempts < MAX_DELIVERY_ATTEMPTS
    }
}

#[derive(Debug, Clone)]
pub struct NotificationRecord {
    pub id: NotificationId,
    pub tenant_id: TenantId,
    pub recipient: Contact,
    pub kind: String,
    pub reference: String,
    pub payload: serde_json::Value,
    pub scheduled_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub deliveries: Vec<DeliveryState>,
}

/// Any channel sent => sent; every channel failed => failed; otherwise pending.
/// An event with no channels has nothing left to do and counts as sent.
pub fn derive_event_status(deliveries: &[DeliveryState]) -> DeliveryStatus {
    if deliveries.is_empty() || deliveries.iter().any(|d| d.status == DeliveryStatus::Sent) {
        DeliveryStatus::Sent
    } else if deliveries.iter().all(|d| d.status == DeliveryStatus::Failed) {
        DeliveryStatus::Failed
    } else {
        DeliveryStatus::Pending
    }
}

impl Database {
    pub fn schedule_notification(&self, tenant: TenantId, new: &NewNotification) -> Result<NotificationId, DomainError> {
        self.with_tx(|tx| {
            let now = self.now_micros();
            let scheduled = new.scheduled_at.map(to_micros).unwrap_or(now);
            // Recipient must belong to the tenant the event is stamped with.
            let row = query_user(tx, new.recipient)?.ok_or(DomainError::NotFound)?;
            if effective_tenant(tx, &row)? != Some(tenant) {
                return Err(DomainError::NotFound);
            }
            let status = if new.channels.is_empty() { DeliveryStatus::Sent } else { DeliveryStatus::Pending };

            tx.execute(
                "INSERT INTO notification_events (tenant_id, recipient_id, kind, reference, payload, scheduled_at, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    tenant.0,
                    new.recipient.0,
                    new.kind,
                    new.reference,
                    new.payload.to_string(),
                    scheduled,
                    status.as_str(),
                    now,
                ],
            )?;
            let id = NotificationId(tx.last_insert_rowid());

            for channel in &new.channels {
                tx.execute(
                    "INSERT OR IGNORE INTO notification_deliveries (event_id, channel, updated_at) VALUES (?1, ?2, ?3)",
                    params![id.0, channel.as_str(), now],
                )?;
            }

            info!("Notification {} ({}) scheduled for user {}", id, new.kind, new.recipient);
            Ok(id)
        })
    }

    /// Pending events due at `now`, across all tenants. Each record carries
    /// its own tenant; only the delivery worker calls this.
    pub fn due_notifications(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<NotificationRecord>, DomainError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM notification_events
                 WHERE status = 'pending' AND scheduled_at <= ?1
                 ORDER BY scheduled_at, id LIMIT ?2",
            )?;
            let ids = stmt
                .query_map(params![to_micros(now), limit], |r| r.get(0).map(NotificationId))?
                .collect::<Result<Vec<_>, _>>()?;

            let mut records = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(record) = load_record(conn, id)? {
                    records.push(record);
                }
            }
            Ok(records)
        })
    }

    pub fn get_notification(&self, id: NotificationId) -> Result<NotificationRecord, DomainError> {
        self.with_conn(|conn| load_record(conn, id)?.ok_or(DomainError::NotFound))
    }

    /// Record one provider call and recompute the event status, which is returned.
    pub fn record_delivery_attempt(
        &self,
        id: NotificationId,
        channel: NotificationChannel,
        delivered: bool,
        provider_response: &str,
    ) -> Result<DeliveryStatus, DomainError> {
        self.with_tx(|tx| {
            let now = self.now_micros();
            let attempts: i64 = tx
                .query_row(
                    "SELECT attempts FROM notification_deliveries WHERE event_id = ?1 AND channel = ?2",
                    params![id.0, channel.as_str()],
                    |r| r.get(0),
                )
                .optional()?
                .ok_or(DomainError::NotFound)?;
            let attempts = attempts + 1;
            let status = if delivered {
                DeliveryStatus::Sent
            } else if attempts >= MAX_DELIVERY_ATTEMPTS {
                DeliveryStatus::Failed
            } else {
                DeliveryStatus::Pending
            };

            tx.execute(
                "UPDATE notification_deliveries SET status = ?3, attempts = ?4, provider_response = ?5, updated_at = ?6
                 WHERE event_id = ?1 AND channel = ?2",
                params![id.0, channel.as_str(), status.as_str(), attempts, provider_response, now],
            )?;

            let event_status = derive_event_status(&deliveries(tx, id)?);
            tx.execute(
                "UPDATE notification_events SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.0, event_status.as_str(), now],
            )?;
            debug!(
                "Notification {} via {}: attempt {} -> {}, event {}",
                id, channel, attempts, status, event_status
            );
            Ok(event_status)
        })
    }

    /// Contact details of a tenant user.
    pub fn contact(&self, tenant: TenantId, user: UserId) -> Result<Contact, DomainError> {
        self.with_conn(|conn| {
            let row = query_user(conn, user)?.ok_or(DomainError::NotFound)?;
            if effective_tenant(conn, &row)? != Some(tenant) {
                return Err(DomainError::NotFound);
            }
            Ok(Contact {
                user_id: user,
                name: row.name,
                email: row.email,
                phone: row.phone,
                whatsapp: row.whatsapp,
            })
        })
    }
}

fn deliveries(conn: &Connection, id: NotificationId) -> Result<Vec<DeliveryState>, DomainError> {
    let mut stmt = conn.prepare(
        "SELECT channel, status, attempts, provider_response FROM notification_deliveries
         WHERE event_id = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map([id.0], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, Option<String>>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows
        .into_iter()
        .filter_map(|(channel, status, attempts, provider_response)| {
            Some(DeliveryState {
                channel: NotificationChannel::parse(&channel)?,
                status: DeliveryStatus::parse(&status).unwrap_or(DeliveryStatus::Pending),
                attempts,
                provider_response,
            })
        })
        .collect())
}

fn load_record(conn: &Connection, id: NotificationId) -> Result<Option<NotificationRecord>, DomainError> {
    let row = conn
        .query_row(
            "SELECT e.tenant_id, e.recipient_id, e.kind, e.reference, e.payload, e.scheduled_at, e.status,
                    u.name, u.email, u.phone, u.whatsapp
             FROM notification_events e JOIN users u ON u.id = e.recipient_id
             WHERE e.id = ?1",
            [id.0],
            |r| {
                Ok((
                    (r.get::<_, i64>(0)?, r.get::<_, i64>(1)?, r.get::<_, String>(2)?, r.get::<_, String>(3)?),
                    (r.get::<_, String>(4)?, r.get::<_, i64>(5)?, r.get::<_, String>(6)?),
                    Contact {
                        user_id: UserId(r.get(1)?),
                        name: r.get(7)?,
                        email: r.get(8)?,
                        phone: r.get(9)?,
                        whatsapp: r.get(10)?,
                    },
                ))
            },
        )
        .optional()?;

    let Some(((tenant, _, kind, reference), (payload, scheduled_at, status), recipient)) = row else {
        return Ok(None);
    };
    Ok(Some(NotificationRecord {
        id,
        tenant_id: TenantId(tenant),
        recipient,
        kind,
        reference,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        scheduled_at: from_micros(scheduled_at),
        status: DeliveryStatus::parse(&status).unwrap_or(DeliveryStatus::Pending),
        deliveries: deliveries(conn, id)?,
    }))
}
