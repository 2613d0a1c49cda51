//! In-memory presence and typing state. Every mutator returns what changed
//! so the caller can publish it; nothing here talks to the network.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use campus_types::models::{PresenceRecord, PresenceStatus};
use campus_types::{ContainerRef, TenantId, UserId};

/// Typing markers expire this long after the last `start_typing`.
pub const TYPING_TTL: Duration = Duration::seconds(8);

/// Online users without a heartbeat for this long are shown as away.
pub const IDLE_AFTER: Duration = Duration::minutes(5);

type UserKey = (TenantId, UserId);
type TypingKey = (TenantId, UserId, ContainerRef);

#[derive(Debug, Clone)]
struct Entry {
    status: PresenceStatus,
    last_seen: DateTime<Utc>,
    /// Client time of the last applied explicit change.
    changed_at: Option<DateTime<Utc>>,
    /// Set when the status was lowered to away by the idle sweep.
    idle: bool,
}

/// Typing marker that just expired or was cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingMarker {
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub container: ContainerRef,
}

#[derive(Debug, Default)]
pub struct Sweep {
    pub expired_typing: Vec<TypingMarker>,
    pub went_idle: Vec<(TenantId, PresenceRecord)>,
}

#[derive(Default)]
pub struct PresenceTracker {
    users: Mutex<HashMap<UserKey, Entry>>,
    typing: Mutex<HashMap<TypingKey, DateTime<Utc>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tenant: TenantId, user: UserId) -> PresenceRecord {
        let users = lock(&self.users);
        match users.get(&(tenant, user)) {
            Some(entry) => record(user, entry),
            None => PresenceRecord {
                user_id: user,
                status: PresenceStatus::Offline,
                last_seen: DateTime::<Utc>::UNIX_EPOCH,
            },
        }
    }

    /// First connection of a user. Returns the record if the status changed.
    pub fn connected(&self, tenant: TenantId, user: UserId, now: DateTime<Utc>) -> Option<PresenceRecord> {
        let mut users = lock(&self.users);
        let entry = users.entry((tenant, user)).or_insert(Entry {
            status: PresenceStatus::Offline,
            last_seen: now,
            changed_at: None,
            idle: false,
        });
        entry.last_seen = now;
        if entry.status == PresenceStatus::Offline {
            entry.status = PresenceStatus::Online;
            entry.idle = false;
            return Some(record(user, entry));
        }
        None
    }

    /// Last connection closed: offline, and any typing markers are cleared.
    pub fn disconnected(
        &self,
        tenant: TenantId,
        user: UserId,
        now: DateTime<Utc>,
    ) -> (Option<PresenceRecord>, Vec<TypingMarker>) {
        let changed = {
            let mut users = lock(&self.users);
            users.get_mut(&(tenant, user)).and_then(|entry| {
                entry.last_seen = now;
                entry.idle = false;
                if entry.status == PresenceStatus::Offline {
                    return None;
                }
                entry.status = PresenceStatus::Offline;
                Some(record(user, entry))
            })
        };

        let mut typing = lock(&self.typing);
        let cleared: Vec<TypingMarker> = typing
            .keys()
            .filter(|(t, u, _)| *t == tenant && *u == user)
            .map(|&(tenant_id, user_id, container)| TypingMarker { tenant_id, user_id, container })
            .collect();
        for marker in &cleared {
            typing.remove(&(marker.tenant_id, marker.user_id, marker.container));
        }
        (changed, cleared)
    }

    /// Explicit status change. Updates carrying a client time older than the
    /// last applied one are discarded.
    pub fn set_status(
        &self,
        tenant: TenantId,
        user: UserId,
        status: PresenceStatus,
        sent_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<PresenceRecord> {
        let mut users = lock(&self.users);
        let entry = users.entry((tenant, user)).or_insert(Entry {
            status: PresenceStatus::Offline,
            last_seen: now,
            changed_at: None,
            idle: false,
        });

        let stamp = sent_at.unwrap_or(now);
        if entry.changed_at.is_some_and(|applied| stamp < applied) {
            return None;
        }
        entry.changed_at = Some(stamp);
        entry.last_seen = now;
        entry.idle = false;
        entry.status = status;
        Some(record(user, entry))
    }

    /// Refresh last_seen. Returns a record when an idle user came back.
    pub fn heartbeat(&self, tenant: TenantId, user: UserId, now: DateTime<Utc>) -> Option<PresenceRecord> {
        let mut users = lock(&self.users);
        let entry = users.get_mut(&(tenant, user))?;
        entry.last_seen = now;
        if entry.idle && entry.status == PresenceStatus::Away {
            entry.idle = false;
            entry.status = PresenceStatus::Online;
            return Some(record(user, entry));
        }
        None
    }

    /// Returns true when the marker is new; a refresh only extends it.
    pub fn start_typing(&self, tenant: TenantId, user: UserId, container: ContainerRef, now: DateTime<Utc>) -> bool {
        lock(&self.typing)
            .insert((tenant, user, container), now + TYPING_TTL)
            .is_none()
    }

    /// Returns true if a marker was removed.
    pub fn stop_typing(&self, tenant: TenantId, user: UserId, container: ContainerRef) -> bool {
        lock(&self.typing).remove(&(tenant, user, container)).is_some()
    }

    pub fn is_typing(&self, tenant: TenantId, user: UserId, container: ContainerRef) -> bool {
        lock(&self.typing).contains_key(&(tenant, user, container))
    }

    /// Expire typing markers and mark idle users away.
    pub fn sweep(&self, now: DateTime<Utc>) -> Sweep {
        let mut sweep = Sweep::default();

        {
            let mut typing = lock(&self.typing);
            typing.retain(|&(tenant_id, user_id, container), expires| {
                if *expires <= now {
                    sweep.expired_typing.push(TypingMarker { tenant_id, user_id, container });
                    false
                } else {
                    true
                }
            });
        }

        let mut users = lock(&self.users);
        for (&(tenant, user), entry) in users.iter_mut() {
            if entry.status == PresenceStatus::Online && now - entry.last_seen >= IDLE_AFTER {
                entry.status = PresenceStatus::Away;
                entry.idle = true;
                sweep.went_idle.push((tenant, record(user, entry)));
            }
        }
        sweep
    }
}

fn record(user: UserId, entry: &Entry) -> PresenceRecord {
    PresenceRecord {
        user_id: user,
        status: entry.status,
        last_seen: entry.last_seen,
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // Plain maps; a panic mid-update leaves them usable.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use campus_types::ChannelId;

    const T: TenantId = TenantId(1);
    const U: UserId = UserId(10);

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(1_700_000_000 + secs)
    }

    #[test]
    fn stale_status_updates_are_discarded() {
        let tracker = PresenceTracker::new();
        assert!(tracker.set_status(T, U, PresenceStatus::Away, Some(at(10)), at(10)).is_some());
        assert!(tracker.set_status(T, U, PresenceStatus::Online, Some(at(5)), at(11)).is_none());
        assert_eq!(tracker.get(T, U).status, PresenceStatus::Away);
    }

    #[test]
    fn connect_and_disconnect_toggle_online() {
        let tracker = PresenceTracker::new();
        assert_eq!(tracker.connected(T, U, at(0)).unwrap().status, PresenceStatus::Online);
        assert!(tracker.connected(T, U, at(1)).is_none());

        let room = ContainerRef::Channel(ChannelId(1));
        tracker.start_typing(T, U, room, at(2));
        let (record, cleared) = tracker.disconnected(T, U, at(3));
        assert_eq!(record.unwrap().status, PresenceStatus::Offline);
        assert_eq!(cleared.len(), 1);
        assert!(!tracker.is_typing(T, U, room));
    }

    #[test]
    fn typing_expires_after_ttl() {
        let tracker = PresenceTracker::new();
        let room = ContainerRef::Channel(ChannelId(1));
        assert!(tracker.start_typing(T, U, room, at(0)));
        assert!(!tracker.start_typing(T, U, room, at(4)));

        assert!(tracker.sweep(at(11)).expired_typing.is_empty());
        let sweep = tracker.sweep(at(12));
        assert_eq!(sweep.expired_typing, vec![TypingMarker { tenant_id: T, user_id: U, container: room }]);
        assert!(!tracker.stop_typing(T, U, room));
    }

    #[test]
    fn idle_users_go_away_and_come_back() {
        let tracker = PresenceTracker::new();
        tracker.connected(T, U, at(0));

        assert!(tracker.sweep(at(299)).went_idle.is_empty());
        let sweep = tracker.sweep(at(300));
        assert_eq!(sweep.went_idle.len(), 1);
        assert_eq!(tracker.get(T, U).status, PresenceStatus::Away);

        assert_eq!(tracker.heartbeat(T, U, at(301)).unwrap().status, PresenceStatus::Online);
        assert!(tracker.heartbeat(T, U, at(302)).is_none());
    }

    #[test]
    fn explicit_away_is_not_undone_by_heartbeat() {
        let tracker = PresenceTracker::new();
        tracker.connected(T, U, at(0));
        tracker.set_status(T, U, PresenceStatus::Away, None, at(1));
        assert!(tracker.heartbeat(T, U, at(2)).is_none());
        assert_eq!(tracker.get(T, U).status, PresenceStatus::Away);
    }

    #[test]
    fn tenants_are_tracked_separately() {
        let tracker = PresenceTracker::new();
        tracker.connected(T, U, at(0));
        assert_eq!(tracker.get(TenantId(2), U).status, PresenceStatus::Offline);
    }
}
