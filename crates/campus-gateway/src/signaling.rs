//! Call signaling relay and TURN credentials.
//!
//! Signals are republished on the conversation topic, stamped with the
//! sender. Only a connection currently subscribed to that topic may signal,
//! and since a connection's commands run one at a time, per-sender order holds.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha1::Sha1;
use tracing::{debug, trace};
use uuid::Uuid;

use campus_types::api::TurnCredentials;
use campus_types::events::{RealtimeEvent, SignalPayload, Topic};
use campus_types::{ConversationId, UserId};

use crate::dispatcher::{Delivery, Dispatcher, Identity};

type HmacSha1 = Hmac<Sha1>;

/// Relay one signal. Returns `None` when the sender holds no subscription
/// to the conversation; the signal is then dropped.
pub async fn relay_signal(
    dispatcher: &Dispatcher,
    conn_id: Uuid,
    identity: &Identity,
    conversation_id: ConversationId,
    target_user_id: Option<UserId>,
    signal: SignalPayload,
) -> Option<Delivery> {
    let topic = Topic::Direct(conversation_id);
    if !dispatcher.is_subscribed(conn_id, topic).await {
        debug!(
            user_id = %identity.user_id(),
            "Signal for {} dropped: sender not subscribed",
            topic
        );
        return None;
    }

    let event = signal.event_name();
    let mut payload = serde_json::to_value(&signal).unwrap_or_else(|_| json!({}));
    payload["from_user_id"] = json!(identity.user_id());
    payload["conversation_id"] = json!(conversation_id);
    payload["target_user_id"] = json!(target_user_id);

    trace!("{} relayed on {} from {}", event, topic, identity.user_id());
    Some(
        dispatcher
            .publish(&RealtimeEvent::new(identity.tenant_id, topic, event, payload))
            .await,
    )
}

/// Time-limited TURN REST credentials:
/// `username = "{expiry}:{user_id}"`, `credential = base64(HMAC-SHA1(secret, username))`.
pub fn turn_credentials(
    secret: &str,
    user: UserId,
    ttl_secs: u64,
    urls: &[String],
    now: DateTime<Utc>,
) -> anyhow::Result<TurnCredentials> {
    let expiry = now.timestamp() + ttl_secs as i64;
    let username = format!("{}:{}", expiry, user);

    let mut mac = HmacSha1::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("invalid TURN secret: {}", e))?;
    mac.update(username.as_bytes());
    let credential = BASE64.encode(mac.finalize().into_bytes());

    Ok(TurnCredentials {
        username,
        credential,
        ttl: ttl_secs,
        urls: urls.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use campus_types::TenantId;
    use campus_types::events::{CallKind, EventName, ServerFrame};
    use campus_types::models::UserSummary;

    fn identity(user: i64) -> Identity {
        Identity {
            user: UserSummary { id: UserId(user), name: "U".into(), handle: "u".into(), avatar: None },
            tenant_id: TenantId(1),
        }
    }

    #[tokio::test]
    async fn unsubscribed_senders_are_dropped() {
        let dispatcher = Dispatcher::new();
        let caller = identity(1);
        let (conn, _rx) = dispatcher.register(caller.clone()).await;

        let signal = SignalPayload::Offer { sdp: "v=0".into() };
        assert!(relay_signal(&dispatcher, conn, &caller, ConversationId(4), None, signal).await.is_none());
    }

    #[tokio::test]
    async fn signals_reach_the_conversation_in_order() {
        let dispatcher = Dispatcher::new();
        let topic = Topic::Direct(ConversationId(4));
        let caller = identity(1);
        let callee = identity(2);
        let (caller_conn, _caller_rx) = dispatcher.register(caller.clone()).await;
        let (callee_conn, mut callee_rx) = dispatcher.register(callee).await;
        dispatcher.add_subscription(caller_conn, topic).await;
        dispatcher.add_subscription(callee_conn, topic).await;

        let signals = [
            SignalPayload::CallInitiated { call_kind: CallKind::Video },
            SignalPayload::Offer { sdp: "v=0".into() },
            SignalPayload::IceCandidate { candidate: "c1".into(), sdp_mid: None, sdp_m_line_index: Some(0) },
        ];
        for signal in signals {
            relay_signal(&dispatcher, caller_conn, &caller, ConversationId(4), Some(UserId(2)), signal)
                .await
                .unwrap();
        }

        let mut received = Vec::new();
        while let Ok(ServerFrame::Event(event)) = callee_rx.try_recv() {
            assert_eq!(event.payload["from_user_id"], 1);
            received.push(event.event);
        }
        assert_eq!(
            received,
            vec![EventName::CallInitiated, EventName::WebrtcOffer, EventName::WebrtcIceCandidate]
        );
    }

    #[test]
    fn turn_credentials_follow_rest_scheme() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let creds = turn_credentials("secret", UserId(42), 3600, &["turn:turn.example.com".into()], now).unwrap();
        assert_eq!(creds.username, "1700003600:42");
        assert_eq!(creds.ttl, 3600);

        let mut mac = HmacSha1::new_from_slice(b"secret").unwrap();
        mac.update(creds.username.as_bytes());
        assert!(mac.verify_slice(&BASE64.decode(&creds.credential).unwrap()).is_ok());
    }
}
