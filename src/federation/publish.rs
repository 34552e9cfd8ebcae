//! Control-plane publication: HTTP fanout to peers and relay event wrapping.
//!
//! Announcements go to every configured peer with bounded concurrency. When
//! relay publication is enabled the same signed message is additionally
//! wrapped as a standard signed event of a reserved kind; the relay
//! transport itself sits behind [`RelayPublisher`].

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;

use crate::canonical::{canonical_json, sha256};
use crate::identity::Keys;
use crate::timestamp::UnixMillis;

use super::FederationState;
use super::messages::{RouterControlMessage, encode_sig};

/// Reserved event kind for router control messages on relays.
pub const ROUTER_CONTROL_EVENT_KIND: u32 = 38383;

/// Post one signed message to `{peer}{path}` for every peer, with the
/// configured concurrency bound and per-request timeout. Returns how many
/// peers accepted it.
pub async fn publish_to_peers<T: Serialize + Clone + Send + Sync + 'static>(
    federation: &FederationState,
    http: &reqwest::Client,
    path: &str,
    message: &RouterControlMessage<T>,
) -> usize {
    let timeout = Duration::from_millis(federation.config.request_timeout_ms);
    let concurrency = federation.config.publish_concurrency.max(1);

    let mut posts = Vec::with_capacity(federation.peers.len());
    for peer in federation.peers.iter() {
        let http = http.clone();
        let peer = peer.clone();
        let path = path.to_owned();
        let message = message.clone();
        posts.push(async move {
            let url = peer.join(path.trim_start_matches('/')).ok()?;
            let response = http
                .post(url)
                .timeout(timeout)
                .json(&message)
                .send()
                .await
                .ok()?;
            response.status().is_success().then_some(())
        });
    }

    stream::iter(posts)
        .buffer_unordered(concurrency)
        .filter_map(|delivered| async move { delivered })
        .count()
        .await
}

/// A relay event in the standard signed-event shape.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct RelayEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay event could not be built: {0}")]
    Encoding(String),
    #[error("relay publish failed: {0}")]
    Publish(String),
}

/// Wrap a signed control message as a relay event of the reserved kind.
///
/// The event id is the SHA-256 of the canonical `[0, pubkey, created_at,
/// kind, tags, content]` array, signed with the router key.
pub fn wrap_control_message<T: Serialize>(
    keys: &Keys,
    message: &RouterControlMessage<T>,
) -> Result<RelayEvent, RelayError> {
    let content_value =
        serde_json::to_value(message).map_err(|e| RelayError::Encoding(e.to_string()))?;
    let content = canonical_json(&content_value);
    let pubkey = hex::encode(keys.npub().to_bytes());
    let created_at = (UnixMillis::now().as_i64() / 1000) as u64;
    let tags: Vec<Vec<String>> = vec![vec![
        "t".to_owned(),
        message.message_type.as_str().to_owned(),
    ]];

    let id_doc = json!([0, pubkey, created_at, ROUTER_CONTROL_EVENT_KIND, tags, content]);
    let digest = sha256(canonical_json(&id_doc).as_bytes());

    Ok(RelayEvent {
        id: hex::encode(digest),
        pubkey,
        created_at,
        kind: ROUTER_CONTROL_EVENT_KIND,
        tags,
        content,
        sig: encode_sig(keys.sign_digest(digest)),
    })
}

/// Relay transport seam; concrete websocket publishers are external.
#[async_trait]
pub trait RelayPublisher: Send + Sync {
    async fn publish(&self, event: &RelayEvent) -> Result<(), RelayError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::messages::{
        ControlMessageType, RouterOpStatus, RouterStatusPayload,
    };
    use crate::identity::Npub;

    fn status_message(keys: &Keys) -> RouterControlMessage<RouterStatusPayload> {
        RouterControlMessage::signed(
            ControlMessageType::StatusAnnounce,
            RouterStatusPayload {
                status: RouterOpStatus::Ok,
                active_nodes: 1,
                queue_depth: 0,
            },
            keys,
        )
        .unwrap()
    }

    #[test]
    fn event_signature_verifies_under_router_key() {
        let keys = Keys::generate();
        let event = wrap_control_message(&keys, &status_message(&keys)).unwrap();
        assert_eq!(event.kind, ROUTER_CONTROL_EVENT_KIND);
        assert_eq!(event.pubkey, hex::encode(keys.npub().to_bytes()));

        // Recompute the id and check the signature against it.
        let id_doc = json!([
            0,
            event.pubkey,
            event.created_at,
            event.kind,
            event.tags,
            event.content
        ]);
        let digest = sha256(canonical_json(&id_doc).as_bytes());
        assert_eq!(event.id, hex::encode(digest));

        let sig = super::super::messages::decode_sig(&event.sig).unwrap();
        let npub: Npub = keys.npub();
        npub.verify_digest(digest, &sig).unwrap();
    }

    #[test]
    fn event_content_roundtrips_to_the_message() {
        let keys = Keys::generate();
        let message = status_message(&keys);
        let event = wrap_control_message(&keys, &message).unwrap();
        let back: RouterControlMessage<RouterStatusPayload> =
            serde_json::from_str(&event.content).unwrap();
        back.verify().unwrap();
        assert_eq!(back.message_id, message.message_id);
    }
}
