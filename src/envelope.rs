//! The signed message envelope shared by every marketplace actor.
//!
//! An envelope wraps a payload with a nonce, a millisecond timestamp, the
//! signer's `npub` identity, and a base64 Schnorr signature over the canonical
//! serialization of `{payload, nonce, ts, keyId}`. Envelopes with the same
//! nonce inside the replay window are duplicates and the second one is
//! rejected.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::canonical::envelope_signing_digest;
use crate::identity::{IdentityError, Keys, Npub};
use crate::nonce_store::NonceStore;
use crate::timestamp::UnixMillis;

/// Replay window: nonces must be unique within it, and envelope timestamps
/// may not deviate from the local clock by more than it.
pub const REPLAY_WINDOW_MS: i64 = 5 * 60 * 1000;

/// Errors raised while parsing, verifying, or replay-checking an envelope.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("empty body")]
    EmptyBody,
    #[error("invalid json: {0}")]
    InvalidJson(String),
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
    #[error("invalid key id: {0}")]
    InvalidKeyId(String),
    #[error("envelope is not signed")]
    SignatureMissing,
    #[error("invalid signature")]
    SignatureInvalid,
    #[error("duplicate nonce")]
    NonceDuplicate,
    #[error("timestamp outside replay window")]
    TsSkew,
}

impl From<IdentityError> for EnvelopeError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::InvalidKeyId(e) => EnvelopeError::InvalidKeyId(e),
            IdentityError::InvalidSecretKey(e) => EnvelopeError::InvalidEnvelope(e),
            IdentityError::InvalidSignatureEncoding(_) | IdentityError::BadSignature => {
                EnvelopeError::SignatureInvalid
            }
        }
    }
}

/// Signed wrapper over a payload with replay protection.
///
/// `T` is any serializable payload; [`RawEnvelope`] keeps the payload as raw
/// JSON so signature checks always run over exactly the bytes the sender
/// canonicalized, before any typed decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Envelope<T> {
    pub payload: T,
    pub nonce: String,
    pub ts: UnixMillis,
    pub key_id: Npub,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
}

/// An envelope whose payload has not been decoded yet.
pub type RawEnvelope = Envelope<Value>;

impl<T: Serialize> Envelope<T> {
    /// Unsigned shell with explicit nonce and timestamp.
    pub fn build(payload: T, nonce: impl Into<String>, ts: UnixMillis, key_id: Npub) -> Self {
        Envelope {
            payload,
            nonce: nonce.into(),
            ts,
            key_id,
            sig: None,
        }
    }

    /// Build and sign in one step with a fresh random nonce and `ts = now`.
    pub fn signed(payload: T, keys: &Keys) -> Result<Self, EnvelopeError> {
        let mut envelope = Envelope::build(
            payload,
            Uuid::new_v4().to_string(),
            UnixMillis::now(),
            keys.npub(),
        );
        envelope.sign(keys)?;
        Ok(envelope)
    }

    /// Fill `sig` by signing the canonical bytes with `keys`.
    ///
    /// The envelope's `keyId` is replaced by the signer's identity so the
    /// signature always matches the advertised key.
    pub fn sign(&mut self, keys: &Keys) -> Result<(), EnvelopeError> {
        self.key_id = keys.npub();
        let payload = serde_json::to_value(&self.payload)
            .map_err(|e| EnvelopeError::InvalidEnvelope(e.to_string()))?;
        let digest = envelope_signing_digest(&payload, &self.nonce, self.ts, &self.key_id);
        self.sig = Some(B64.encode(keys.sign_digest(digest)));
        Ok(())
    }

    /// Downgrade to a [`RawEnvelope`] (payload as JSON value).
    pub fn to_raw(&self) -> Result<RawEnvelope, EnvelopeError> {
        let payload = serde_json::to_value(&self.payload)
            .map_err(|e| EnvelopeError::InvalidEnvelope(e.to_string()))?;
        Ok(Envelope {
            payload,
            nonce: self.nonce.clone(),
            ts: self.ts,
            key_id: self.key_id,
            sig: self.sig.clone(),
        })
    }

    /// Verify `sig` against an explicit public key.
    pub fn verify(&self, public_key: &Npub) -> Result<(), EnvelopeError> {
        let sig_b64 = self.sig.as_ref().ok_or(EnvelopeError::SignatureMissing)?;
        let sig = B64
            .decode(sig_b64)
            .map_err(|_| EnvelopeError::SignatureInvalid)?;
        let payload = serde_json::to_value(&self.payload)
            .map_err(|e| EnvelopeError::InvalidEnvelope(e.to_string()))?;
        let digest = envelope_signing_digest(&payload, &self.nonce, self.ts, &self.key_id);
        public_key
            .verify_digest(digest, &sig)
            .map_err(|_| EnvelopeError::SignatureInvalid)
    }

    /// Verify `sig` under the envelope's own `keyId` (self-signed messages).
    pub fn verify_self(&self) -> Result<(), EnvelopeError> {
        let key = self.key_id;
        self.verify(&key)
    }
}

impl RawEnvelope {
    /// Parse a request body into an envelope, distinguishing the empty-body,
    /// invalid-json, and invalid-envelope failure classes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.is_empty() {
            return Err(EnvelopeError::EmptyBody);
        }
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| EnvelopeError::InvalidJson(e.to_string()))?;
        Self::from_value(value)
    }

    /// Validate envelope shape from an already-parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        // Surface a bad keyId as its own failure class before the general
        // shape error, since the field is a plain string at the JSON level.
        if let Some(raw_key) = value.get("keyId") {
            let key_str = raw_key
                .as_str()
                .ok_or_else(|| EnvelopeError::InvalidKeyId("keyId must be a string".into()))?;
            Npub::parse(key_str).map_err(|e| EnvelopeError::InvalidKeyId(e.to_string()))?;
        }
        serde_json::from_value(value).map_err(|e| EnvelopeError::InvalidEnvelope(e.to_string()))
    }

    /// Decode the payload into a typed record.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| EnvelopeError::InvalidEnvelope(e.to_string()))
    }

    /// Re-wrap with a typed payload, keeping nonce, ts, key, and signature.
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<Envelope<T>, EnvelopeError> {
        let payload = serde_json::from_value(self.payload)
            .map_err(|e| EnvelopeError::InvalidEnvelope(e.to_string()))?;
        Ok(Envelope {
            payload,
            nonce: self.nonce,
            ts: self.ts,
            key_id: self.key_id,
            sig: self.sig,
        })
    }
}

/// Replay guard: reject duplicate nonces and out-of-window timestamps,
/// then record the nonce.
pub async fn check_replay(
    envelope: &RawEnvelope,
    store: &dyn NonceStore,
    now: UnixMillis,
) -> Result<(), EnvelopeError> {
    if store.has(&envelope.nonce).await {
        return Err(EnvelopeError::NonceDuplicate);
    }
    if now.abs_diff(envelope.ts) > REPLAY_WINDOW_MS {
        return Err(EnvelopeError::TsSkew);
    }
    store.add(&envelope.nonce, envelope.ts).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nonce_store::MemoryNonceStore;
    use serde_json::json;

    fn sample_envelope(keys: &Keys) -> Envelope<Value> {
        Envelope::signed(json!({"hello": "world", "n": 3}), keys).unwrap()
    }

    #[test]
    fn sign_then_verify() {
        let keys = Keys::generate();
        let env = sample_envelope(&keys);
        env.verify(&keys.npub()).unwrap();
        env.verify_self().unwrap();
    }

    #[test]
    fn verify_fails_under_wrong_key() {
        let keys = Keys::generate();
        let other = Keys::generate();
        let env = sample_envelope(&keys);
        assert!(matches!(
            env.verify(&other.npub()),
            Err(EnvelopeError::SignatureInvalid)
        ));
    }

    #[test]
    fn any_field_tamper_breaks_verification() {
        let keys = Keys::generate();
        let env = sample_envelope(&keys);

        let mut tampered = env.clone();
        tampered.payload = json!({"hello": "world", "n": 4});
        assert!(tampered.verify_self().is_err());

        let mut tampered = env.clone();
        tampered.nonce.push('x');
        assert!(tampered.verify_self().is_err());

        let mut tampered = env.clone();
        tampered.ts = tampered.ts + 1;
        assert!(tampered.verify_self().is_err());

        let mut tampered = env.clone();
        tampered.key_id = Keys::generate().npub();
        assert!(tampered.verify_self().is_err());
    }

    #[test]
    fn signature_bit_flip_rejected() {
        let keys = Keys::generate();
        let mut env = sample_envelope(&keys);
        let sig = env.sig.take().unwrap();
        let mut bytes = B64.decode(&sig).unwrap();
        bytes[10] ^= 0x01;
        env.sig = Some(B64.encode(&bytes));
        assert!(matches!(
            env.verify_self(),
            Err(EnvelopeError::SignatureInvalid)
        ));
    }

    #[test]
    fn nested_envelope_signature_survives_outer_signing() {
        let keys = Keys::generate();
        let client = Keys::generate();
        let inner = Envelope::signed(json!({"amountSats": 21}), &client).unwrap();
        let inner_value = serde_json::to_value(&inner).unwrap();
        let outer = Envelope::signed(json!({"paymentReceipts": [inner_value]}), &keys).unwrap();
        outer.verify_self().unwrap();

        // The nested envelope can still be checked on its own.
        let nested: Envelope<Value> =
            serde_json::from_value(outer.payload["paymentReceipts"][0].clone()).unwrap();
        nested.verify(&client.npub()).unwrap();
    }

    #[test]
    fn parse_failure_classes() {
        assert!(matches!(
            RawEnvelope::from_slice(b""),
            Err(EnvelopeError::EmptyBody)
        ));
        assert!(matches!(
            RawEnvelope::from_slice(b"{nope"),
            Err(EnvelopeError::InvalidJson(_))
        ));
        assert!(matches!(
            RawEnvelope::from_slice(br#"{"payload": 1}"#),
            Err(EnvelopeError::InvalidEnvelope(_))
        ));
        let bad_key = br#"{"payload":{},"nonce":"n","ts":1,"keyId":"garbage"}"#;
        assert!(matches!(
            RawEnvelope::from_slice(bad_key),
            Err(EnvelopeError::InvalidKeyId(_))
        ));
    }

    #[tokio::test]
    async fn replay_window_rules() {
        let keys = Keys::generate();
        let store = MemoryNonceStore::new();
        let env = sample_envelope(&keys).to_raw().unwrap();
        let now = UnixMillis::now();

        check_replay(&env, &store, now).await.unwrap();
        assert!(matches!(
            check_replay(&env, &store, now).await,
            Err(EnvelopeError::NonceDuplicate)
        ));

        let mut stale = sample_envelope(&keys).to_raw().unwrap();
        stale.ts = now - (REPLAY_WINDOW_MS + 1);
        assert!(matches!(
            check_replay(&stale, &store, now).await,
            Err(EnvelopeError::TsSkew)
        ));
    }
}
