//! Marketplace identities: bech32-encoded Schnorr keys.
//!
//! Every actor (client, node, router) is identified by an x-only secp256k1
//! public key rendered as an `npub1…` bech32 string, and signs with the
//! corresponding secret key given either as `nsec1…` bech32 or a 64-char hex
//! dump. Signatures are BIP-340 Schnorr over the SHA-256 of the canonical
//! signing bytes (see [`crate::canonical`]).

use bech32::{Bech32, Hrp};
use once_cell::sync::Lazy;
use secp256k1::schnorr::Signature;
use secp256k1::{Keypair, Message, Secp256k1, SecretKey, XOnlyPublicKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

static SECP: Lazy<Secp256k1<secp256k1::All>> = Lazy::new(Secp256k1::new);

/// Human-readable part of public key identifiers.
pub const NPUB_HRP: &str = "npub";
/// Human-readable part of bech32 secret keys.
pub const NSEC_HRP: &str = "nsec";

/// Errors produced while parsing or checking identity material.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid public key id: {0}")]
    InvalidKeyId(String),
    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),
    #[error("invalid signature encoding: {0}")]
    InvalidSignatureEncoding(String),
    #[error("signature verification failed")]
    BadSignature,
}

/// An actor identity: a bech32 `npub1…` public key.
///
/// Stored as the underlying x-only key; the bech32 form is produced on
/// serialization and display. Two `Npub`s are equal iff the key bytes are.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Npub(XOnlyPublicKey);

impl Npub {
    /// Decode an `npub1…` string, rejecting other prefixes and wrong lengths.
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        let (hrp, data) =
            bech32::decode(s).map_err(|e| IdentityError::InvalidKeyId(e.to_string()))?;
        if hrp.as_str() != NPUB_HRP {
            return Err(IdentityError::InvalidKeyId(format!(
                "expected {NPUB_HRP} prefix, got {hrp}"
            )));
        }
        let key = XOnlyPublicKey::from_slice(&data)
            .map_err(|e| IdentityError::InvalidKeyId(e.to_string()))?;
        Ok(Npub(key))
    }

    /// Raw 32 bytes of the x-only public key.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.serialize()
    }

    /// Verify a 64-byte Schnorr signature over a 32-byte digest.
    pub fn verify_digest(&self, digest: [u8; 32], sig: &[u8]) -> Result<(), IdentityError> {
        let sig = Signature::from_slice(sig)
            .map_err(|e| IdentityError::InvalidSignatureEncoding(e.to_string()))?;
        let msg = Message::from_digest(digest);
        SECP.verify_schnorr(&sig, &msg, &self.0)
            .map_err(|_| IdentityError::BadSignature)
    }
}

impl Display for Npub {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let hrp = Hrp::parse(NPUB_HRP).map_err(|_| std::fmt::Error)?;
        let encoded =
            bech32::encode::<Bech32>(hrp, &self.0.serialize()).map_err(|_| std::fmt::Error)?;
        write!(f, "{encoded}")
    }
}

impl Debug for Npub {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Npub({self})")
    }
}

impl FromStr for Npub {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Npub::parse(s)
    }
}

impl Serialize for Npub {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Npub {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Npub::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A full signing identity: secret key plus derived public key.
///
/// The secret half is accepted as `nsec1…` bech32 or as 64 hex characters.
/// `Debug` deliberately prints only the public side.
#[derive(Clone)]
pub struct Keys {
    keypair: Keypair,
    public: Npub,
}

impl Keys {
    /// Build from a raw secret key.
    pub fn from_secret_key(secret: SecretKey) -> Self {
        let keypair = Keypair::from_secret_key(&SECP, &secret);
        let (xonly, _parity) = keypair.x_only_public_key();
        Keys {
            keypair,
            public: Npub(xonly),
        }
    }

    /// Parse `nsec1…` bech32 or 64-char hex secret key material.
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        let s = s.trim();
        let bytes: Vec<u8> = if s.starts_with(NSEC_HRP) {
            let (hrp, data) =
                bech32::decode(s).map_err(|e| IdentityError::InvalidSecretKey(e.to_string()))?;
            if hrp.as_str() != NSEC_HRP {
                return Err(IdentityError::InvalidSecretKey(format!(
                    "expected {NSEC_HRP} prefix, got {hrp}"
                )));
            }
            data
        } else {
            hex::decode(s).map_err(|e| IdentityError::InvalidSecretKey(e.to_string()))?
        };
        let secret = SecretKey::from_slice(&bytes)
            .map_err(|e| IdentityError::InvalidSecretKey(e.to_string()))?;
        Ok(Self::from_secret_key(secret))
    }

    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut rng = rand::rng();
        loop {
            let mut bytes = [0u8; 32];
            rng.fill_bytes(&mut bytes);
            if let Ok(secret) = SecretKey::from_slice(&bytes) {
                return Self::from_secret_key(secret);
            }
        }
    }

    /// Public identity of this key pair.
    pub fn npub(&self) -> Npub {
        self.public
    }

    /// Secret key as `nsec1…` bech32.
    pub fn nsec(&self) -> String {
        let hrp = Hrp::parse(NSEC_HRP).expect("static hrp");
        bech32::encode::<Bech32>(hrp, &self.keypair.secret_key().secret_bytes())
            .expect("bech32 encoding of 32 bytes")
    }

    /// BIP-340 Schnorr signature over a 32-byte digest.
    ///
    /// Deterministic (no auxiliary randomness) so the same input always yields
    /// the same signature, which keeps test fixtures stable.
    pub fn sign_digest(&self, digest: [u8; 32]) -> [u8; 64] {
        let msg = Message::from_digest(digest);
        let sig = SECP.sign_schnorr_no_aux_rand(&msg, &self.keypair);
        sig.serialize()
    }
}

impl Debug for Keys {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Keys({})", self.public)
    }
}

impl FromStr for Keys {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Keys::parse(s)
    }
}

/// Parse a `keyId` into key bytes, mapping failures to `invalid-key-id`.
pub fn parse_public_key(key_id: &str) -> Result<Npub, IdentityError> {
    Npub::parse(key_id)
}
