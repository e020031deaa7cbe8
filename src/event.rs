//! Nostr event model, hashing, and Schnorr signing.

use anyhow::{anyhow, Result};
use secp256k1::{schnorr::Signature, Keypair, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Simple tag wrapper preserving tag fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Build a tag from string-ish fields.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Tag(fields.into_iter().map(Into::into).collect())
    }
}

/// Core Nostr event published to the monitor's relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number, e.g. `30166` or `10166`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Arbitrary tags.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

/// Recompute the canonical Nostr event hash from its fields.
pub fn event_hash(ev: &Event) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
    let data = serde_json::to_vec(&arr)?;
    let hash = Sha256::digest(&data);
    Ok(hash.into())
}

/// Derive the x-only public key (hex) for a 32-byte hex private key.
pub fn derive_public_key(private_key_hex: &str) -> Result<String> {
    let keypair = keypair_from_hex(private_key_hex)?;
    Ok(hex::encode(keypair.x_only_public_key().0.serialize()))
}

/// Build and sign an event with the monitor's private key.
///
/// The id is the SHA-256 of the canonical serialization and the signature is
/// Schnorr over that digest, per the Nostr event schema.
pub fn sign_event(
    kind: u32,
    created_at: u64,
    tags: Vec<Tag>,
    content: String,
    private_key_hex: &str,
) -> Result<Event> {
    let secp = Secp256k1::new();
    let keypair = keypair_from_hex(private_key_hex)?;
    let mut ev = Event {
        id: String::new(),
        pubkey: hex::encode(keypair.x_only_public_key().0.serialize()),
        kind,
        created_at,
        tags,
        content,
        sig: String::new(),
    };
    let hash = event_hash(&ev)?;
    ev.id = hex::encode(hash);
    let msg = Message::from_digest_slice(&hash)?;
    let sig = secp.sign_schnorr_no_aux_rand(&msg, &keypair);
    ev.sig = hex::encode(sig.as_ref());
    Ok(ev)
}

/// Verify an event's ID and Schnorr signature.
pub fn verify_event(ev: &Event) -> Result<()> {
    let hash = event_hash(ev)?;
    let calc_id = hex::encode(hash);
    if calc_id != ev.id {
        return Err(anyhow!("id mismatch"));
    }
    let sig = Signature::from_slice(&hex::decode(&ev.sig)?)?;
    let pk = XOnlyPublicKey::from_slice(&hex::decode(&ev.pubkey)?)?;
    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest_slice(&hash)?;
    secp.verify_schnorr(&sig, &msg, &pk)?;
    Ok(())
}

fn keypair_from_hex(private_key_hex: &str) -> Result<Keypair> {
    let secp = Secp256k1::new();
    let bytes = hex::decode(private_key_hex)?;
    Keypair::from_seckey_slice(&secp, &bytes).map_err(|e| anyhow!("invalid private key: {e}"))
}
