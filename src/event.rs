//! # Events
//!
//! A signed immutable record. The 32-byte identifier is the SHA-256 of the
//! canonical serialization `[0, pubkey, created_at, kind, tags, content]`,
//! and the 64-byte signature is a BIP340 Schnorr signature over that digest
//! under the author's x-only public key. An event is valid iff both hold.
//!
//! ## Packed form
//!
//! Alongside the canonical JSON we keep a packed byte layout that exposes
//! id, pubkey, created_at, kind and an indexable-tag walker without touching
//! JSON again. Both forms describe the same event and both are stored.
//!
//! Layout, little-endian:
//!
//! ```text
//! id(32) | pubkey(32) | created_at(8) | kind(8) | ntags(2) | tag...
//! tag := letter(1) | value_len(2) | value
//! ```
//!
//! Only tags whose name is a single ASCII character are packed; those are the
//! ones filters can address. The full tag list stays in the JSON form.

use secp256k1::schnorr::Signature;
use secp256k1::{Message, Secp256k1, Verification, XOnlyPublicKey};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Fixed prefix of the packed layout before the tag section.
const PACKED_TAGS_OFFSET: usize = 32 + 32 + 8 + 8;

// =============================================================================
// Event
// =============================================================================

/// A parsed, structurally valid event. Cryptographic validity is checked
/// separately by [`Event::verify`].
#[derive(Debug, Clone)]
pub struct Event {
    pub id: [u8; 32],
    pub pubkey: [u8; 32],
    pub created_at: u64,
    pub kind: u64,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: [u8; 64],
}

impl Event {
    /// Parses an event from its JSON object form, validating shape only.
    pub fn from_json(v: &Value) -> Result<Self> {
        let obj = v
            .as_object()
            .ok_or_else(|| Error::proto("event is not an object"))?;

        let id = hex_field::<32>(obj.get("id"), "id")?;
        let pubkey = hex_field::<32>(obj.get("pubkey"), "pubkey")?;
        let sig = hex_field::<64>(obj.get("sig"), "sig")?;

        let created_at = obj
            .get("created_at")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::proto("created_at is not a number"))?;
        let kind = obj
            .get("kind")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::proto("kind is not a number"))?;
        let content = obj
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::proto("content is not a string"))?
            .to_string();

        let tags_json = obj
            .get("tags")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::proto("tags is not an array"))?;
        let mut tags = Vec::with_capacity(tags_json.len());
        for tag in tags_json {
            let fields = tag
                .as_array()
                .ok_or_else(|| Error::proto("tag is not an array"))?;
            if fields.is_empty() {
                return Err(Error::proto("empty tag"));
            }
            let mut out = Vec::with_capacity(fields.len());
            for f in fields {
                out.push(
                    f.as_str()
                        .ok_or_else(|| Error::proto("tag element is not a string"))?
                        .to_string(),
                );
            }
            tags.push(out);
        }

        Ok(Self {
            id,
            pubkey,
            created_at,
            kind,
            tags,
            content,
            sig,
        })
    }

    /// The canonical serialization the identifier is a digest of.
    pub fn canonical_json(&self) -> String {
        // Tuples serialize as JSON arrays; serde_json string escaping matches
        // the canonical form's requirements.
        serde_json::to_string(&(
            0u8,
            hex::encode(self.pubkey),
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        ))
        .expect("canonical serialization of plain data cannot fail")
    }

    /// Checks that the id matches the canonical digest and that the signature
    /// verifies under the author key.
    pub fn verify<C: Verification>(&self, secp: &Secp256k1<C>) -> Result<()> {
        let digest: [u8; 32] = Sha256::digest(self.canonical_json().as_bytes()).into();
        if digest != self.id {
            return Err(Error::proto("event id does not match digest"));
        }
        let pubkey = XOnlyPublicKey::from_slice(&self.pubkey)?;
        let sig = Signature::from_slice(&self.sig)?;
        secp.verify_schnorr(&sig, &Message::from_digest(self.id), &pubkey)
            .map_err(|_| Error::proto("bad signature"))?;
        Ok(())
    }

    /// Re-serializes the event as a normalized JSON object. This is the wire
    /// form stored and later delivered to subscribers.
    pub fn to_json(&self) -> String {
        serde_json::json!({
            "id": hex::encode(self.id),
            "pubkey": hex::encode(self.pubkey),
            "created_at": self.created_at,
            "kind": self.kind,
            "tags": self.tags,
            "content": self.content,
            "sig": hex::encode(self.sig),
        })
        .to_string()
    }

    pub fn id_hex(&self) -> String {
        hex::encode(self.id)
    }

    /// Builds the packed byte layout. Tags with multi-character names are
    /// omitted; a tag with no value packs an empty value (the protected
    /// marker `["-"]` is exactly that).
    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PACKED_TAGS_OFFSET + 2 + self.tags.len() * 8);
        buf.extend_from_slice(&self.id);
        buf.extend_from_slice(&self.pubkey);
        buf.extend_from_slice(&self.created_at.to_le_bytes());
        buf.extend_from_slice(&self.kind.to_le_bytes());

        let packable: Vec<(u8, &str)> = self
            .tags
            .iter()
            .filter_map(|tag| {
                let name = tag.first()?;
                let mut chars = name.bytes();
                match (chars.next(), chars.next()) {
                    (Some(letter), None) => {
                        let value = tag.get(1).map(String::as_str).unwrap_or("");
                        Some((letter, value))
                    }
                    _ => None,
                }
            })
            .collect();

        buf.extend_from_slice(&(packable.len() as u16).to_le_bytes());
        for (letter, value) in packable {
            let value = &value.as_bytes()[..value.len().min(u16::MAX as usize)];
            buf.push(letter);
            buf.extend_from_slice(&(value.len() as u16).to_le_bytes());
            buf.extend_from_slice(value);
        }
        buf
    }

}

fn hex_field<const N: usize>(v: Option<&Value>, name: &str) -> Result<[u8; N]> {
    let s = v
        .and_then(Value::as_str)
        .ok_or_else(|| Error::proto(format!("{name} is not a string")))?;
    let bytes = hex::decode(s).map_err(|_| Error::proto(format!("{name} is not valid hex")))?;
    bytes
        .try_into()
        .map_err(|_| Error::proto(format!("{name} has wrong length")))
}

// =============================================================================
// Verified Event
// =============================================================================

/// An event that passed cryptographic verification, carried through the
/// pipeline with both stored forms already rendered.
#[derive(Debug, Clone)]
pub struct VerifiedEvent {
    pub event: Event,
    pub packed: Vec<u8>,
    pub json: String,
}

/// Parses and cryptographically verifies an event in one step.
pub fn parse_and_verify<C: Verification>(secp: &Secp256k1<C>, v: &Value) -> Result<VerifiedEvent> {
    let event = Event::from_json(v)?;
    event.verify(secp)?;
    let packed = event.pack();
    let json = event.to_json();
    Ok(VerifiedEvent {
        event,
        packed,
        json,
    })
}

// =============================================================================
// Packed Event View
// =============================================================================

/// A zero-copy view over the packed byte layout.
///
/// Constructed over bytes this crate produced via [`Event::pack`]; accessors
/// assume the layout invariant and do not re-validate it.
#[derive(Debug, Clone, Copy)]
pub struct PackedEvent<'a>(&'a [u8]);

impl<'a> PackedEvent<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        debug_assert!(buf.len() >= PACKED_TAGS_OFFSET + 2);
        Self(buf)
    }

    pub fn id(&self) -> &'a [u8] {
        &self.0[0..32]
    }

    pub fn pubkey(&self) -> &'a [u8] {
        &self.0[32..64]
    }

    pub fn created_at(&self) -> u64 {
        u64::from_le_bytes(self.0[64..72].try_into().unwrap())
    }

    pub fn kind(&self) -> u64 {
        u64::from_le_bytes(self.0[72..80].try_into().unwrap())
    }

    /// Iterator over packed `(letter, value)` tag pairs.
    pub fn tags(&self) -> TagIter<'a> {
        let ntags = u16::from_le_bytes(
            self.0[PACKED_TAGS_OFFSET..PACKED_TAGS_OFFSET + 2]
                .try_into()
                .unwrap(),
        );
        TagIter {
            buf: self.0,
            cursor: PACKED_TAGS_OFFSET + 2,
            remaining: ntags,
        }
    }

    /// Whether the event carries the protected marker tag.
    pub fn is_protected(&self) -> bool {
        self.tags().any(|(letter, _)| letter == b'-')
    }
}

/// Walks the tag section of a packed event.
pub struct TagIter<'a> {
    buf: &'a [u8],
    cursor: usize,
    remaining: u16,
}

impl<'a> Iterator for TagIter<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let letter = self.buf[self.cursor];
        let len = u16::from_le_bytes(
            self.buf[self.cursor + 1..self.cursor + 3]
                .try_into()
                .unwrap(),
        ) as usize;
        let value = &self.buf[self.cursor + 3..self.cursor + 3 + len];
        self.cursor += 3 + len;
        Some((letter, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        Event {
            id: [0x11; 32],
            pubkey: [0x22; 32],
            created_at: 1_700_000_000,
            kind: 1,
            tags: vec![
                vec!["e".to_string(), "abcd".to_string()],
                vec!["relay".to_string(), "wss://r.example".to_string()],
                vec!["-".to_string()],
            ],
            content: "hello \"world\"".to_string(),
            sig: [0x33; 64],
        }
    }

    #[test]
    fn canonical_roundtrip_is_stable() {
        let ev = sample_event();
        let json: Value = serde_json::from_str(&ev.to_json()).unwrap();
        let reparsed = Event::from_json(&json).unwrap();
        assert_eq!(reparsed.canonical_json(), ev.canonical_json());
        assert_eq!(reparsed.to_json(), ev.to_json());
    }

    #[test]
    fn packed_view_matches_source() {
        let ev = sample_event();
        let packed = ev.pack();
        let view = PackedEvent::new(&packed);
        assert_eq!(view.id(), &ev.id);
        assert_eq!(view.pubkey(), &ev.pubkey);
        assert_eq!(view.created_at(), ev.created_at);
        assert_eq!(view.kind(), ev.kind);

        // Multi-character tag names are not packed; the bare "-" marker is.
        let tags: Vec<(u8, &[u8])> = view.tags().collect();
        assert_eq!(tags, vec![(b'e', b"abcd".as_slice()), (b'-', b"".as_slice())]);
        assert!(view.is_protected());
    }

    #[test]
    fn parse_rejects_malformed_shapes() {
        let bad = serde_json::json!({"id": "zz", "pubkey": "aa"});
        assert!(Event::from_json(&bad).is_err());

        let mut obj = serde_json::from_str::<Value>(&sample_event().to_json()).unwrap();
        obj["tags"] = serde_json::json!([["e", 5]]);
        assert!(Event::from_json(&obj).is_err());
    }

    #[test]
    fn verify_rejects_wrong_id_and_wrong_sig() {
        use secp256k1::Keypair;

        let secp = Secp256k1::new();
        let keypair = Keypair::from_seckey_slice(&secp, &[0x51; 32]).unwrap();
        let (xonly, _) = keypair.x_only_public_key();

        let mut ev = Event {
            id: [0; 32],
            pubkey: xonly.serialize(),
            created_at: 1_700_000_000,
            kind: 1,
            tags: vec![],
            content: "signed".to_string(),
            sig: [0; 64],
        };
        ev.id = Sha256::digest(ev.canonical_json().as_bytes()).into();
        let sig = secp.sign_schnorr_no_aux_rand(&Message::from_digest(ev.id), &keypair);
        ev.sig = sig.serialize();

        assert!(ev.verify(&secp).is_ok());

        let mut tampered = ev.clone();
        tampered.content.push('!');
        assert!(tampered.verify(&secp).is_err());

        let mut bad_sig = ev.clone();
        bad_sig.sig[0] ^= 0xFF;
        assert!(bad_sig.verify(&secp).is_err());
    }
}
