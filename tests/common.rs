#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use secp256k1::{Keypair, Message, Secp256k1};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use spiterelay::{Config, ConnId, Relay, Transport};
use tempfile::TempDir;

/// How long observable effects get to propagate through the pipeline. The
/// live path includes the storage watcher's 100 ms debounce.
pub const WAIT: Duration = Duration::from_secs(10);

// =============================================================================
// Capture Transport
// =============================================================================

/// A transport that records every outbound frame for assertions.
pub struct CaptureTransport {
    frames: Mutex<Vec<(ConnId, String)>>,
}

impl CaptureTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(Vec::new()),
        })
    }

    pub fn frames_for(&self, conn_id: ConnId) -> Vec<String> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == conn_id)
            .map(|(_, f)| f.clone())
            .collect()
    }

    /// Polls until a frame for `conn_id` satisfies `pred`, returning it.
    pub fn wait_for(
        &self,
        conn_id: ConnId,
        pred: impl Fn(&Value) -> bool,
    ) -> Option<Value> {
        let deadline = Instant::now() + WAIT;
        loop {
            for frame in self.frames_for(conn_id) {
                if let Ok(v) = serde_json::from_str::<Value>(&frame) {
                    if pred(&v) {
                        return Some(v);
                    }
                }
            }
            if Instant::now() > deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Waits for the `["OK", id, ...]` reply for a given event id.
    pub fn wait_for_ok(&self, conn_id: ConnId, id_hex: &str) -> Value {
        self.wait_for(conn_id, |v| {
            v[0] == "OK" && v[1].as_str() == Some(id_hex)
        })
        .unwrap_or_else(|| panic!("no OK frame for {id_hex}"))
    }

    /// Number of `EVENT` frames delivered to a subscription so far.
    pub fn event_count(&self, conn_id: ConnId, sub_id: &str) -> usize {
        self.frames_for(conn_id)
            .iter()
            .filter_map(|f| serde_json::from_str::<Value>(f).ok())
            .filter(|v| v[0] == "EVENT" && v[1].as_str() == Some(sub_id))
            .count()
    }
}

impl Transport for CaptureTransport {
    fn send(&self, conn_id: ConnId, payload: String) {
        self.frames.lock().unwrap().push((conn_id, payload));
    }
}

// =============================================================================
// Relay Bootstrap
// =============================================================================

pub struct TestRelay {
    pub relay: Relay,
    pub transport: Arc<CaptureTransport>,
    _dir: TempDir,
}

pub fn start_relay() -> TestRelay {
    start_relay_with(|_| {})
}

pub fn start_relay_with(tweak: impl FnOnce(&mut Config)) -> TestRelay {
    // First caller wins; later calls are no-ops.
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let dir = TempDir::new().expect("create temp dir");
    let mut cfg = Config::new(dir.path());
    tweak(&mut cfg);
    let transport = CaptureTransport::new();
    let relay = Relay::start(cfg, transport.clone()).expect("start relay");
    TestRelay {
        relay,
        transport,
        _dir: dir,
    }
}

// =============================================================================
// Event Signing
// =============================================================================

pub struct TestKeys {
    pub keypair: Keypair,
    pub pubkey: [u8; 32],
    pub pubkey_hex: String,
}

/// Deterministic keypair from a non-zero seed byte.
pub fn keys(seed: u8) -> TestKeys {
    assert!(seed > 0, "zero seed is not a valid secret key");
    let secp = Secp256k1::new();
    let keypair = Keypair::from_seckey_slice(&secp, &[seed; 32]).expect("valid secret key");
    let (xonly, _) = keypair.x_only_public_key();
    let pubkey = xonly.serialize();
    TestKeys {
        keypair,
        pubkey,
        pubkey_hex: hex::encode(pubkey),
    }
}

/// Builds and signs a complete event object.
pub fn sign_event(
    keys: &TestKeys,
    kind: u64,
    tags: Value,
    content: &str,
    created_at: u64,
) -> Value {
    let secp = Secp256k1::new();
    let canonical = serde_json::to_string(&json!([
        0,
        keys.pubkey_hex,
        created_at,
        kind,
        tags,
        content
    ]))
    .unwrap();
    let id: [u8; 32] = Sha256::digest(canonical.as_bytes()).into();
    let sig = secp.sign_schnorr_no_aux_rand(&Message::from_digest(id), &keys.keypair);

    json!({
        "id": hex::encode(id),
        "pubkey": keys.pubkey_hex,
        "created_at": created_at,
        "kind": kind,
        "tags": tags,
        "content": content,
        "sig": hex::encode(sig.serialize()),
    })
}

pub fn id_of(event: &Value) -> String {
    event["id"].as_str().unwrap().to_string()
}

// =============================================================================
// Client Frames
// =============================================================================

pub fn event_frame(event: &Value) -> String {
    json!(["EVENT", event]).to_string()
}

pub fn req_frame(sub_id: &str, filters: &[Value]) -> String {
    let mut arr = vec![json!("REQ"), json!(sub_id)];
    arr.extend(filters.iter().cloned());
    Value::Array(arr).to_string()
}

pub fn close_frame(sub_id: &str) -> String {
    json!(["CLOSE", sub_id]).to_string()
}

pub fn auth_frame(event: &Value) -> String {
    json!(["AUTH", event]).to_string()
}

/// Publishes an event and waits for its `OK` acknowledgement.
pub fn publish(t: &TestRelay, conn_id: ConnId, event: &Value) -> Value {
    t.relay.message(conn_id, &event_frame(event));
    t.transport.wait_for_ok(conn_id, &id_of(event))
}
