mod common;

use negentropy::{Bytes, Negentropy};
use serde_json::{json, Value};
use spiterelay::ConnId;

/// Payload of the n-th (zero-based) NEG-MSG frame for a subscription.
fn neg_reply(t: &common::TestRelay, conn: ConnId, sub_id: &str, n: usize) -> String {
    let deadline = std::time::Instant::now() + common::WAIT;
    loop {
        let replies: Vec<String> = t
            .transport
            .frames_for(conn)
            .iter()
            .filter_map(|f| serde_json::from_str::<Value>(f).ok())
            .filter(|v| v[0] == "NEG-MSG" && v[1] == sub_id)
            .map(|v| v[2].as_str().unwrap().to_string())
            .collect();
        if replies.len() > n {
            return replies[n].clone();
        }
        assert!(
            std::time::Instant::now() < deadline,
            "no NEG-MSG reply number {n}"
        );
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
}

#[test]
fn reconciliation_finds_both_sides_of_the_diff() {
    let t = common::start_relay();
    let alice = common::keys(1);
    let conn = t.relay.accept("example.com", "/", "127.0.0.1");

    // Server holds e1, e2, e3.
    let e1 = common::sign_event(&alice, 1, json!([]), "e1", 1_700_000_001);
    let e2 = common::sign_event(&alice, 1, json!([]), "e2", 1_700_000_002);
    let e3 = common::sign_event(&alice, 1, json!([]), "e3", 1_700_000_003);
    for ev in [&e1, &e2, &e3] {
        assert_eq!(common::publish(&t, conn, ev)[2], true);
    }

    // Client holds e2, e3 and one event the server has never seen.
    let e4_id = [0x44u8; 32];
    let mut client = Negentropy::new(32, None).unwrap();
    for (ts, id_hex) in [
        (1_700_000_002u64, common::id_of(&e2)),
        (1_700_000_003, common::id_of(&e3)),
    ] {
        client
            .add_item(ts, Bytes::from_hex(&id_hex).unwrap())
            .unwrap();
    }
    client
        .add_item(1_700_000_004, Bytes::from_slice(&e4_id))
        .unwrap();
    client.seal().unwrap();

    // Drive the exchange through the relay until the client is done.
    let init = client.initiate().unwrap();
    t.relay.message(
        conn,
        &json!(["NEG-OPEN", "sync", {"kinds": [1]}, init.to_hex()]).to_string(),
    );

    let mut have = Vec::new();
    let mut need = Vec::new();
    let mut round = 0;
    let mut reply = neg_reply(&t, conn, "sync", round);
    loop {
        let next = client
            .reconcile_with_ids(
                &Bytes::from_hex(&reply).unwrap(),
                &mut have,
                &mut need,
            )
            .unwrap();
        match next {
            Some(msg) => {
                round += 1;
                t.relay
                    .message(conn, &json!(["NEG-MSG", "sync", msg.to_hex()]).to_string());
                reply = neg_reply(&t, conn, "sync", round);
            }
            None => break,
        }
    }

    // The client must learn to download e1 and upload e4.
    let need_hex: Vec<String> = need.iter().map(|b| b.clone().to_hex()).collect();
    let have_hex: Vec<String> = have.iter().map(|b| b.clone().to_hex()).collect();
    assert!(need_hex.contains(&common::id_of(&e1)), "missing download: {need_hex:?}");
    assert!(have_hex.contains(&hex::encode(e4_id)), "missing upload: {have_hex:?}");
    assert!(!need_hex.contains(&common::id_of(&e2)));
    assert!(!have_hex.contains(&common::id_of(&e3)));

    t.relay.message(conn, &json!(["NEG-CLOSE", "sync"]).to_string());
    t.relay.shutdown();
}

#[test]
fn neg_commands_require_the_feature_flag() {
    let t = common::start_relay_with(|cfg| cfg.relay.negentropy.enabled = false);
    let conn = t.relay.accept("example.com", "/", "127.0.0.1");

    t.relay
        .message(conn, &json!(["NEG-OPEN", "s", {}, "00"]).to_string());
    t.transport
        .wait_for(conn, |v| {
            v[0] == "NOTICE" && v[1] == "ERROR: bad msg: negentropy disabled"
        })
        .expect("disabled notice");

    t.relay.shutdown();
}

#[test]
fn neg_msg_without_session_reports_an_error() {
    let t = common::start_relay();
    let conn = t.relay.accept("example.com", "/", "127.0.0.1");

    t.relay
        .message(conn, &json!(["NEG-MSG", "ghost", "00"]).to_string());
    t.transport
        .wait_for(conn, |v| {
            v[0] == "NOTICE"
                && v[1] == "ERROR: negentropy error: no session open for this subscription"
        })
        .expect("missing session notice");

    t.relay.shutdown();
}
