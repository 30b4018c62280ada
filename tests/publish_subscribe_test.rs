mod common;

use std::time::Duration;

use serde_json::json;

#[test]
fn backfill_then_live_tail() {
    let t = common::start_relay();
    let alice = common::keys(1);

    let conn = t.relay.accept("example.com", "/", "127.0.0.1");

    // Fresh subscription on an empty tenant: only EOSE.
    t.relay.message(conn, &common::req_frame("S", &[json!({"kinds": [1]})]));
    t.transport
        .wait_for(conn, |v| v[0] == "EOSE" && v[1] == "S")
        .expect("EOSE for empty backfill");
    assert_eq!(t.transport.event_count(conn, "S"), 0);

    // A publish after EOSE arrives through the live tail.
    let ev = common::sign_event(&alice, 1, json!([]), "hello", 1_700_000_000);
    let ok = common::publish(&t, conn, &ev);
    assert_eq!(ok[2], true);
    assert_eq!(ok[3], "");

    let delivered = t
        .transport
        .wait_for(conn, |v| v[0] == "EVENT" && v[1] == "S")
        .expect("live tail delivery");
    assert_eq!(delivered[2]["id"], ev["id"]);
    assert_eq!(delivered[2]["content"], "hello");

    // Nothing further arrives until the next publish.
    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(t.transport.event_count(conn, "S"), 1);

    t.relay.shutdown();
}

#[test]
fn republish_is_a_duplicate_with_no_side_effect() {
    let t = common::start_relay();
    let alice = common::keys(1);
    let conn = t.relay.accept("example.com", "/", "127.0.0.1");

    let ev = common::sign_event(&alice, 1, json!([]), "once", 1_700_000_000);
    let first = common::publish(&t, conn, &ev);
    assert_eq!(first[2], true);
    assert_eq!(first[3], "");

    t.relay.message(conn, &common::event_frame(&ev));
    let second = t
        .transport
        .wait_for(conn, |v| {
            v[0] == "OK" && v[1] == ev["id"] && v[3] == "duplicate: have this event"
        })
        .expect("duplicate acknowledgement");
    assert_eq!(second[2], true);

    // Still exactly one stored copy: a fresh subscription sees one event.
    t.relay
        .message(conn, &common::req_frame("check", &[json!({"kinds": [1]})]));
    t.transport
        .wait_for(conn, |v| v[0] == "EOSE" && v[1] == "check")
        .expect("EOSE");
    assert_eq!(t.transport.event_count(conn, "check"), 1);

    t.relay.shutdown();
}

#[test]
fn backfill_respects_limit_and_descends() {
    let t = common::start_relay();
    let alice = common::keys(1);
    let conn = t.relay.accept("example.com", "/", "127.0.0.1");

    for (i, ts) in [(0u64, 100u64), (1, 300), (2, 200)] {
        let ev = common::sign_event(&alice, 1, json!([]), &format!("n{i}"), 1_700_000_000 + ts);
        common::publish(&t, conn, &ev);
    }

    t.relay.message(
        conn,
        &common::req_frame("top2", &[json!({"kinds": [1], "limit": 2})]),
    );
    t.transport
        .wait_for(conn, |v| v[0] == "EOSE" && v[1] == "top2")
        .expect("EOSE");

    let frames = t.transport.frames_for(conn);
    let delivered: Vec<u64> = frames
        .iter()
        .filter_map(|f| serde_json::from_str::<serde_json::Value>(f).ok())
        .filter(|v| v[0] == "EVENT" && v[1] == "top2")
        .map(|v| v[2]["created_at"].as_u64().unwrap())
        .collect();
    assert_eq!(delivered, vec![1_700_000_300, 1_700_000_200]);

    t.relay.shutdown();
}

#[test]
fn close_of_unknown_sub_is_a_no_op() {
    let t = common::start_relay();
    let conn = t.relay.accept("example.com", "/", "127.0.0.1");

    t.relay.message(conn, &common::close_frame("never-opened"));
    std::thread::sleep(Duration::from_millis(300));
    assert!(
        t.transport.frames_for(conn).is_empty(),
        "CLOSE of unknown sub must not produce any frame"
    );

    t.relay.shutdown();
}

#[test]
fn req_filter_count_boundary() {
    let t = common::start_relay_with(|cfg| cfg.relay.max_req_filter_size = 2);
    let conn = t.relay.accept("example.com", "/", "127.0.0.1");

    // 2 + maxReqFilterSize elements is accepted.
    t.relay.message(
        conn,
        &common::req_frame("ok", &[json!({"kinds": [1]}), json!({"kinds": [2]})]),
    );
    t.transport
        .wait_for(conn, |v| v[0] == "EOSE" && v[1] == "ok")
        .expect("EOSE for filter count at the cap");

    // One more filter is rejected.
    t.relay.message(
        conn,
        &common::req_frame(
            "over",
            &[json!({"kinds": [1]}), json!({"kinds": [2]}), json!({"kinds": [3]})],
        ),
    );
    let notice = t
        .transport
        .wait_for(conn, |v| v[0] == "NOTICE")
        .expect("rejection notice");
    assert_eq!(notice[1], "ERROR: bad req: arr too big");

    t.relay.shutdown();
}

#[test]
fn malformed_frames_produce_notices() {
    let t = common::start_relay();
    let conn = t.relay.accept("example.com", "/", "127.0.0.1");

    t.relay.message(conn, "not json");
    let notice = t.transport.wait_for(conn, |v| v[0] == "NOTICE").unwrap();
    assert!(notice[1]
        .as_str()
        .unwrap()
        .starts_with("ERROR: bad msg: unparseable message"));

    t.relay.message(conn, r#"["WHATEVER", 1]"#);
    t.transport
        .wait_for(conn, |v| v[0] == "NOTICE" && v[1] == "ERROR: bad msg: unknown cmd")
        .expect("unknown cmd notice");

    // A bare newline is silently ignored.
    t.relay.message(conn, "\n");
    std::thread::sleep(Duration::from_millis(200));
    let notices = t
        .transport
        .frames_for(conn)
        .iter()
        .filter(|f| f.contains("NOTICE"))
        .count();
    assert_eq!(notices, 2);

    t.relay.shutdown();
}

#[test]
fn fan_out_reaches_other_connections() {
    let t = common::start_relay();
    let alice = common::keys(1);

    let publisher = t.relay.accept("example.com", "/", "127.0.0.1");
    let watcher = t.relay.accept("example.com", "/", "127.0.0.2");

    t.relay
        .message(watcher, &common::req_frame("w", &[json!({"kinds": [7]})]));
    t.transport
        .wait_for(watcher, |v| v[0] == "EOSE" && v[1] == "w")
        .expect("EOSE");

    let ev = common::sign_event(&alice, 7, json!([]), "react", 1_700_000_000);
    common::publish(&t, publisher, &ev);

    let delivered = t
        .transport
        .wait_for(watcher, |v| v[0] == "EVENT" && v[1] == "w")
        .expect("cross-connection fan-out");
    assert_eq!(delivered[2]["id"], ev["id"]);

    t.relay.shutdown();
}
