//! # Wire Frames
//!
//! Builders for the relay-to-client frame vocabulary. Every frame is a JSON
//! array rendered to a single text payload. The reply message prefixes
//! (`duplicate:`, `invalid:`, `blocked:`, `restricted:`, `auth-required:`,
//! `error:`) are stable strings consumed by clients; they are produced by the
//! callers, not here.
//!
//! Event frames splice the stored canonical JSON directly into the output so
//! delivery never re-parses or re-serializes an event.

use crate::types::SubId;

fn json_str(s: &str) -> String {
    serde_json::to_string(s).expect("string serialization cannot fail")
}

/// `["NOTICE", message]`
pub fn notice(message: &str) -> String {
    format!(r#"["NOTICE",{}]"#, json_str(message))
}

/// `["NOTICE", "ERROR: " + message]`
pub fn notice_error(message: &str) -> String {
    notice(&format!("ERROR: {message}"))
}

/// `["OK", idHex, ok, message]`
pub fn ok(id_hex: &str, ok: bool, message: &str) -> String {
    format!(
        r#"["OK",{},{},{}]"#,
        json_str(id_hex),
        ok,
        json_str(message)
    )
}

/// `["EOSE", subId]`
pub fn eose(sub_id: &SubId) -> String {
    format!(r#"["EOSE",{}]"#, json_str(sub_id.as_str()))
}

/// `["EVENT", subId, event]`, splicing pre-rendered event JSON.
pub fn event(sub_id: &SubId, event_json: &str) -> String {
    format!(r#"["EVENT",{},{}]"#, json_str(sub_id.as_str()), event_json)
}

/// `["AUTH", challenge]`
pub fn auth_challenge(challenge: &str) -> String {
    format!(r#"["AUTH",{}]"#, json_str(challenge))
}

/// `["NEG-MSG", subId, payloadHex]`
pub fn neg_msg(sub_id: &SubId, payload_hex: &str) -> String {
    format!(
        r#"["NEG-MSG",{},{}]"#,
        json_str(sub_id.as_str()),
        json_str(payload_hex)
    )
}
