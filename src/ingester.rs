//! # Ingester
//!
//! First pipeline stage after the transport. Each worker drains its inbox,
//! parses and dispatches every client frame, and forwards fully verified
//! events to the writer pool in one batched dispatch per drain.
//!
//! Per-worker state is deliberately small: a secp verification context, and
//! the worker-local `connId -> AuthStatus` table backing the AUTH gate.
//! Because every message for a connection lands on the same worker, the
//! table needs no synchronization and is dropped entry-by-entry on
//! `CloseConn`.
//!
//! Every handler failure is translated to a client-visible frame here; an
//! error never crosses the pool boundary upward.

use std::collections::HashMap;
use std::sync::Arc;

use rand::RngCore;
use secp256k1::{Secp256k1, VerifyOnly};
use serde_json::Value;
use tracing::debug;

use crate::config::Config;
use crate::directory::TenantDirectory;
use crate::error::{Error, Result};
use crate::event::{parse_and_verify, PackedEvent, VerifiedEvent};
use crate::filter::FilterGroup;
use crate::messages::{
    AddEvent, IngesterMsg, NegentropyMsg, ReqWorkerMsg, Senders, WriterMsg,
};
use crate::pool::Inbox;
use crate::registry::TenantRegistry;
use crate::store;
use crate::subscription::Subscription;
use crate::types::{ConnId, SubId, TenantId};

/// Authentication progress of one connection. Absence from the table means
/// unchallenged.
enum AuthStatus {
    /// A challenge was issued and not yet answered.
    Challenged(String),
    /// A valid challenge response proved control of this pubkey.
    Authed([u8; 32]),
}

/// Everything an ingester worker needs, cloned per worker thread.
#[derive(Clone)]
pub(crate) struct IngesterCtx {
    pub cfg: Arc<Config>,
    pub registry: Arc<TenantRegistry>,
    pub directory: Arc<TenantDirectory>,
    pub senders: Senders,
}

pub(crate) fn run(inbox: Inbox<IngesterMsg>, ctx: IngesterCtx) {
    let secp = Secp256k1::verification_only();
    let mut auth: HashMap<ConnId, AuthStatus> = HashMap::new();

    while let Some(batch) = inbox.pop_all() {
        let mut writer_msgs: Vec<WriterMsg> = Vec::new();

        for msg in batch {
            match msg {
                IngesterMsg::Client {
                    conn_id,
                    ip_addr,
                    tenant,
                    payload,
                } => {
                    if let Err(err) = handle_client(
                        &ctx,
                        &secp,
                        &mut auth,
                        conn_id,
                        &ip_addr,
                        &tenant,
                        &payload,
                        &mut writer_msgs,
                    ) {
                        ctx.senders
                            .send_notice_error(conn_id, &format!("bad msg: {err}"));
                    }
                }
                IngesterMsg::CloseConn(conn_id) => {
                    auth.remove(&conn_id);
                    ctx.senders
                        .writer
                        .dispatch(conn_id, WriterMsg::CloseConn(conn_id));
                    ctx.senders
                        .req_worker
                        .dispatch(conn_id, ReqWorkerMsg::CloseConn(conn_id));
                    ctx.senders
                        .negentropy
                        .dispatch(conn_id, NegentropyMsg::CloseConn(conn_id));
                }
                IngesterMsg::Shutdown => return,
            }
        }

        if !writer_msgs.is_empty() {
            ctx.senders.writer.dispatch_multi(ConnId::from_raw(0), writer_msgs);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_client(
    ctx: &IngesterCtx,
    secp: &Secp256k1<VerifyOnly>,
    auth: &mut HashMap<ConnId, AuthStatus>,
    conn_id: ConnId,
    ip_addr: &str,
    tenant: &TenantId,
    payload: &str,
    writer_msgs: &mut Vec<WriterMsg>,
) -> Result<()> {
    if payload == "\n" {
        // Diagnostic clients poking the socket with bare newlines.
        return Ok(());
    }
    if !payload.starts_with('[') {
        return Err(Error::proto("unparseable message"));
    }

    if ctx.cfg.relay.logging.dump_in_all {
        debug!(conn = %conn_id, %payload, "dumpInAll");
    }

    let parsed: Value = serde_json::from_str(payload).map_err(|e| Error::proto(e.to_string()))?;
    let arr = parsed
        .as_array()
        .ok_or_else(|| Error::proto("message is not an array"))?;
    if arr.len() < 2 {
        return Err(Error::proto("too few array elements"));
    }
    let cmd = arr[0]
        .as_str()
        .ok_or_else(|| Error::proto("first element not a command like REQ"))?;

    match cmd {
        "EVENT" => {
            if ctx.cfg.relay.logging.dump_in_events {
                debug!(conn = %conn_id, %payload, "dumpInEvent");
            }
            if let Err(err) =
                process_event(ctx, secp, auth, conn_id, ip_addr, tenant, &arr[1], writer_msgs)
            {
                let id_hex = arr[1]
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or("?")
                    .to_string();
                ctx.senders
                    .send_ok(conn_id, &id_hex, false, &format!("invalid: {err}"));
                if ctx.cfg.relay.logging.invalid_events {
                    debug!(conn = %conn_id, %err, "rejected invalid event");
                }
            }
            Ok(())
        }
        "AUTH" => {
            if let Err(err) = process_auth(ctx, secp, auth, conn_id, &arr[1]) {
                ctx.senders
                    .send_notice(conn_id, &format!("auth failed: {err}"));
            }
            Ok(())
        }
        "REQ" => {
            if ctx.cfg.relay.logging.dump_in_reqs {
                debug!(conn = %conn_id, %payload, "dumpInReq");
            }
            if let Err(err) = process_req(ctx, conn_id, tenant, arr) {
                ctx.senders
                    .send_notice_error(conn_id, &format!("bad req: {err}"));
            }
            Ok(())
        }
        "CLOSE" => {
            if let Err(err) = process_close(ctx, conn_id, arr) {
                ctx.senders
                    .send_notice_error(conn_id, &format!("bad close: {err}"));
            }
            Ok(())
        }
        cmd if cmd.starts_with("NEG-") => {
            if !ctx.cfg.relay.negentropy.enabled {
                return Err(Error::proto("negentropy disabled"));
            }
            if let Err(err) = process_negentropy(ctx, conn_id, tenant, cmd, arr) {
                ctx.senders
                    .send_notice_error(conn_id, &format!("negentropy error: {err}"));
            }
            Ok(())
        }
        _ => Err(Error::proto("unknown cmd")),
    }
}

// =============================================================================
// EVENT + AUTH gate
// =============================================================================

#[allow(clippy::too_many_arguments)]
fn process_event(
    ctx: &IngesterCtx,
    secp: &Secp256k1<VerifyOnly>,
    auth: &mut HashMap<ConnId, AuthStatus>,
    conn_id: ConnId,
    ip_addr: &str,
    tenant: &TenantId,
    event_json: &Value,
    writer_msgs: &mut Vec<WriterMsg>,
) -> Result<()> {
    let verified: VerifiedEvent = parse_and_verify(secp, event_json)?;
    let id_hex = verified.event.id_hex();

    if !ctx.directory.can_write(tenant, &verified.event.pubkey) {
        debug!(conn = %conn_id, %tenant, "write denied by tenant policy");
        ctx.senders.send_ok(
            conn_id,
            &id_hex,
            false,
            "restricted: access denied to this tenant",
        );
        return Ok(());
    }

    let packed = PackedEvent::new(&verified.packed);
    if packed.is_protected() {
        // Protected events require the author to have proven control of the
        // publishing key on this very connection.
        if ctx.cfg.relay.service_url.is_empty() {
            ctx.senders
                .send_ok(conn_id, &id_hex, false, "blocked: event marked as protected");
            return Ok(());
        }
        match auth.get(&conn_id) {
            None => {
                let challenge = fresh_challenge();
                ctx.senders.send_auth_challenge(conn_id, &challenge);
                auth.insert(conn_id, AuthStatus::Challenged(challenge));
                ctx.senders.send_ok(
                    conn_id,
                    &id_hex,
                    false,
                    "auth-required: event marked as protected",
                );
                return Ok(());
            }
            Some(AuthStatus::Challenged(_)) => {
                ctx.senders.send_ok(
                    conn_id,
                    &id_hex,
                    false,
                    "auth-required: event marked as protected",
                );
                return Ok(());
            }
            Some(AuthStatus::Authed(pubkey)) => {
                if *pubkey != verified.event.pubkey {
                    ctx.senders.send_ok(
                        conn_id,
                        &id_hex,
                        false,
                        "restricted: must be published by the author",
                    );
                    return Ok(());
                }
            }
        }
    }

    // Cheap pre-check; the writer re-checks inside its transaction.
    let env = ctx.registry.get_env(tenant, &ctx.directory)?;
    let reader = env.reader()?;
    if store::lookup_event_by_id(&reader, &verified.event.id)?.is_some() {
        ctx.senders
            .send_ok(conn_id, &id_hex, true, "duplicate: have this event");
        return Ok(());
    }

    writer_msgs.push(WriterMsg::AddEvent(Box::new(AddEvent {
        conn_id,
        ip_addr: ip_addr.to_string(),
        tenant: tenant.clone(),
        verified,
    })));
    Ok(())
}

fn process_auth(
    ctx: &IngesterCtx,
    secp: &Secp256k1<VerifyOnly>,
    auth: &mut HashMap<ConnId, AuthStatus>,
    conn_id: ConnId,
    event_json: &Value,
) -> Result<()> {
    if ctx.cfg.relay.service_url.is_empty() {
        return Err(Error::proto(
            "relay needs serviceUrl to be configured before AUTH can work",
        ));
    }

    let verified = parse_and_verify(secp, event_json)?;
    if verified.event.kind != 22242 {
        return Err(Error::proto("wrong event kind, expected 22242"));
    }

    let challenge = match auth.get(&conn_id) {
        None => return Err(Error::proto("no auth status available for connection")),
        Some(AuthStatus::Authed(_)) => return Err(Error::proto("already authenticated")),
        Some(AuthStatus::Challenged(c)) => c.clone(),
    };

    let mut found_challenge = false;
    let mut found_relay = false;
    for tag in &verified.event.tags {
        let (Some(name), Some(value)) = (tag.first(), tag.get(1)) else {
            continue;
        };
        if name.as_str() == "relay" && *value == ctx.cfg.relay.service_url {
            found_relay = true;
        } else if name.as_str() == "challenge" && *value == challenge {
            found_challenge = true;
        }
    }
    if !found_challenge {
        return Err(Error::proto("challenge string mismatch"));
    }
    if !found_relay {
        return Err(Error::proto(format!(
            "incorrect or missing relay tag, expected: {}",
            ctx.cfg.relay.service_url
        )));
    }

    auth.insert(conn_id, AuthStatus::Authed(verified.event.pubkey));
    ctx.senders
        .send_ok(conn_id, &verified.event.id_hex(), true, "successfully authenticated");
    Ok(())
}

/// Per-connection challenge, infeasible to guess across connections.
fn fresh_challenge() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// =============================================================================
// REQ / CLOSE / NEG-*
// =============================================================================

fn process_req(ctx: &IngesterCtx, conn_id: ConnId, tenant: &TenantId, arr: &[Value]) -> Result<()> {
    if arr.len() < 2 + 1 {
        return Err(Error::proto("arr too small"));
    }
    if arr.len() > 2 + ctx.cfg.relay.max_req_filter_size {
        return Err(Error::proto("arr too big"));
    }

    let sub_id = SubId::new(
        arr[1]
            .as_str()
            .ok_or_else(|| Error::proto("REQ subscription id was not a string"))?,
    )?;
    let filters = FilterGroup::from_req(&arr[2..])?;
    let sub = Subscription::new(conn_id, sub_id, filters, tenant.clone());

    ctx.senders
        .req_worker
        .dispatch(conn_id, ReqWorkerMsg::NewSub(Box::new(sub)));
    Ok(())
}

fn process_close(ctx: &IngesterCtx, conn_id: ConnId, arr: &[Value]) -> Result<()> {
    if arr.len() != 2 {
        return Err(Error::proto("arr too small/big"));
    }
    let sub_id = SubId::new(
        arr[1]
            .as_str()
            .ok_or_else(|| Error::proto("CLOSE subscription id was not a string"))?,
    )?;
    ctx.senders
        .req_worker
        .dispatch(conn_id, ReqWorkerMsg::RemoveSub { conn_id, sub_id });
    Ok(())
}

fn process_negentropy(
    ctx: &IngesterCtx,
    conn_id: ConnId,
    tenant: &TenantId,
    cmd: &str,
    arr: &[Value],
) -> Result<()> {
    let sub_id = SubId::new(
        arr[1]
            .as_str()
            .ok_or_else(|| Error::proto("negentropy subscription id was not a string"))?,
    )?;

    match cmd {
        "NEG-OPEN" => {
            if arr.len() < 4 {
                return Err(Error::proto("negentropy query missing elements"));
            }
            // The reconciliation protocol owns its own time bounds; the
            // snapshot filter drops any the client supplied.
            let mut filter_json = arr[2].clone();
            if let Some(obj) = filter_json.as_object_mut() {
                obj.remove("since");
                obj.remove("until");
            }
            let max_limit = ctx.cfg.relay.negentropy.max_sync_events + 1;
            let filters = FilterGroup::unwrapped(&filter_json, max_limit)?;
            let payload = decode_payload(&arr[3])?;
            ctx.senders.negentropy.dispatch(
                conn_id,
                NegentropyMsg::Open {
                    conn_id,
                    sub_id,
                    tenant: tenant.clone(),
                    filters,
                    payload,
                },
            );
        }
        "NEG-MSG" => {
            if arr.len() < 3 {
                return Err(Error::proto("negentropy query missing elements"));
            }
            let payload = decode_payload(&arr[2])?;
            ctx.senders.negentropy.dispatch(
                conn_id,
                NegentropyMsg::Msg {
                    conn_id,
                    sub_id,
                    payload,
                },
            );
        }
        "NEG-CLOSE" => {
            ctx.senders
                .negentropy
                .dispatch(conn_id, NegentropyMsg::Close { conn_id, sub_id });
        }
        _ => return Err(Error::proto("unknown command")),
    }
    Ok(())
}

fn decode_payload(v: &Value) -> Result<Vec<u8>> {
    let s = v
        .as_str()
        .ok_or_else(|| Error::proto("negentropy payload not a string"))?;
    hex::decode(s).map_err(|_| Error::proto("negentropy payload not hex"))
}
