//! # Set-Reconciliation Sessions
//!
//! Stateful server side of the NEG-* exchange. A session is keyed by
//! (connection, subscription id) and wraps a sealed reconciler built over the
//! tenant's `(created_at, id)` items matching the snapshot filter. The
//! reconciliation algorithm itself is the `negentropy` crate; this worker
//! only owns session lifetime and the hex framing.
//!
//! Sessions die on `NEG-CLOSE` and on connection close. The server never
//! terminates an exchange on its own: the initiating client decides when the
//! diff is complete.

use std::collections::HashMap;
use std::sync::Arc;

use negentropy::{Bytes, Negentropy};
use tracing::{debug, warn};

use crate::config::Config;
use crate::directory::TenantDirectory;
use crate::error::Result;
use crate::filter::FilterGroup;
use crate::messages::{NegentropyMsg, Senders};
use crate::pool::Inbox;
use crate::registry::TenantRegistry;
use crate::store;
use crate::types::{ConnId, SubId, TenantId};

/// Identifier width of the reconciled items, in bytes.
const ID_SIZE: usize = 32;

#[derive(Clone)]
pub(crate) struct SyncCtx {
    pub cfg: Arc<Config>,
    pub registry: Arc<TenantRegistry>,
    pub directory: Arc<TenantDirectory>,
    pub senders: Senders,
}

struct Session {
    reconciler: Negentropy,
}

pub(crate) fn run(inbox: Inbox<NegentropyMsg>, ctx: SyncCtx) {
    let mut sessions: HashMap<(ConnId, SubId), Session> = HashMap::new();

    while let Some(batch) = inbox.pop_all() {
        for msg in batch {
            match msg {
                NegentropyMsg::Open {
                    conn_id,
                    sub_id,
                    tenant,
                    filters,
                    payload,
                } => match open_session(&ctx, &tenant, &filters, &payload) {
                    Ok((session, reply_hex)) => {
                        debug!(conn = %conn_id, sub = %sub_id, %tenant, "reconciliation session opened");
                        sessions.insert((conn_id, sub_id.clone()), session);
                        ctx.senders.send_neg_msg(conn_id, &sub_id, &reply_hex);
                    }
                    Err(err) => {
                        ctx.senders
                            .send_notice_error(conn_id, &format!("negentropy error: {err}"));
                    }
                },
                NegentropyMsg::Msg {
                    conn_id,
                    sub_id,
                    payload,
                } => {
                    let Some(session) = sessions.get_mut(&(conn_id, sub_id.clone())) else {
                        ctx.senders.send_notice_error(
                            conn_id,
                            "negentropy error: no session open for this subscription",
                        );
                        continue;
                    };
                    match session.reconciler.reconcile(&Bytes::from_slice(&payload)) {
                        Ok(reply) => {
                            ctx.senders.send_neg_msg(conn_id, &sub_id, &reply.to_hex());
                        }
                        Err(err) => {
                            warn!(conn = %conn_id, sub = %sub_id, %err, "reconciliation failed");
                            sessions.remove(&(conn_id, sub_id));
                            ctx.senders
                                .send_notice_error(conn_id, &format!("negentropy error: {err}"));
                        }
                    }
                }
                NegentropyMsg::Close { conn_id, sub_id } => {
                    sessions.remove(&(conn_id, sub_id));
                }
                NegentropyMsg::CloseConn(conn_id) => {
                    sessions.retain(|(c, _), _| *c != conn_id);
                }
                NegentropyMsg::Shutdown => return,
            }
        }
    }
}

/// Builds a sealed reconciler over the tenant's matching items and feeds it
/// the client's opening message.
fn open_session(
    ctx: &SyncCtx,
    tenant: &TenantId,
    filters: &FilterGroup,
    payload: &[u8],
) -> Result<(Session, String)> {
    let env = ctx.registry.get_env(tenant, &ctx.directory)?;
    let limit = ctx.cfg.relay.negentropy.max_sync_events + 1;

    let items = {
        let reader = env.reader()?;
        store::reconcile_items(&reader, filters, limit)?
    };

    let mut reconciler = Negentropy::new(
        ID_SIZE,
        Some(ctx.cfg.relay.negentropy.frame_size_limit),
    )?;
    for (created_at, id) in items {
        reconciler.add_item(created_at, Bytes::from_slice(&id))?;
    }
    reconciler.seal()?;

    let reply = reconciler.reconcile(&Bytes::from_slice(payload))?;
    Ok((Session { reconciler }, reply.to_hex()))
}
