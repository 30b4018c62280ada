//! # Writer
//!
//! Durable append stage. A single worker owns the write path: for each
//! incoming event it runs one read-write transaction that re-checks id
//! existence (the ingester's pre-check races with other connections on the
//! same tenant), allocates the next `lev_id`, and installs the primary record
//! with every secondary index entry.
//!
//! The writer never notifies the live monitor; monitors observe the storage
//! files changing through the filesystem watcher instead.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::directory::TenantDirectory;
use crate::error::Result;
use crate::messages::{AddEvent, Senders, WriterMsg};
use crate::pool::Inbox;
use crate::registry::TenantRegistry;
use crate::store::{self, InsertOutcome};

#[derive(Clone)]
pub(crate) struct WriterCtx {
    pub registry: Arc<TenantRegistry>,
    pub directory: Arc<TenantDirectory>,
    pub senders: Senders,
}

pub(crate) fn run(inbox: Inbox<WriterMsg>, ctx: WriterCtx) {
    while let Some(batch) = inbox.pop_all() {
        for msg in batch {
            match msg {
                WriterMsg::AddEvent(add) => {
                    let conn_id = add.conn_id;
                    let id_hex = add.verified.event.id_hex();
                    match commit_event(&ctx, &add) {
                        Ok(InsertOutcome::Stored(lev_id)) => {
                            debug!(
                                conn = %conn_id,
                                tenant = %add.tenant,
                                ip = %add.ip_addr,
                                lev_id,
                                id = %id_hex,
                                "stored event"
                            );
                            ctx.senders.send_ok(conn_id, &id_hex, true, "");
                        }
                        Ok(InsertOutcome::Duplicate) => {
                            ctx.senders
                                .send_ok(conn_id, &id_hex, true, "duplicate: have this event");
                        }
                        Err(err) => {
                            warn!(conn = %conn_id, tenant = %add.tenant, %err, "commit failed");
                            ctx.senders
                                .send_ok(conn_id, &id_hex, false, &format!("error: {err}"));
                        }
                    }
                }
                // No per-connection buffering lives here; the handler exists
                // for pipeline symmetry.
                WriterMsg::CloseConn(_) => {}
                WriterMsg::Shutdown => return,
            }
        }
    }
}

fn commit_event(ctx: &WriterCtx, add: &AddEvent) -> Result<InsertOutcome> {
    let env = ctx.registry.get_env(&add.tenant, &ctx.directory)?;
    let mut conn = env.writer();
    store::insert_event(&mut conn, &add.verified)
}
