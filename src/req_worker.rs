//! # Req Worker & Query Scheduler
//!
//! Historical backfill stage. A new subscription lands here, gets its
//! high-water mark pinned to the store's current `lev_id`, and is registered
//! with the worker's query scheduler. The scheduler round-robins all running
//! subscriptions, emitting bounded quanta of matching events per turn so one
//! huge query cannot starve the rest; between quanta the worker drains its
//! inbox without blocking, so removes and closes preempt long scans.
//!
//! When every filter of a subscription is exhausted (or its limit met), the
//! worker sends `EOSE` and hands the subscription to the req monitor with the
//! pinned high-water mark. Backfill never reads past that mark, which is one
//! half of the no-gap, no-duplicate handoff (the monitor's rescan is the
//! other).

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::Config;
use crate::directory::TenantDirectory;
use crate::error::Result;
use crate::event::PackedEvent;
use crate::filter::Filter;
use crate::messages::{MonitorMsg, ReqWorkerMsg, Senders};
use crate::pool::Inbox;
use crate::registry::TenantRegistry;
use crate::store::{self, AccessPath, TenantEnv};
use crate::subscription::Subscription;
use crate::types::{ConnId, SubId};

/// Candidate rows fetched per scheduler quantum.
const QUANTUM_ROWS: usize = 256;

#[derive(Clone)]
pub(crate) struct ReqWorkerCtx {
    pub cfg: Arc<Config>,
    pub registry: Arc<TenantRegistry>,
    pub directory: Arc<TenantDirectory>,
    pub senders: Senders,
}

pub(crate) fn run(inbox: Inbox<ReqWorkerMsg>, ctx: ReqWorkerCtx) {
    let mut queries = QueryScheduler::new(ctx.cfg.relay.max_subs_per_connection);

    loop {
        // Block only when idle; with scans in flight, poll so fresh messages
        // interleave with quanta.
        let batch = if queries.is_idle() {
            inbox.pop_all()
        } else {
            inbox.pop_all_no_wait()
        };
        let Some(batch) = batch else { return };

        for msg in batch {
            match msg {
                ReqWorkerMsg::NewSub(sub) => {
                    let conn_id = sub.conn_id;
                    match queries.add_sub(&ctx, *sub) {
                        Ok(true) => {}
                        Ok(false) => {
                            ctx.senders
                                .send_notice_error(conn_id, "too many concurrent REQs");
                        }
                        Err(err) => {
                            warn!(conn = %conn_id, %err, "failed to start subscription");
                            ctx.senders
                                .send_notice_error(conn_id, &format!("bad req: {err}"));
                        }
                    }
                }
                ReqWorkerMsg::RemoveSub { conn_id, sub_id } => {
                    queries.remove_sub(conn_id, &sub_id);
                    ctx.senders
                        .req_monitor
                        .dispatch(conn_id, MonitorMsg::RemoveSub { conn_id, sub_id });
                }
                ReqWorkerMsg::CloseConn(conn_id) => {
                    queries.close_conn(conn_id);
                    ctx.senders
                        .req_monitor
                        .dispatch(conn_id, MonitorMsg::CloseConn(conn_id));
                }
                ReqWorkerMsg::Shutdown => return,
            }
        }

        queries.process(&ctx);
    }
}

// =============================================================================
// Query Scheduler
// =============================================================================

struct FilterCursor {
    filter: Filter,
    path: AccessPath,
    /// Resumption point: the last (created_at, lev_id) already scanned.
    cursor: Option<(u64, u64)>,
    sent: usize,
    done: bool,
}

struct ActiveQuery {
    sub: Subscription,
    env: Arc<TenantEnv>,
    cursors: Vec<FilterCursor>,
    /// Which filter the next quantum advances.
    current: usize,
}

impl ActiveQuery {
    fn is_complete(&self) -> bool {
        self.cursors.iter().all(|c| c.done)
    }
}

struct QueryScheduler {
    running: Vec<ActiveQuery>,
    max_subs_per_conn: usize,
}

impl QueryScheduler {
    fn new(max_subs_per_conn: usize) -> Self {
        Self {
            running: Vec::new(),
            max_subs_per_conn,
        }
    }

    fn is_idle(&self) -> bool {
        self.running.is_empty()
    }

    /// Registers a subscription for backfill. Returns false when the
    /// connection is at its subscription cap.
    fn add_sub(&mut self, ctx: &ReqWorkerCtx, mut sub: Subscription) -> Result<bool> {
        let open = self
            .running
            .iter()
            .filter(|q| q.sub.conn_id == sub.conn_id)
            .count();
        if open >= self.max_subs_per_conn {
            return Ok(false);
        }

        let env = ctx.registry.get_env(&sub.tenant, &ctx.directory)?;
        {
            let reader = env.reader()?;
            sub.latest_event_id = store::max_lev_id(&reader)?;
        }

        let cursors = sub
            .filters
            .filters()
            .iter()
            .map(|f| FilterCursor {
                path: store::choose_path(f),
                filter: f.clone(),
                cursor: None,
                sent: 0,
                done: false,
            })
            .collect();

        debug!(conn = %sub.conn_id, sub = %sub.sub_id, tenant = %sub.tenant, "backfill started");
        self.running.push(ActiveQuery {
            sub,
            env,
            cursors,
            current: 0,
        });
        Ok(true)
    }

    fn remove_sub(&mut self, conn_id: ConnId, sub_id: &SubId) {
        self.running
            .retain(|q| !(q.sub.conn_id == conn_id && q.sub.sub_id == *sub_id));
    }

    fn close_conn(&mut self, conn_id: ConnId) {
        self.running.retain(|q| q.sub.conn_id != conn_id);
    }

    /// One quantum for every running subscription, completing the finished
    /// ones: `EOSE` then hand-off to the monitor.
    fn process(&mut self, ctx: &ReqWorkerCtx) {
        let mut i = 0;
        while i < self.running.len() {
            if let Err(err) = run_quantum(ctx, &mut self.running[i]) {
                let q = self.running.swap_remove(i);
                warn!(conn = %q.sub.conn_id, sub = %q.sub.sub_id, %err, "backfill failed");
                ctx.senders
                    .send_notice_error(q.sub.conn_id, &format!("query failed: {err}"));
                continue;
            }

            if self.running[i].is_complete() {
                let q = self.running.swap_remove(i);
                ctx.senders.send_eose(q.sub.conn_id, &q.sub.sub_id);
                ctx.senders
                    .req_monitor
                    .dispatch(q.sub.conn_id, MonitorMsg::NewSub(Box::new(q.sub)));
                continue;
            }
            i += 1;
        }
    }
}

/// Advances one filter cursor by one page, emitting matches.
fn run_quantum(ctx: &ReqWorkerCtx, query: &mut ActiveQuery) -> Result<()> {
    // Skip to the next unfinished filter.
    while query.current < query.cursors.len() && query.cursors[query.current].done {
        query.current += 1;
    }
    if query.current >= query.cursors.len() {
        query.current = 0;
        if query.is_complete() {
            return Ok(());
        }
        return run_quantum(ctx, query);
    }

    let fc = &mut query.cursors[query.current];
    let reader = query.env.reader()?;
    let page = store::backfill_page(
        &reader,
        &fc.filter,
        fc.path,
        fc.cursor,
        query.sub.latest_event_id,
        QUANTUM_ROWS,
    )?;
    let exhausted = page.len() < QUANTUM_ROWS || fc.path == AccessPath::Ids;

    for row in &page {
        if let Some(limit) = fc.filter.limit {
            if fc.sent >= limit {
                break;
            }
        }
        fc.cursor = Some((row.created_at, row.lev_id));
        if fc.filter.matches(&PackedEvent::new(&row.packed)) {
            ctx.senders
                .send_event(query.sub.conn_id, &query.sub.sub_id, &row.json);
            fc.sent += 1;
        }
    }

    let limit_met = fc.filter.limit.is_some_and(|l| fc.sent >= l);
    if exhausted || limit_met {
        fc.done = true;
    }

    // Round-robin across this subscription's filters.
    query.current = (query.current + 1) % query.cursors.len();
    Ok(())
}
