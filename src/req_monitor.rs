//! # Req Monitor
//!
//! Live tailing stage. Per tenant the worker keeps the set of active
//! subscriptions, the tenant's `curr_event_id` scan position, and a debounced
//! watcher on the tenant's storage directory. A storage change broadcasts
//! `DbChange{tenant}` to every monitor worker, because one tenant's
//! subscriptions may be pinned to any of them.
//!
//! On hand-off from the req worker, the monitor rescans everything committed
//! after the subscription's high-water mark before registering it. That
//! rescan closes the window between `EOSE` and registration; without it an
//! event committed in that window would be lost.
//!
//! `RemoveSub` and `CloseConn` sweep every tenant's monitor, since this pool
//! does not index subscriptions by tenant. That is O(tenants) per close and
//! accepted at current scale.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::Config;
use crate::directory::TenantDirectory;
use crate::error::Result;
use crate::event::PackedEvent;
use crate::messages::{MonitorMsg, Senders};
use crate::pool::Inbox;
use crate::registry::TenantRegistry;
use crate::store::{self, StoredEvent};
use crate::subscription::Subscription;
use crate::types::{ConnId, SubId, TenantId};
use crate::watcher::{DebouncedWatcher, DEBOUNCE};

#[derive(Clone)]
pub(crate) struct MonitorCtx {
    pub cfg: Arc<Config>,
    pub registry: Arc<TenantRegistry>,
    pub directory: Arc<TenantDirectory>,
    pub senders: Senders,
}

/// Per-tenant live state owned by one monitor worker.
struct TenantMonitor {
    monitors: ActiveMonitors,
    /// Highest `lev_id` this worker has already fanned out for the tenant.
    curr_event_id: u64,
    _watcher: DebouncedWatcher,
}

pub(crate) fn run(inbox: Inbox<MonitorMsg>, ctx: MonitorCtx) {
    let mut tenants: HashMap<TenantId, TenantMonitor> = HashMap::new();

    while let Some(batch) = inbox.pop_all() {
        for msg in batch {
            match msg {
                MonitorMsg::NewSub(sub) => {
                    if let Err(err) = register_sub(&ctx, &mut tenants, *sub) {
                        warn!(%err, "failed to register live subscription");
                    }
                }
                MonitorMsg::RemoveSub { conn_id, sub_id } => {
                    for tm in tenants.values_mut() {
                        tm.monitors.remove_sub(conn_id, &sub_id);
                    }
                }
                MonitorMsg::CloseConn(conn_id) => {
                    for tm in tenants.values_mut() {
                        tm.monitors.close_conn(conn_id);
                    }
                }
                MonitorMsg::DbChange(tenant) => {
                    if let Some(tm) = tenants.get_mut(&tenant) {
                        if let Err(err) = fan_out_changes(&ctx, &tenant, tm) {
                            warn!(%tenant, %err, "change fan-out failed");
                        }
                    }
                }
                MonitorMsg::Shutdown => return,
            }
        }
    }
}

fn register_sub(
    ctx: &MonitorCtx,
    tenants: &mut HashMap<TenantId, TenantMonitor>,
    mut sub: Subscription,
) -> Result<()> {
    let conn_id = sub.conn_id;
    let env = ctx.registry.get_env(&sub.tenant, &ctx.directory)?;

    if !tenants.contains_key(&sub.tenant) {
        let tenant = sub.tenant.clone();
        let senders = ctx.senders.clone();
        let watch_tenant = tenant.clone();
        let watcher = DebouncedWatcher::new(env.dir(), DEBOUNCE, move || {
            senders
                .req_monitor
                .dispatch_all(|| MonitorMsg::DbChange(watch_tenant.clone()));
        })?;
        tenants.insert(
            tenant.clone(),
            TenantMonitor {
                monitors: ActiveMonitors::default(),
                curr_event_id: u64::MAX,
                _watcher: watcher,
            },
        );
        debug!(%tenant, "started tenant monitor");
    }
    let tm = tenants.get_mut(&sub.tenant).expect("inserted above");

    let reader = env.reader()?;
    let latest = store::max_lev_id(&reader)?;
    if tm.curr_event_id > latest {
        tm.curr_event_id = latest;
    }

    // Close the hand-off gap: deliver anything committed after the backfill
    // high-water mark before the subscription goes live.
    for row in store::events_after(&reader, sub.latest_event_id)? {
        if sub.filters.matches(&PackedEvent::new(&row.packed)) {
            ctx.senders.send_event(conn_id, &sub.sub_id, &row.json);
        }
    }
    sub.latest_event_id = latest;

    if !tm
        .monitors
        .add_sub(sub, ctx.cfg.relay.max_subs_per_connection)
    {
        ctx.senders
            .send_notice_error(conn_id, "too many concurrent REQs");
    }
    Ok(())
}

fn fan_out_changes(ctx: &MonitorCtx, tenant: &TenantId, tm: &mut TenantMonitor) -> Result<()> {
    let env = ctx.registry.get_env(tenant, &ctx.directory)?;
    let reader = env.reader()?;
    let mut latest = store::max_lev_id(&reader)?;

    for row in store::events_after(&reader, tm.curr_event_id)? {
        latest = latest.max(row.lev_id);
        let recipients = tm.monitors.process(&row);
        if !recipients.is_empty() {
            ctx.senders.send_event_batch(recipients, row.json);
        }
    }
    tm.curr_event_id = latest;
    Ok(())
}

// =============================================================================
// Active Monitors
// =============================================================================

/// The live subscriptions for one tenant on one worker, keyed by connection.
#[derive(Default)]
struct ActiveMonitors {
    conns: HashMap<ConnId, HashMap<SubId, Subscription>>,
}

impl ActiveMonitors {
    /// Registers a subscription; false when the connection is at capacity.
    fn add_sub(&mut self, sub: Subscription, max_per_conn: usize) -> bool {
        let subs = self.conns.entry(sub.conn_id).or_default();
        if !subs.contains_key(&sub.sub_id) && subs.len() >= max_per_conn {
            return false;
        }
        subs.insert(sub.sub_id.clone(), sub);
        true
    }

    fn remove_sub(&mut self, conn_id: ConnId, sub_id: &SubId) {
        if let Some(subs) = self.conns.get_mut(&conn_id) {
            subs.remove(sub_id);
            if subs.is_empty() {
                self.conns.remove(&conn_id);
            }
        }
    }

    fn close_conn(&mut self, conn_id: ConnId) {
        self.conns.remove(&conn_id);
    }

    /// Matches one committed event against every live subscription, advancing
    /// each matching subscription's high-water mark.
    fn process(&mut self, row: &StoredEvent) -> Vec<(ConnId, SubId)> {
        let packed = PackedEvent::new(&row.packed);
        let mut recipients = Vec::new();
        for subs in self.conns.values_mut() {
            for sub in subs.values_mut() {
                if row.lev_id > sub.latest_event_id && sub.filters.matches(&packed) {
                    sub.latest_event_id = row.lev_id;
                    recipients.push((sub.conn_id, sub.sub_id.clone()));
                }
            }
        }
        recipients
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::filter::FilterGroup;

    fn sub(conn: u64, sub_id: &str, kinds: serde_json::Value) -> Subscription {
        let filters = FilterGroup::from_req(&[serde_json::json!({ "kinds": kinds })]).unwrap();
        let mut s = Subscription::new(
            ConnId::from_raw(conn),
            SubId::new(sub_id).unwrap(),
            filters,
            TenantId::default_tenant(),
        );
        s.latest_event_id = 0;
        s
    }

    fn row(lev_id: u64, kind: u64) -> StoredEvent {
        let ev = Event {
            id: [lev_id as u8; 32],
            pubkey: [0; 32],
            created_at: 1000,
            kind,
            tags: vec![],
            content: String::new(),
            sig: [0; 64],
        };
        StoredEvent {
            lev_id,
            created_at: 1000,
            packed: ev.pack(),
            json: ev.to_json(),
        }
    }

    #[test]
    fn process_matches_and_advances_watermark() {
        let mut monitors = ActiveMonitors::default();
        assert!(monitors.add_sub(sub(1, "a", serde_json::json!([1])), 10));
        assert!(monitors.add_sub(sub(2, "b", serde_json::json!([2])), 10));

        let recipients = monitors.process(&row(5, 1));
        assert_eq!(recipients.len(), 1);
        assert_eq!(recipients[0].0, ConnId::from_raw(1));

        // Same lev_id again: watermark advanced, so nobody gets it twice.
        assert!(monitors.process(&row(5, 1)).is_empty());
    }

    #[test]
    fn capacity_is_per_connection() {
        let mut monitors = ActiveMonitors::default();
        assert!(monitors.add_sub(sub(1, "a", serde_json::json!([1])), 2));
        assert!(monitors.add_sub(sub(1, "b", serde_json::json!([1])), 2));
        assert!(!monitors.add_sub(sub(1, "c", serde_json::json!([1])), 2));
        // Replacing an existing sub id is not a capacity violation.
        assert!(monitors.add_sub(sub(1, "b", serde_json::json!([2])), 2));
        // Other connections are unaffected.
        assert!(monitors.add_sub(sub(2, "a", serde_json::json!([1])), 2));
    }

    #[test]
    fn close_conn_drops_all_subs() {
        let mut monitors = ActiveMonitors::default();
        monitors.add_sub(sub(1, "a", serde_json::json!([1])), 10);
        monitors.add_sub(sub(1, "b", serde_json::json!([1])), 10);
        monitors.close_conn(ConnId::from_raw(1));
        assert!(monitors.process(&row(9, 1)).is_empty());
    }
}
