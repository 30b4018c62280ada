//! # Subscriptions
//!
//! A subscription is owned by exactly one connection and moves through two
//! phases: historical backfill inside the req worker, then live tailing
//! inside the req monitor. The `latest_event_id` high-water mark is what
//! stitches the phases together without gaps or duplicates: backfill never
//! reads past it, the monitor never replays at or below it.

use crate::filter::FilterGroup;
use crate::types::{ConnId, SubId, TenantId};

/// The sequence high-water mark of a subscription that has not yet observed
/// any store state.
pub const LATEST_UNSET: u64 = u64::MAX;

#[derive(Debug)]
pub struct Subscription {
    pub conn_id: ConnId,
    pub sub_id: SubId,
    pub filters: FilterGroup,
    pub tenant: TenantId,

    /// Largest `lev_id` already delivered (or deliberately skipped) for this
    /// subscription. Events at or below this mark are never sent again.
    pub latest_event_id: u64,
}

impl Subscription {
    pub fn new(conn_id: ConnId, sub_id: SubId, filters: FilterGroup, tenant: TenantId) -> Self {
        Self {
            conn_id,
            sub_id,
            filters,
            tenant,
            latest_event_id: LATEST_UNSET,
        }
    }
}
