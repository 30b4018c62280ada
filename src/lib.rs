//! # SpiteRelay - Multi-Tenant Event Relay
//!
//! SpiteRelay accepts, stores, and distributes signed events over a framed
//! bidirectional connection. Clients publish events, open live filtered
//! subscriptions, and run set-reconciliation sessions to synchronize
//! history. Tenancy is derived from each connection's external addressing
//! (URL path, falling back to hostname), and every tenant gets an isolated
//! SQLite-backed event store with its own access policy.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Transport (embedder)                       │
//! │                 accept / message / disconnect                   │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Staged worker pipeline                       │
//! │                                                                 │
//! │  Ingester ─► Writer ─(storage watcher)─► Req Monitor ─► Ws out  │
//! │     │                                        ▲                  │
//! │     ├──► Req Worker (backfill, EOSE) ────────┘                  │
//! │     └──► Negentropy (reconciliation sessions)                   │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │            Per-tenant SQLite environments (WAL)                 │
//! │            {dbDir}/tenants/{tenantId}/events.db                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Per-tenant sequence**: `lev_id` strictly increases per tenant in
//!    commit order and is never reused.
//! 2. **At most one record per id**: the event-by-id index is unique; a
//!    republish is answered `duplicate:` with no side effect.
//! 3. **Delivery monotonicity**: for each subscription the stream
//!    `EVENT*, EOSE, EVENT*` never revisits a sequence number; backfill is
//!    bounded by the high-water mark the tail phase starts after.
//! 4. **AUTH before protected commit**: a protected event is only committed
//!    when the same connection previously authenticated its author key.
//! 5. **Connection affinity**: all per-connection state is worker-local;
//!    messages for one connection are pinned to one worker per pool.

pub mod config;
pub mod directory;
pub mod error;
pub mod event;
pub mod filter;
pub mod registry;
pub mod store;
pub mod subscription;
pub mod types;
pub mod wire;

mod ingester;
mod messages;
mod pool;
mod relay;
mod req_monitor;
mod req_worker;
mod sync;
mod watcher;
mod writer;

pub use config::Config;
pub use error::{Error, Result};
pub use event::{Event, PackedEvent, VerifiedEvent};
pub use filter::{Filter, FilterGroup};
pub use relay::{Relay, Transport};
pub use subscription::Subscription;
pub use types::{ConnId, SubId, TenantId};
