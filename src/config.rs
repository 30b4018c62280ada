//! # Relay Configuration
//!
//! Plain deserializable structs for everything the core consumes. The loader
//! (file watching, format, reload) is the embedder's concern; this module only
//! defines the shape and the defaults. Field names mirror the external key
//! names (`relay.serviceUrl`, `dbParams.mapsize`, ...) via serde renames.

use std::path::PathBuf;

use serde::Deserialize;

/// Top-level configuration consumed by the relay core.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Root data directory. Tenant environments live under
    /// `{dbDir}/tenants/{tenantId}/`.
    pub db_dir: PathBuf,

    pub relay: RelayConfig,

    pub db_params: DbParams,
}

impl Config {
    /// A configuration rooted at `db_dir` with every other key defaulted.
    pub fn new(db_dir: impl Into<PathBuf>) -> Self {
        Self {
            db_dir: db_dir.into(),
            ..Self::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_dir: PathBuf::from("./relay-db"),
            relay: RelayConfig::default(),
            db_params: DbParams::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RelayConfig {
    /// Public URL of this relay (`wss://...`). Required for AUTH: when empty,
    /// protected events are flatly rejected and `AUTH` frames fail.
    pub service_url: String,

    /// Maximum number of filters accepted in one `REQ` frame.
    pub max_req_filter_size: usize,

    /// Maximum concurrent subscriptions per connection, enforced both during
    /// backfill and in the live monitor.
    pub max_subs_per_connection: usize,

    pub num_threads: ThreadCounts,

    pub logging: LoggingConfig,

    pub negentropy: NegentropyConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            service_url: String::new(),
            max_req_filter_size: 200,
            max_subs_per_connection: 20,
            num_threads: ThreadCounts::default(),
            logging: LoggingConfig::default(),
            negentropy: NegentropyConfig::default(),
        }
    }
}

/// Worker counts per pool. The writer and websocket pools are fixed at one
/// worker each; only the fan-out pools scale.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ThreadCounts {
    pub ingester: usize,
    pub req_worker: usize,
    pub req_monitor: usize,
    pub negentropy: usize,
}

impl Default for ThreadCounts {
    fn default() -> Self {
        Self {
            ingester: 3,
            req_worker: 3,
            req_monitor: 3,
            negentropy: 2,
        }
    }
}

/// Verbose mirroring of inbound traffic to the log, at debug level.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingConfig {
    pub dump_in_all: bool,
    pub dump_in_events: bool,
    pub dump_in_reqs: bool,
    pub invalid_events: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NegentropyConfig {
    /// Gates all `NEG-*` commands.
    pub enabled: bool,

    /// Per-session cap on the reconciled event set. The snapshot filter limit
    /// is this value plus one, so an over-full set is detectable.
    pub max_sync_events: usize,

    /// Upper bound on a single reconciliation message, in bytes.
    pub frame_size_limit: u64,
}

impl Default for NegentropyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_sync_events: 1_000_000,
            frame_size_limit: 131_072,
        }
    }
}

/// Storage environment tuning, applied when a tenant environment is opened.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DbParams {
    /// Memory-map budget per environment, in bytes. Zero disables mapping.
    pub mapsize: u64,

    /// Cap on pooled read-only connections per environment.
    pub maxreaders: usize,

    /// Disables the memory map entirely, overriding `mapsize`, for hosts
    /// where paging ahead of the working set hurts more than it helps.
    pub no_read_ahead: bool,
}

impl Default for DbParams {
    fn default() -> Self {
        Self {
            mapsize: 0,
            maxreaders: 16,
            no_read_ahead: false,
        }
    }
}
